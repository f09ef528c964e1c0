//! Benchmarks for the hot paths: trial decryption over a candidate set and
//! UserContext candidate-order maintenance.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ssfront::cipher::{derive_subkey, CipherSpec, NONCE_LEN};
use ssfront::config::Server;
use ssfront::dispatcher::auth_tcp;
use ssfront::usercontext::{InsertStrategy, UserContext};

use aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;

fn make_server(i: usize) -> Server {
    Server {
        target: format!("127.0.0.1:{}", 10000 + i),
        tcp_fast_open: false,
        cipher: CipherSpec::new("chacha20-ietf-poly1305", &format!("password-{i}")).unwrap(),
        upstream_tag: None,
    }
}

fn encode_prefix(spec: &CipherSpec, salt: &[u8]) -> Vec<u8> {
    let subkey = derive_subkey(&spec.master_key, salt, spec.kind.key_len()).unwrap();
    let aead_cipher = ChaCha20Poly1305::new_from_slice(&subkey).unwrap();
    let nonce = aead::generic_array::GenericArray::from_slice(&[0u8; NONCE_LEN]);
    let enc_len = aead_cipher.encrypt(nonce, 11u16.to_be_bytes().as_slice()).unwrap();
    let enc_payload = aead_cipher.encrypt(nonce, b"hello world".as_slice()).unwrap();
    let mut out = Vec::new();
    out.extend_from_slice(salt);
    out.extend_from_slice(&enc_len);
    out.extend_from_slice(&enc_payload);
    out
}

fn bench_auth_tcp_worst_case(c: &mut Criterion) {
    // UserContext::new spawns its decay task with tokio::spawn, which needs
    // an entered runtime even though this benchmark never awaits anything.
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut group = c.benchmark_group("auth_tcp_worst_case");
    for n in [1usize, 8, 64, 512] {
        let servers: Vec<Server> = (0..n).map(make_server).collect();
        let target = servers.last().unwrap().clone();
        let ctx = UserContext::new(servers, InsertStrategy::InsertFront);
        let snapshot = ctx.snapshot();
        let salt = vec![3u8; target.cipher.kind.salt_len()];
        let prefix = encode_prefix(&target.cipher, &salt);

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| auth_tcp(&snapshot, &prefix));
        });
        ctx.close();
    }
    group.finish();
}

fn bench_promote(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let servers: Vec<Server> = (0..64).map(make_server).collect();
    let ctx = UserContext::new(servers, InsertStrategy::InsertFront);
    let snapshot = ctx.snapshot();
    c.bench_function("promote_single_node", |b| {
        b.iter(|| snapshot[0].promote());
    });
    ctx.close();
}

criterion_group!(benches, bench_auth_tcp_worst_case, bench_promote);
criterion_main!(benches);
