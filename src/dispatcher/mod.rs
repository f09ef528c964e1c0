//! TCP and UDP relay state machines, and the shared trial-decryption
//! ("Auth") step both use to identify which candidate server owns a
//! connection or datagram.

pub mod tcp;
pub mod udp;

use crate::cipher;
use crate::usercontext::Node;
use std::sync::Arc;

pub const SALT_MAX_LEN: usize = 32; // largest cipher's salt/key length
pub const BASIC_LEN: usize = SALT_MAX_LEN + 2 + 16;
pub const MAX_TCP_RECORD_LEN: usize = BASIC_LEN + 16383 + 16;

/// Tries each candidate in `snapshot` order against the TCP initial record's
/// `enc_len || len_tag` block. On a hit, promotes the node and returns it
/// along with the decrypted 2-byte length.
pub fn auth_tcp(snapshot: &[Arc<Node>], prefix: &[u8]) -> Option<(Arc<Node>, [u8; 2])> {
    for node in snapshot {
        let salt_len = node.server.cipher.kind.salt_len();
        if prefix.len() < salt_len + 2 + 16 {
            continue;
        }
        let salt = &prefix[..salt_len];
        let enc_len_block = &prefix[salt_len..salt_len + 2 + 16];
        if let Some(plain) = node.server.cipher.try_open(salt, enc_len_block) {
            node.promote();
            let mut len_bytes = [0u8; 2];
            len_bytes.copy_from_slice(&plain[..2]);
            return Some((node.clone(), len_bytes));
        }
    }
    None
}

/// Tries each candidate in `snapshot` order against a full UDP datagram
/// body (`salt || enc_payload || tag`). On a hit, promotes the node and
/// returns the decrypted payload.
pub fn auth_udp(snapshot: &[Arc<Node>], datagram: &[u8]) -> Option<(Arc<Node>, Vec<u8>)> {
    for node in snapshot {
        let salt_len = node.server.cipher.kind.salt_len();
        let tag_len = node.server.cipher.kind.tag_len();
        if datagram.len() < salt_len + tag_len {
            continue;
        }
        let salt = &datagram[..salt_len];
        let body = &datagram[salt_len..];
        if let Some(plain) = node.server.cipher.try_open(salt, body) {
            if plain.is_empty() || !cipher::looks_like_valid_atyp(plain[0]) {
                continue;
            }
            node.promote();
            return Some((node.clone(), plain));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherSpec, NONCE_LEN};
    use crate::config::Server;
    use crate::usercontext::{InsertStrategy, UserContext};
    use aead::{Aead, KeyInit};
    use chacha20poly1305::ChaCha20Poly1305;

    fn server(method: &str, password: &str, target: &str) -> Server {
        Server {
            target: target.to_string(),
            tcp_fast_open: false,
            cipher: CipherSpec::new(method, password).unwrap(),
            upstream_tag: None,
        }
    }

    fn encode_tcp_prefix(spec: &CipherSpec, salt: &[u8], len: u16, payload: &[u8]) -> Vec<u8> {
        let subkey = cipher::derive_subkey(&spec.master_key, salt, spec.kind.key_len()).unwrap();
        let aead = ChaCha20Poly1305::new_from_slice(&subkey).unwrap();
        let nonce = aead::generic_array::GenericArray::from_slice(&[0u8; NONCE_LEN]);
        let enc_len = aead.encrypt(nonce, len.to_be_bytes().as_slice()).unwrap();
        let enc_payload = aead.encrypt(nonce, payload).unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(salt);
        out.extend_from_slice(&enc_len);
        out.extend_from_slice(&enc_payload);
        out
    }

    #[tokio::test]
    async fn test_auth_tcp_finds_matching_candidate() {
        let target_server = server("chacha20-ietf-poly1305", "p", "127.0.0.1:9000");
        let decoy = server("aes-128-gcm", "q", "127.0.0.1:9001");
        let salt = vec![9u8; target_server.cipher.kind.salt_len()];
        let prefix = encode_tcp_prefix(&target_server.cipher, &salt, 11, b"hello world");

        let ctx = UserContext::new(vec![decoy, target_server], InsertStrategy::InsertFront);
        let snap = ctx.snapshot();
        let (node, len_bytes) = auth_tcp(&snap, &prefix).unwrap();
        assert_eq!(node.server.target, "127.0.0.1:9000");
        assert_eq!(u16::from_be_bytes(len_bytes), 11);
        ctx.close();
    }

    #[tokio::test]
    async fn test_auth_tcp_no_match() {
        let s = server("aes-128-gcm", "p", "t");
        let ctx = UserContext::new(vec![s], InsertStrategy::InsertFront);
        let snap = ctx.snapshot();
        let garbage = vec![0u8; BASIC_LEN];
        assert!(auth_tcp(&snap, &garbage).is_none());
        ctx.close();
    }

    #[tokio::test]
    async fn test_auth_udp_rejects_bad_atyp_payload() {
        let s = server("chacha20-ietf-poly1305", "p", "t");
        let salt = vec![1u8; s.cipher.kind.salt_len()];
        let subkey = cipher::derive_subkey(&s.cipher.master_key, &salt, s.cipher.kind.key_len()).unwrap();
        let aead_cipher = ChaCha20Poly1305::new_from_slice(&subkey).unwrap();
        let nonce = aead::generic_array::GenericArray::from_slice(&[0u8; NONCE_LEN]);
        // atyp byte 0x02 is not valid.
        let body = aead_cipher.encrypt(nonce, [0x02u8, 1, 2, 3].as_slice()).unwrap();
        let mut datagram = salt.clone();
        datagram.extend_from_slice(&body);

        let ctx = UserContext::new(vec![s], InsertStrategy::InsertFront);
        let snap = ctx.snapshot();
        assert!(auth_udp(&snap, &datagram).is_none());
        ctx.close();
    }

    #[tokio::test]
    async fn test_auth_udp_accepts_valid_atyp_payload() {
        let s = server("aes-256-gcm", "p", "t");
        let salt = vec![1u8; s.cipher.kind.salt_len()];
        let subkey = cipher::derive_subkey(&s.cipher.master_key, &salt, s.cipher.kind.key_len()).unwrap();
        let aead_cipher = aes_gcm::Aes256Gcm::new_from_slice(&subkey).unwrap();
        let nonce = aead::generic_array::GenericArray::from_slice(&[0u8; NONCE_LEN]);
        let payload = [0x01u8, 127, 0, 0, 1, 0, 53, b'd', b'n', b's'];
        let body = aead_cipher.encrypt(nonce, payload.as_slice()).unwrap();
        let mut datagram = salt.clone();
        datagram.extend_from_slice(&body);

        let ctx = UserContext::new(vec![s], InsertStrategy::InsertFront);
        let snap = ctx.snapshot();
        let (_, plain) = auth_udp(&snap, &datagram).unwrap();
        assert_eq!(plain, payload);
        ctx.close();
    }
}
