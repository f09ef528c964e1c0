//! Cipher registry, key derivation, and zero-nonce trial decryption.
//!
//! Every AEAD operation this relay performs uses the all-zero nonce of the
//! cipher's configured length: only the first record of a TCP stream, or
//! each UDP datagram, is ever trial-decrypted (see spec §4.1/4.2 in
//! `SPEC_FULL.md`).

use crate::{Error, Result};
use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// One of the four Shadowsocks AEAD ciphers this relay speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    ChaCha20IetfPoly1305,
}

impl CipherKind {
    /// Master/subkey length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20Poly1305 => 32,
            CipherKind::ChaCha20IetfPoly1305 => 32,
        }
    }

    /// Per-session salt length; always equal to the key length.
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    pub fn nonce_len(&self) -> usize {
        NONCE_LEN
    }

    pub fn tag_len(&self) -> usize {
        TAG_LEN
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-poly1305",
            CipherKind::ChaCha20IetfPoly1305 => "chacha20-ietf-poly1305",
        }
    }
}

impl TryFrom<&str> for CipherKind {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            "chacha20-ietf-poly1305" => Ok(CipherKind::ChaCha20IetfPoly1305),
            other => Err(Error::config(format!("unsupported cipher: {other}"))),
        }
    }
}

/// OpenSSL's legacy `EVP_BytesToKey` with MD5, used to turn a password into
/// a master key of `key_len` bytes. Not secure password hashing; reproduced
/// bit-exact for wire compatibility with the Shadowsocks AEAD construction.
pub fn derive_master_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + Md5::output_size());
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        let digest = hasher.finalize();
        key.extend_from_slice(&digest);
        prev = digest.to_vec();
    }
    key.truncate(key_len);
    key
}

/// Per-session subkey: `HKDF-SHA1(masterKey, salt, "ss-subkey", keyLen)`.
pub fn derive_subkey(master_key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(b"ss-subkey", &mut subkey)
        .map_err(|e| Error::crypto(format!("hkdf expand failed: {e}")))?;
    Ok(subkey)
}

/// Opens `ciphertext` (which includes the trailing tag) with the all-zero
/// nonce under `subkey`, for the given cipher. Returns the decrypted bytes
/// on success, or `None` on tag-verification failure (a non-matching key,
/// the expected outcome during trial decryption — not logged as an error).
pub fn zero_nonce_open(kind: CipherKind, subkey: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let nonce = aead::generic_array::GenericArray::from_slice(&[0u8; NONCE_LEN]);
    let payload = Payload {
        msg: ciphertext,
        aad: &[],
    };
    match kind {
        CipherKind::Aes128Gcm => {
            let cipher = Aes128Gcm::new_from_slice(subkey).ok()?;
            cipher.decrypt(nonce, payload).ok()
        }
        CipherKind::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(subkey).ok()?;
            cipher.decrypt(nonce, payload).ok()
        }
        CipherKind::ChaCha20Poly1305 | CipherKind::ChaCha20IetfPoly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(subkey).ok()?;
            cipher.decrypt(nonce, payload).ok()
        }
    }
}

/// Checks a decrypted plaintext's first byte against the three valid
/// Shadowsocks address types (1 = IPv4, 3 = domain, 4 = IPv6). Used to
/// reject candidates after `zero_nonce_open` succeeds but the body is
/// structurally not a Shadowsocks datagram.
pub fn looks_like_valid_atyp(plaintext_byte0: u8) -> bool {
    matches!(plaintext_byte0, 0x01 | 0x03 | 0x04)
}

/// Registry entry bundling a cipher kind with a server's derived master key.
#[derive(Clone)]
pub struct CipherSpec {
    pub kind: CipherKind,
    pub master_key: Vec<u8>,
}

impl CipherSpec {
    pub fn new(method: &str, password: &str) -> Result<Self> {
        let kind = CipherKind::try_from(method)?;
        let master_key = derive_master_key(password.as_bytes(), kind.key_len());
        Ok(CipherSpec { kind, master_key })
    }

    /// Attempt a zero-nonce open of `ciphertext` using `salt` to derive this
    /// spec's session subkey. `None` on a non-matching key or malformed salt.
    pub fn try_open(&self, salt: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        if salt.len() != self.kind.salt_len() {
            return None;
        }
        let subkey = derive_subkey(&self.master_key, salt, self.kind.key_len()).ok()?;
        zero_nonce_open(self.kind, &subkey, ciphertext)
    }
}
