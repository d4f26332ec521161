#![forbid(unsafe_code)]

//! Algorithm-tagged AEAD seal/open: AES-256-GCM,
//! ChaCha20-Poly1305, and XChaCha20-Poly1305, each with a 32-byte key and a
//! 16-byte tag appended to the ciphertext.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use std::sync::OnceLock;
use zeroize::Zeroize;

use crate::{Error, Result};

/// Algorithm tag. Fixes key/IV/tag lengths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlgoTag {
    /// AES-256 in Galois/Counter Mode, 12-byte IV.
    Aes256Gcm,
    /// ChaCha20-Poly1305 (RFC 8439), 12-byte IV.
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305, 24-byte extended IV.
    XChaCha20Poly1305,
}

impl AlgoTag {
    /// Key length in bytes (always 32 for the algorithms this crate supports).
    pub const fn key_len(self) -> usize {
        32
    }

    /// IV length in bytes.
    pub const fn iv_len(self) -> usize {
        match self {
            AlgoTag::Aes256Gcm | AlgoTag::ChaCha20Poly1305 => 12,
            AlgoTag::XChaCha20Poly1305 => 24,
        }
    }

    /// Authentication tag length in bytes (always 16).
    pub const fn tag_len(self) -> usize {
        16
    }

    /// The little-endian u32 wire value for this tag.
    pub const fn wire_value(self) -> u32 {
        match self {
            AlgoTag::Aes256Gcm => 0,
            AlgoTag::ChaCha20Poly1305 => 1,
            AlgoTag::XChaCha20Poly1305 => 2,
        }
    }

    /// Parse the wire value back into a tag.
    pub fn from_wire_value(v: u32) -> Result<Self> {
        match v {
            0 => Ok(AlgoTag::Aes256Gcm),
            1 => Ok(AlgoTag::ChaCha20Poly1305),
            2 => Ok(AlgoTag::XChaCha20Poly1305),
            other => Err(Error::Integrity(format!("unknown algorithm tag {other}"))),
        }
    }
}

/// A 32-byte AEAD key, zeroized on drop.
#[derive(Clone)]
pub struct AeadKey(pub [u8; 32]);

impl Drop for AeadKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

enum CipherImpl {
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    XChaCha20Poly1305(Box<XChaCha20Poly1305>),
}

/// A keyed AEAD cipher bound to one [`AlgoTag`]. The underlying cipher
/// instance is built lazily and cached, mirroring the pre-computed-cipher
/// pattern used for the session AEAD below.
pub struct AeadCipher {
    algo: AlgoTag,
    key: AeadKey,
    cipher: OnceLock<CipherImpl>,
}

impl AeadCipher {
    /// Bind a key to an algorithm. `AeadKey` is a fixed 32-byte array and
    /// every supported `AlgoTag` takes a 32-byte key, so this can never fail.
    pub fn new(algo: AlgoTag, key: AeadKey) -> Self {
        Self {
            algo,
            key,
            cipher: OnceLock::new(),
        }
    }

    fn get_cipher(&self) -> &CipherImpl {
        self.cipher.get_or_init(|| match self.algo {
            AlgoTag::Aes256Gcm => {
                CipherImpl::Aes256Gcm(Box::new(Aes256Gcm::new_from_slice(&self.key.0).expect(
                    "AeadKey is always 32 bytes",
                )))
            }
            AlgoTag::ChaCha20Poly1305 => CipherImpl::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(&self.key.0)
                    .expect("AeadKey is always 32 bytes"),
            )),
            AlgoTag::XChaCha20Poly1305 => CipherImpl::XChaCha20Poly1305(Box::new(
                XChaCha20Poly1305::new_from_slice(&self.key.0)
                    .expect("AeadKey is always 32 bytes"),
            )),
        })
    }

    /// `AEAD-Seal(algo, key, iv, aad, pt) -> ct || tag`.
    pub fn seal(&self, iv: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != self.algo.iv_len() {
            return Err(Error::InvalidParam("iv length mismatch".into()));
        }
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match self.get_cipher() {
            CipherImpl::Aes256Gcm(c) => c
                .encrypt(aes_gcm::Nonce::from_slice(iv), payload)
                .map_err(|_| Error::InvalidParam("aead seal failed".into())),
            CipherImpl::ChaCha20Poly1305(c) => c
                .encrypt(chacha20poly1305::Nonce::from_slice(iv), payload)
                .map_err(|_| Error::InvalidParam("aead seal failed".into())),
            CipherImpl::XChaCha20Poly1305(c) => c
                .encrypt(chacha20poly1305::XNonce::from_slice(iv), payload)
                .map_err(|_| Error::InvalidParam("aead seal failed".into())),
        }
    }

    /// `AEAD-Open(algo, key, iv, aad, ct||tag) -> pt`. Fails with
    /// `Error::Auth` on tag mismatch; never returns partial plaintext.
    pub fn open(&self, iv: &[u8], aad: &[u8], ciphertext_and_tag: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != self.algo.iv_len() {
            return Err(Error::InvalidParam("iv length mismatch".into()));
        }
        let payload = Payload {
            msg: ciphertext_and_tag,
            aad,
        };
        match self.get_cipher() {
            CipherImpl::Aes256Gcm(c) => c
                .decrypt(aes_gcm::Nonce::from_slice(iv), payload)
                .map_err(|_| Error::Auth),
            CipherImpl::ChaCha20Poly1305(c) => c
                .decrypt(chacha20poly1305::Nonce::from_slice(iv), payload)
                .map_err(|_| Error::Auth),
            CipherImpl::XChaCha20Poly1305(c) => c
                .decrypt(chacha20poly1305::XNonce::from_slice(iv), payload)
                .map_err(|_| Error::Auth),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(algo: AlgoTag) {
        let key = AeadKey([7u8; 32]);
        let cipher = AeadCipher::new(algo, key);
        let iv = vec![1u8; algo.iv_len()];
        let aad = b"vault-aad";
        let pt = b"hello vault";
        let ct = cipher.seal(&iv, aad, pt).unwrap();
        let rt = cipher.open(&iv, aad, &ct).unwrap();
        assert_eq!(rt, pt);
    }

    #[test]
    fn roundtrip_aes256gcm() {
        roundtrip(AlgoTag::Aes256Gcm);
    }

    #[test]
    fn roundtrip_chacha20poly1305() {
        roundtrip(AlgoTag::ChaCha20Poly1305);
    }

    #[test]
    fn roundtrip_xchacha20poly1305() {
        roundtrip(AlgoTag::XChaCha20Poly1305);
    }

    #[test]
    fn open_fails_with_wrong_aad() {
        let key = AeadKey([3u8; 32]);
        let cipher = AeadCipher::new(AlgoTag::Aes256Gcm, key);
        let iv = vec![2u8; 12];
        let ct = cipher.seal(&iv, b"A", b"m").unwrap();
        assert!(matches!(cipher.open(&iv, b"B", &ct), Err(Error::Auth)));
    }

    #[test]
    fn open_fails_with_tampered_ciphertext() {
        let key = AeadKey([9u8; 32]);
        let cipher = AeadCipher::new(AlgoTag::ChaCha20Poly1305, key);
        let iv = vec![4u8; 12];
        let mut ct = cipher.seal(&iv, b"aad", b"message").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(matches!(cipher.open(&iv, b"aad", &ct), Err(Error::Auth)));
    }

    #[test]
    fn open_fails_with_wrong_key() {
        let cipher_a = AeadCipher::new(AlgoTag::Aes256Gcm, AeadKey([1u8; 32]));
        let cipher_b = AeadCipher::new(AlgoTag::Aes256Gcm, AeadKey([2u8; 32]));
        let iv = vec![0u8; 12];
        let ct = cipher_a.seal(&iv, b"aad", b"secret").unwrap();
        assert!(matches!(cipher_b.open(&iv, b"aad", &ct), Err(Error::Auth)));
    }

    proptest! {
        #[test]
        fn roundtrip_random_input(a in proptest::collection::vec(any::<u8>(), 0..256), m in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let key = AeadKey([5u8; 32]);
            let cipher = AeadCipher::new(AlgoTag::ChaCha20Poly1305, key);
            let iv = vec![0u8; 12];
            let ct = cipher.seal(&iv, &a, &m).unwrap();
            let pt = cipher.open(&iv, &a, &ct).unwrap();
            prop_assert_eq!(pt, m);
        }
    }
}
