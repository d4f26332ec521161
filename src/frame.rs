#![forbid(unsafe_code)]

//! Self-contained AEAD "envelope blob" codec: `iv || ciphertext
//! || tag`, carrying its own freshly generated IV so the receiver path needs
//! no ambient state.

use crate::aead::{AeadCipher, AeadKey, AlgoTag};
use crate::{rng, Error, Result};

/// Owns the key/algorithm/IV/tag for one AEAD frame context. The
/// IV and tag fields reflect the most recent `encrypt_one` call; they are
/// not meaningful before the first call.
pub struct FrameContext {
    key: [u8; 32],
    algo: AlgoTag,
    iv: Vec<u8>,
    tag: [u8; 16],
}

impl FrameContext {
    /// Build a context for `algo` with a 32-byte key.
    pub fn new(algo: AlgoTag, key: [u8; 32]) -> Self {
        Self {
            key,
            algo,
            iv: Vec::new(),
            tag: [0u8; 16],
        }
    }

    /// The IV generated by the most recent `encrypt_one` call.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// The tag produced by the most recent `encrypt_one` call.
    pub fn tag(&self) -> [u8; 16] {
        self.tag
    }

    /// `EncryptOne(ctx, plaintext) -> iv || ciphertext || tag`.
    /// Generates a fresh IV, seals with empty AAD, and records the IV/tag
    /// back into `self`.
    pub fn encrypt_one(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = AeadCipher::new(self.algo, AeadKey(self.key));
        let iv = rng::random_bytes(self.algo.iv_len())?;
        let ct_and_tag = cipher.seal(&iv, &[], plaintext)?;
        let tag_len = self.algo.tag_len();
        if ct_and_tag.len() < tag_len {
            return Err(Error::InvalidParam("aead output shorter than tag".into()));
        }
        self.tag.copy_from_slice(&ct_and_tag[ct_and_tag.len() - tag_len..]);
        self.iv = iv.clone();

        let mut out = Vec::with_capacity(iv.len() + ct_and_tag.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ct_and_tag);
        Ok(out)
    }

    /// `DecryptOne(ctx, iv||ciphertext||tag) -> plaintext`.
    pub fn decrypt_one(&mut self, envelope: &[u8]) -> Result<Vec<u8>> {
        let iv_len = self.algo.iv_len();
        let tag_len = self.algo.tag_len();
        if envelope.len() < iv_len + tag_len + 1 {
            return Err(Error::InvalidParam(
                "envelope shorter than iv + tag + 1 byte".into(),
            ));
        }
        let (iv, ct_and_tag) = envelope.split_at(iv_len);
        self.iv = iv.to_vec();
        self.tag
            .copy_from_slice(&ct_and_tag[ct_and_tag.len() - tag_len..]);

        let cipher = AeadCipher::new(self.algo, AeadKey(self.key));
        cipher.open(iv, &[], ct_and_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_and_fresh_iv_each_call() {
        let mut ctx = FrameContext::new(AlgoTag::Aes256Gcm, [1u8; 32]);
        let e1 = ctx.encrypt_one(b"hello").unwrap();
        let iv1 = ctx.iv().to_vec();
        let e2 = ctx.encrypt_one(b"hello").unwrap();
        let iv2 = ctx.iv().to_vec();
        assert_ne!(iv1, iv2, "iv must be regenerated per encryption");
        assert_ne!(e1, e2, "same plaintext under different ivs must differ");

        let mut dctx = FrameContext::new(AlgoTag::Aes256Gcm, [1u8; 32]);
        assert_eq!(dctx.decrypt_one(&e1).unwrap(), b"hello");
        assert_eq!(dctx.decrypt_one(&e2).unwrap(), b"hello");
    }

    #[test]
    fn decrypt_rejects_too_short_input() {
        let mut ctx = FrameContext::new(AlgoTag::ChaCha20Poly1305, [2u8; 32]);
        assert!(ctx.decrypt_one(&[0u8; 10]).is_err());
    }

    #[test]
    fn decrypt_detects_tamper() {
        let mut ctx = FrameContext::new(AlgoTag::ChaCha20Poly1305, [3u8; 32]);
        let mut e = ctx.encrypt_one(b"payload").unwrap();
        let last = e.len() - 1;
        e[last] ^= 1;
        let mut dctx = FrameContext::new(AlgoTag::ChaCha20Poly1305, [3u8; 32]);
        assert!(matches!(dctx.decrypt_one(&e), Err(Error::Auth)));
    }
}
