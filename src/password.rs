#![forbid(unsafe_code)]

//! Salted + peppered + iterated + memory-hard password hashing. A sibling of
//! the session engine: it reuses the crate's RNG and KDF primitives but has
//! no coupling to sessions or identities.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha512};

use crate::ec::constant_time_eq;
use crate::kdf::{hmac_sha512, pbkdf2_hmac_sha512};
use crate::rng;
use crate::{Error, Result};

/// Salt length in bytes.
pub const SALT_LEN: usize = 32;
/// Output length of the inner PBKDF2 step.
const PBKDF2_OUT_LEN: usize = 16;
/// Size of the memory-hard mixing buffer.
const MHF_BUFFER_LEN: usize = 8192;
/// Number of SHA-512 mixing rounds.
const MHF_ROUNDS: usize = 1000;
/// Default PBKDF2 iteration count for [`PasswordHasher::encode`]. The wire
/// string always embeds its own `iters`, so a caller-chosen count is also
/// exposed via `encode_with_iters`. 210,000 is a modernized default; the
/// inner memory-hard function's own fixed 1000 rounds are unaffected and
/// unrelated to this constant.
pub const DEFAULT_ITERS: u32 = 210_000;

const SCHEME_TAG: &str = "2";

fn sha512(data: &[u8]) -> [u8; 64] {
    let digest = Sha512::digest(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

/// Fill `buffer` by sequential SHA-512 chaining from `seed`, then run
/// [`MHF_ROUNDS`] mixing passes over the whole buffer, each pass folding a
/// digest of the current buffer back into it.
fn memory_hard(seed: &[u8]) -> [u8; 64] {
    let mut buffer = vec![0u8; MHF_BUFFER_LEN];
    let mut block = sha512(seed);
    for chunk in buffer.chunks_mut(64) {
        chunk.copy_from_slice(&block);
        block = sha512(&block);
    }

    for _ in 0..MHF_ROUNDS {
        let round_digest = sha512(&buffer);
        buffer[..64].copy_from_slice(&round_digest);
        buffer.rotate_left(64);
    }

    sha512(&buffer)
}

/// Generate a fresh 32-byte salt.
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let bytes = rng::random_bytes(SALT_LEN)?;
    let mut out = [0u8; SALT_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn b64_encode(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

fn b64_decode(s: &str) -> Result<Vec<u8>> {
    base64::decode_config(s, base64::URL_SAFE_NO_PAD)
        .map_err(|_| Error::Integrity("malformed base64 in password string".into()))
}

fn hash_with_salt(pw: &[u8], pepper: &[u8; 32], salt: &[u8; SALT_LEN], iters: u32) -> Result<[u8; 64]> {
    let peppered = hmac_sha512(pepper, pw);
    let pbkdf2_out = pbkdf2_hmac_sha512(&peppered, salt, iters, PBKDF2_OUT_LEN)?;
    let mut mhf_input = Vec::with_capacity(PBKDF2_OUT_LEN + SALT_LEN);
    mhf_input.extend_from_slice(&pbkdf2_out);
    mhf_input.extend_from_slice(salt);
    let mhf = memory_hard(&mhf_input);
    Ok(hmac_sha512(salt, &mhf))
}

/// Owns the process-wide pepper and produces/validates encoded password
/// strings.
pub struct PasswordHasher {
    pepper: [u8; 32],
}

impl PasswordHasher {
    /// Load the pepper from `path`, creating it with fresh random bytes if
    /// the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if let Ok(bytes) = fs::read(path) {
            if bytes.len() == 32 {
                let mut pepper = [0u8; 32];
                pepper.copy_from_slice(&bytes);
                return Ok(Self { pepper });
            }
        }
        let pepper = rng::random_32()?;
        fs::write(path, pepper)?;
        Ok(Self { pepper })
    }

    /// Build a hasher directly from an in-memory pepper (for tests, or a
    /// host that manages the pepper file itself).
    pub fn with_pepper(pepper: [u8; 32]) -> Self {
        Self { pepper }
    }

    /// `encode(pw) -> "2$iters$b64(salt)$b64(hash)"` using
    /// [`DEFAULT_ITERS`] and a fresh salt.
    pub fn encode(&self, pw: &[u8]) -> Result<String> {
        self.encode_with_iters(pw, DEFAULT_ITERS)
    }

    /// As [`Self::encode`], with a caller-chosen PBKDF2 iteration count.
    pub fn encode_with_iters(&self, pw: &[u8], iters: u32) -> Result<String> {
        let salt = generate_salt()?;
        let hash = hash_with_salt(pw, &self.pepper, &salt, iters)?;
        Ok(format!(
            "{SCHEME_TAG}${iters}${}${}",
            b64_encode(&salt),
            b64_encode(&hash)
        ))
    }

    /// `matches(pw, encoded)`: reparse `encoded`, recompute with the same
    /// salt and iteration count, and compare in constant time.
    pub fn matches(&self, pw: &[u8], encoded: &str) -> Result<bool> {
        let mut parts = encoded.split('$');
        let scheme = parts.next().ok_or_else(|| Error::Integrity("empty password string".into()))?;
        if scheme != SCHEME_TAG {
            return Err(Error::Integrity(format!("unsupported password scheme {scheme}")));
        }
        let iters: u32 = parts
            .next()
            .ok_or_else(|| Error::Integrity("missing iteration count".into()))?
            .parse()
            .map_err(|_| Error::Integrity("iteration count is not a valid integer".into()))?;
        let salt_b64 = parts.next().ok_or_else(|| Error::Integrity("missing salt".into()))?;
        let hash_b64 = parts.next().ok_or_else(|| Error::Integrity("missing hash".into()))?;
        if parts.next().is_some() {
            return Err(Error::Integrity("unexpected trailing field".into()));
        }

        let salt_bytes = b64_decode(salt_b64)?;
        if salt_bytes.len() != SALT_LEN {
            return Err(Error::Integrity("salt has wrong length".into()));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&salt_bytes);

        let expected_hash = b64_decode(hash_b64)?;
        if expected_hash.len() != 64 {
            return Err(Error::Integrity("hash has wrong length".into()));
        }

        let actual_hash = hash_with_salt(pw, &self.pepper, &salt, iters)?;
        Ok(constant_time_eq(&actual_hash, &expected_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn p1_correct_password_matches() {
        let hasher = PasswordHasher::with_pepper([7u8; 32]);
        let encoded = hasher.encode(b"correct horse battery staple").unwrap();
        assert!(hasher.matches(b"correct horse battery staple", &encoded).unwrap());
    }

    #[test]
    fn p1_wrong_password_does_not_match() {
        let hasher = PasswordHasher::with_pepper([7u8; 32]);
        let encoded = hasher.encode(b"correct horse battery staple").unwrap();
        assert!(!hasher.matches(b"correcthorse", &encoded).unwrap());
    }

    #[test]
    fn p1_fresh_salt_each_encode() {
        let hasher = PasswordHasher::with_pepper([7u8; 32]);
        let a = hasher.encode(b"same password").unwrap();
        let b = hasher.encode(b"same password").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn encoded_string_has_expected_shape() {
        let hasher = PasswordHasher::with_pepper([1u8; 32]);
        let encoded = hasher.encode_with_iters(b"pw", 100).unwrap();
        let parts: Vec<&str> = encoded.split('$').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "2");
        assert_eq!(parts[1], "100");
    }

    #[test]
    fn rejects_garbage_encoded_string() {
        let hasher = PasswordHasher::with_pepper([1u8; 32]);
        assert!(hasher.matches(b"pw", "not-a-valid-string").is_err());
        assert!(hasher.matches(b"pw", "2$abc$salt$hash").is_err());
    }

    #[test]
    fn pepper_persists_across_reload() {
        let dir = tempdir().unwrap();
        let pepper_path = dir.path().join("pepper.bin");

        let hasher1 = PasswordHasher::load_or_create(&pepper_path).unwrap();
        let encoded = hasher1.encode(b"hunter2").unwrap();

        let hasher2 = PasswordHasher::load_or_create(&pepper_path).unwrap();
        assert!(hasher2.matches(b"hunter2", &encoded).unwrap());
    }

    #[test]
    fn different_peppers_disagree() {
        let a = PasswordHasher::with_pepper([1u8; 32]);
        let b = PasswordHasher::with_pepper([2u8; 32]);
        let encoded = a.encode(b"hunter2").unwrap();
        assert!(!b.matches(b"hunter2", &encoded).unwrap());
    }
}
