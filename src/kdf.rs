#![forbid(unsafe_code)]

//! Key derivation primitives: HKDF-SHA256 (RFC 5869), HMAC-SHA512, and
//! PBKDF2-HMAC-SHA512.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Sha256, Sha512};

use crate::{Error, Result};

/// HKDF-SHA256 extract-then-expand. `ikm` must be non-empty. An empty `salt`
/// is treated as a zero-filled block the length of the hash output (this is
/// also `hkdf::Hkdf::new`'s own behavior for `None`; kept explicit here so
/// the contract is visible from this function's signature alone).
pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    if ikm.is_empty() {
        return Err(Error::InvalidParam("hkdf ikm must not be empty".into()));
    }
    let salt_opt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt_opt, ikm);
    let mut out = vec![0u8; out_len];
    hk.expand(info, &mut out)
        .map_err(|_| Error::InvalidParam("hkdf requested output too long for SHA-256".into()))?;
    Ok(out)
}

/// HMAC-SHA512(key, msg) -> 64 bytes.
pub fn hmac_sha512(key: &[u8], msg: &[u8]) -> [u8; 64] {
    let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 64];
    out.copy_from_slice(&tag);
    out
}

/// PBKDF2-HMAC-SHA512(pw, salt, iters, L). `iters` must be at least 1.
pub fn pbkdf2_hmac_sha512(pw: &[u8], salt: &[u8], iters: u32, out_len: usize) -> Result<Vec<u8>> {
    if iters == 0 {
        return Err(Error::InvalidParam("pbkdf2 iters must be >= 1".into()));
    }
    let mut out = vec![0u8; out_len];
    pbkdf2_hmac::<Sha512>(pw, salt, iters, &mut out);
    Ok(out)
}
