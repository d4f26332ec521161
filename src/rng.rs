#![forbid(unsafe_code)]

//! Cryptographically secure randomness, sourced from the OS.

use rand_core::{OsRng, RngCore};

use crate::{Error, Result};

/// Fill `out` with cryptographically secure random bytes.
pub fn fill(out: &mut [u8]) -> Result<()> {
    // `OsRng` only fails if the platform entropy source is unavailable;
    // surface that as a typed error rather than panicking.
    OsRng.try_fill_bytes(out).map_err(|e| Error::Rng(e.to_string()))
}

/// Return `n` cryptographically secure random bytes.
pub fn random_bytes(n: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; n];
    fill(&mut out)?;
    Ok(out)
}

/// Return a cryptographically secure random 32-byte array.
pub fn random_32() -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    fill(&mut out)?;
    Ok(out)
}
