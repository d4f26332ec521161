//! Client-side cryptographic toolbox (unsafe-forbidden).
//!
//! - `rng`: OS-backed cryptographically secure randomness.
//! - `kdf`: HKDF-SHA256, HMAC-SHA512, PBKDF2-HMAC-SHA512.
//! - `ec`: P-256 identity keys, ECDH, ECDSA, constant-time compare.
//! - `aead`: algorithm-tagged AEAD seal/open (AES-256-GCM, ChaCha20-Poly1305,
//!   XChaCha20-Poly1305).
//! - `frame`: self-contained `iv || ciphertext || tag` envelope codec.
//! - `file_codec`: framed-header streaming file encryption.
//! - `identity`: long-term identity key, signed prekey, one-time prekeys,
//!   prekey bundles.
//! - `session`: X3DH handshake + symmetric double-ratchet session engine.
//! - `store`: durable on-disk session persistence.
//! - `password`: salted + peppered + memory-hard password hashing.
#![forbid(unsafe_code)]

pub mod aead;
pub mod ec;
pub mod file_codec;
pub mod frame;
pub mod identity;
pub mod kdf;
pub mod password;
pub mod rng;
pub mod session;
pub mod store;

/// Error taxonomy for the whole crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Null/empty/missing argument, wrong key length, envelope too short.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// A public key could not be parsed.
    #[error("bad key: {0}")]
    BadKey(String),

    /// An ECDSA signature failed to verify.
    #[error("bad signature")]
    BadSignature,

    /// The OS randomness source returned an error.
    #[error("rng unavailable: {0}")]
    Rng(String),

    /// AEAD tag mismatch (wrong key, altered ciphertext, wrong AAD, truncated tag).
    #[error("authentication failed")]
    Auth,

    /// Operation targets a peer with no active session.
    #[error("no session for peer")]
    NoSession,

    /// Decrypt received a counter that is neither in-order, future-gap,
    /// replay, nor cached-skipped.
    #[error("out of order message counter")]
    OutOfOrder,

    /// File-codec size mismatch or unknown header magic/algorithm.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Underlying storage error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;
