#![forbid(unsafe_code)]

//! P-256 (`prime256v1`) identity keys: ECDH key agreement, ECDSA signatures
//! (SHA-256 pre-hash, DER encoding), compressed-point serialization, and a
//! constant-time byte comparison used throughout the crate.

use elliptic_curve::sec1::ToEncodedPoint;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::{PublicKey, SecretKey};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Compressed SEC1 encoding length for a P-256 public key.
pub const PUBLIC_KEY_LEN: usize = 33;
/// Length of a raw ECDH shared secret (the P-256 field size).
pub const SHARED_SECRET_LEN: usize = 32;
/// Upper bound on a DER-encoded P-256 ECDSA signature.
pub const MAX_SIGNATURE_LEN: usize = 72;

/// A P-256 key pair. The private scalar is zeroized on drop by `SecretKey`
/// itself (`elliptic_curve::SecretKey` is `ZeroizeOnDrop`).
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret.clone(),
            public: self.public,
        }
    }
}

impl KeyPair {
    /// Generate a fresh P-256 key pair from the OS RNG.
    pub fn generate() -> Result<Self> {
        let secret = SecretKey::random(&mut rand_core::OsRng);
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    /// Construct a key pair from a raw 32-byte scalar (e.g. after loading it
    /// from disk). Fails if the scalar is not a valid P-256 private key.
    pub fn from_scalar_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|_| Error::BadKey("invalid P-256 private scalar".into()))?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    /// The raw 32-byte private scalar, for durable storage by the caller.
    pub fn private_scalar_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.secret.to_bytes());
        out
    }

    /// This key pair's public key.
    pub fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes::from_public(&self.public)
    }

    /// ECDH with a peer's public key; returns the raw 32-byte X-coordinate.
    pub fn ecdh(&self, peer: &PublicKeyBytes) -> Result<[u8; SHARED_SECRET_LEN]> {
        let peer_pk = peer.to_public_key()?;
        let shared = p256::ecdh::diffie_hellman(
            self.secret.to_nonzero_scalar(),
            peer_pk.as_affine(),
        );
        let mut out = [0u8; SHARED_SECRET_LEN];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }

    /// ECDSA-sign `msg`, returning a DER-encoded signature (SHA-256 pre-hash).
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::from(&self.secret);
        let sig: Signature = signing_key.sign(msg);
        sig.to_der().as_bytes().to_vec()
    }
}

/// A compressed (33-byte) P-256 public key, as carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyBytes(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKeyBytes {
    fn from_public(pk: &PublicKey) -> Self {
        let encoded = pk.to_encoded_point(true);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(encoded.as_bytes());
        Self(out)
    }

    /// Parse a 33-byte compressed SEC1 point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(Error::BadKey(format!(
                "expected {PUBLIC_KEY_LEN}-byte compressed public key, got {}",
                bytes.len()
            )));
        }
        // Validate it actually decodes to a point on the curve now, rather
        // than deferring the error to first use.
        let _ = PublicKey::from_sec1_bytes(bytes)
            .map_err(|_| Error::BadKey("invalid P-256 compressed point".into()))?;
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    fn to_public_key(self) -> Result<PublicKey> {
        PublicKey::from_sec1_bytes(&self.0)
            .map_err(|_| Error::BadKey("invalid P-256 compressed point".into()))
    }

    /// Verify a DER-encoded ECDSA signature over `msg` (SHA-256 pre-hash).
    pub fn verify(&self, msg: &[u8], der_signature: &[u8]) -> Result<bool> {
        let pk = self.to_public_key()?;
        let verifying_key = VerifyingKey::from(&pk);
        let sig = match Signature::from_der(der_signature) {
            Ok(sig) => sig,
            Err(_) => return Ok(false),
        };
        Ok(verifying_key.verify(msg, &sig).is_ok())
    }
}

impl AsRef<[u8]> for PublicKeyBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Length-checked, branch-free byte comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_agrees_both_directions() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        let shared_a = a.ecdh(&b.public_key()).unwrap();
        let shared_b = b.ecdh(&a.public_key()).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn public_key_roundtrips_through_bytes() {
        let kp = KeyPair::generate().unwrap();
        let pk = kp.public_key();
        let parsed = PublicKeyBytes::from_bytes(pk.as_ref()).unwrap();
        assert_eq!(pk, parsed);
    }

    #[test]
    fn rejects_malformed_public_key_bytes() {
        let garbage = [0xFFu8; PUBLIC_KEY_LEN];
        assert!(PublicKeyBytes::from_bytes(&garbage).is_err());
        assert!(PublicKeyBytes::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let msg = b"hello vault";
        let sig = kp.sign(msg);
        assert!(kp.public_key().verify(msg, &sig).unwrap());
    }

    #[test]
    fn verify_fails_on_tampered_message_or_signature() {
        let kp = KeyPair::generate().unwrap();
        let msg = b"hello vault";
        let mut sig = kp.sign(msg);
        assert!(!kp.public_key().verify(b"goodbye vault", &sig).unwrap());
        sig[sig.len() - 1] ^= 0xFF;
        assert!(!kp.public_key().verify(msg, &sig).unwrap());
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
