#![forbid(unsafe_code)]

//! Long-term identity key, signed prekey, and one-time prekeys.

use std::collections::HashMap;

use tracing::debug;

use crate::ec::{KeyPair, PublicKeyBytes};
use crate::rng;
use crate::{Error, Result};

/// A long-lived ECDSA/ECDH key pair on P-256.
pub struct IdentityKey {
    keypair: KeyPair,
}

impl IdentityKey {
    /// Generate a fresh identity key.
    pub fn generate() -> Result<Self> {
        Ok(Self {
            keypair: KeyPair::generate()?,
        })
    }

    /// Reload an identity key from its raw 32-byte scalar.
    pub fn from_scalar_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            keypair: KeyPair::from_scalar_bytes(bytes)?,
        })
    }

    /// The raw private scalar, for durable storage.
    pub fn private_scalar_bytes(&self) -> [u8; 32] {
        self.keypair.private_scalar_bytes()
    }

    /// This identity's compressed public key.
    pub fn public_key(&self) -> PublicKeyBytes {
        self.keypair.public_key()
    }

    /// The underlying key pair, for ECDH in the session engine.
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// ECDSA-sign `msg` under this identity (DER-encoded, SHA-256 pre-hash).
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.keypair.sign(msg)
    }
}

/// `(keyId, keyPair, signature)` where `signature = ECDSA(identityPriv,
/// serialize(prekey.pub))`. Exactly one is active at a time.
pub struct SignedPreKey {
    /// Wire-visible key identifier.
    pub key_id: u32,
    keypair: KeyPair,
    /// DER-encoded ECDSA signature over the compressed public key.
    pub signature: Vec<u8>,
}

impl SignedPreKey {
    /// Generate a new signed prekey under `identity`.
    pub fn generate(identity: &IdentityKey, key_id: u32) -> Result<Self> {
        let keypair = KeyPair::generate()?;
        let signature = identity.sign(keypair.public_key().as_ref());
        Ok(Self {
            key_id,
            keypair,
            signature,
        })
    }

    /// This prekey's compressed public key.
    pub fn public_key(&self) -> PublicKeyBytes {
        self.keypair.public_key()
    }

    /// The underlying key pair, for ECDH during X3DH.
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }
}

/// A pool of one-time prekeys, each served at most once.
#[derive(Default)]
pub struct OneTimePreKeys {
    keys: HashMap<u32, KeyPair>,
    next_id: u32,
}

impl OneTimePreKeys {
    /// Construct an empty pool.
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            next_id: 1,
        }
    }

    /// Generate `count` fresh one-time prekeys and add them to the pool,
    /// returning their `(key_id, public_key)` pairs for publication.
    pub fn generate_batch(&mut self, count: u32) -> Result<Vec<(u32, PublicKeyBytes)>> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            let keypair = KeyPair::generate()?;
            let public = keypair.public_key();
            self.keys.insert(id, keypair);
            out.push((id, public));
        }
        debug!(count, remaining = self.keys.len(), "generated one-time prekey batch");
        Ok(out)
    }

    /// Serve the prekey with `key_id`, removing it from the pool so it is
    /// never served again. Returns `None` if the id is unknown or already
    /// consumed.
    pub fn take(&mut self, key_id: u32) -> Option<KeyPair> {
        self.keys.remove(&key_id)
    }

    /// Whether `key_id` is still available in the pool.
    pub fn contains(&self, key_id: u32) -> bool {
        self.keys.contains_key(&key_id)
    }

    /// Number of unconsumed one-time prekeys remaining.
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }

    /// Pick an arbitrary still-available key id, for building a bundle to
    /// publish (a real deployment would track "least recently issued"; any
    /// unconsumed id satisfies the one-shot contract).
    pub fn any_available_id(&self) -> Option<u32> {
        self.keys.keys().next().copied()
    }
}

/// The published key material that enables asynchronous session
/// establishment. `pre_key_id == 0` and `pre_key.is_none()`
/// together mean "no one-time key included".
#[derive(Clone)]
pub struct PreKeyBundle {
    /// Host-chosen registration identifier.
    pub registration_id: u32,
    /// Host-chosen device identifier.
    pub device_id: u32,
    /// The publisher's long-term identity public key.
    pub identity_key: PublicKeyBytes,
    /// The publisher's currently active signed prekey public key.
    pub signed_pre_key: PublicKeyBytes,
    /// DER-encoded ECDSA signature over `signed_pre_key`, by `identity_key`.
    pub signature: Vec<u8>,
    /// `0` if no one-time prekey is included.
    pub pre_key_id: u32,
    /// `None` if no one-time prekey is included.
    pub pre_key: Option<PublicKeyBytes>,
}

impl PreKeyBundle {
    /// Verify `identity_key`'s signature over `signed_pre_key`. `Err(Error::BadSignature)` on failure.
    pub fn verify_signature(&self) -> Result<()> {
        let ok = self
            .identity_key
            .verify(self.signed_pre_key.as_ref(), &self.signature)?;
        if ok {
            Ok(())
        } else {
            Err(Error::BadSignature)
        }
    }
}

/// Assemble a bundle from a publisher's identity, signed prekey, and
/// optionally one available one-time prekey (consumed from `otpks`).
pub fn assemble_bundle(
    registration_id: u32,
    device_id: u32,
    identity: &IdentityKey,
    signed_pre_key: &SignedPreKey,
    otpks: &mut OneTimePreKeys,
) -> PreKeyBundle {
    let (pre_key_id, pre_key) = match otpks.any_available_id() {
        Some(id) => {
            let kp = otpks.take(id).expect("id was just confirmed available");
            (id, Some(kp.public_key()))
        }
        None => (0, None),
    };
    PreKeyBundle {
        registration_id,
        device_id,
        identity_key: identity.public_key(),
        signed_pre_key: signed_pre_key.public_key(),
        signature: signed_pre_key.signature.clone(),
        pre_key_id,
        pre_key,
    }
}

/// Generate a process-local registration id.
pub fn random_registration_id() -> Result<u32> {
    let bytes = rng::random_bytes(4)?;
    let raw = u32::from_le_bytes(bytes.try_into().expect("4-byte slice"));
    Ok(raw & 0x7fff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_signature_verifies() {
        let identity = IdentityKey::generate().unwrap();
        let spk = SignedPreKey::generate(&identity, 1).unwrap();
        let mut otpks = OneTimePreKeys::new();
        otpks.generate_batch(1).unwrap();
        let bundle = assemble_bundle(1, 1, &identity, &spk, &mut otpks);
        bundle.verify_signature().unwrap();
    }

    #[test]
    fn tampered_signed_pre_key_fails_verification() {
        let identity = IdentityKey::generate().unwrap();
        let spk = SignedPreKey::generate(&identity, 1).unwrap();
        let other = crate::ec::KeyPair::generate().unwrap();
        let mut otpks = OneTimePreKeys::new();
        let mut bundle = assemble_bundle(1, 1, &identity, &spk, &mut otpks);
        bundle.signed_pre_key = other.public_key();
        assert!(matches!(bundle.verify_signature(), Err(Error::BadSignature)));
    }

    #[test]
    fn one_time_prekey_served_at_most_once() {
        let mut otpks = OneTimePreKeys::new();
        let batch = otpks.generate_batch(3).unwrap();
        let (id, _) = batch[0];
        assert!(otpks.contains(id));
        assert!(otpks.take(id).is_some());
        assert!(!otpks.contains(id));
        assert!(otpks.take(id).is_none());
    }

    #[test]
    fn bundle_omits_one_time_key_when_pool_empty() {
        let identity = IdentityKey::generate().unwrap();
        let spk = SignedPreKey::generate(&identity, 1).unwrap();
        let mut otpks = OneTimePreKeys::new();
        let bundle = assemble_bundle(1, 1, &identity, &spk, &mut otpks);
        assert_eq!(bundle.pre_key_id, 0);
        assert!(bundle.pre_key.is_none());
    }
}
