#![forbid(unsafe_code)]

//! X3DH handshake + symmetric double-ratchet session engine.
//! This is the hub of the crate: it consumes identity/prekey state from
//! [`crate::identity`], derives per-message keys via [`crate::kdf`], and
//! encrypts/decrypts with [`crate::aead`]. Persistence and cross-session
//! locking live one layer up, in [`crate::store`].

use std::collections::HashMap;

use zeroize::Zeroize;

use tracing::{debug, info, warn};

use crate::aead::{AeadCipher, AeadKey, AlgoTag};
use crate::ec::{KeyPair, PublicKeyBytes};
use crate::identity::{IdentityKey, OneTimePreKeys, PreKeyBundle};
use crate::kdf::{hkdf_sha256, hmac_sha512};
use crate::rng;
use crate::{Error, Result};

const COUNTER_LEN: usize = 4;
const MESSAGE_IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Per-message encryption always uses AES-256-GCM, independent of the
/// `AlgoTag` choices the frame and file codecs expose elsewhere.
const MESSAGE_ALGO: AlgoTag = AlgoTag::Aes256Gcm;
/// Bound on the replay cache of already-decrypted message keys, evicted FIFO.
pub const REPLAY_CACHE_CAP: usize = 4096;

const KDF_CK_MESSAGE_KEY_TAG: [u8; 1] = [0x01];
const KDF_CK_CHAIN_KEY_TAG: [u8; 1] = [0x02];
const X3DH_INFO: &[u8] = b"X3DH Root Key";

/// A 32-byte secret (root key, chain key, or message key), zeroized on drop.
#[derive(Clone)]
pub struct SessionKey(pub [u8; 32]);

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl SessionKey {
    fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Self(out)
    }
}

/// `KDF_CK(ck) -> (messageKey, nextChainKey)`: a
/// domain-separated HMAC variant, rather than one HKDF call sharing an info
/// string with `KDF_RK`.
fn kdf_ck(chain_key: &SessionKey) -> (SessionKey, SessionKey) {
    let mk = hmac_sha512(&chain_key.0, &KDF_CK_MESSAGE_KEY_TAG);
    let ck = hmac_sha512(&chain_key.0, &KDF_CK_CHAIN_KEY_TAG);
    (
        SessionKey::from_slice(&mk[..32]),
        SessionKey::from_slice(&ck[..32]),
    )
}

/// `KDF_RK(rk, dh) -> (newRootKey, newChainKey)`.
fn kdf_rk(root_key: &SessionKey, dh: &[u8]) -> Result<(SessionKey, SessionKey)> {
    let out = hkdf_sha256(&root_key.0, dh, X3DH_INFO, 64)?;
    Ok((
        SessionKey::from_slice(&out[..32]),
        SessionKey::from_slice(&out[32..64]),
    ))
}

/// Per-peer ratchet state. There is no explicit `Fresh` variant:
/// the owning [`crate::store::SessionManager`] models `Fresh` as "absent
/// from the map" and `Active` as "present".
pub struct Session {
    root_key: SessionKey,
    chain_key_send: SessionKey,
    chain_key_receive: SessionKey,
    message_count_send: u32,
    message_count_receive: u32,
    skipped_message_keys: HashMap<u32, SessionKey>,
    /// FIFO-ordered replay cache; oldest entry evicted past
    /// [`REPLAY_CACHE_CAP`].
    decrypted_message_keys: Vec<(u32, SessionKey)>,
    /// AAD root: the two participants' compressed identity public keys in
    /// sorted (lexicographic) order, concatenated. Identical on both sides
    /// of an exchange regardless of which side looks the session up under
    /// which local peer id, so it is safe to authenticate with.
    conversation_id: Vec<u8>,
}

impl Session {
    fn decrypted_get(&self, counter: u32) -> Option<&SessionKey> {
        self.decrypted_message_keys
            .iter()
            .find(|(c, _)| *c == counter)
            .map(|(_, k)| k)
    }

    fn decrypted_insert(&mut self, counter: u32, key: SessionKey) {
        self.decrypted_message_keys.push((counter, key));
        if self.decrypted_message_keys.len() > REPLAY_CACHE_CAP {
            self.decrypted_message_keys.remove(0);
        }
    }

    /// Next counter [`encrypt_message`] will assign.
    pub fn message_count_send(&self) -> u32 {
        self.message_count_send
    }

    /// Highest consecutive counter successfully decrypted in order.
    pub fn message_count_receive(&self) -> u32 {
        self.message_count_receive
    }

    /// Counters with a cached-but-not-yet-consumed skipped message key.
    pub fn skipped_counters(&self) -> Vec<u32> {
        let mut v: Vec<u32> = self.skipped_message_keys.keys().copied().collect();
        v.sort_unstable();
        v
    }

    /// Whether `counter` has a successfully-decrypted entry in the replay cache.
    pub fn has_decrypted(&self, counter: u32) -> bool {
        self.decrypted_get(counter).is_some()
    }

    /// The symmetric AAD root shared by both sides of this exchange.
    pub fn conversation_id(&self) -> &[u8] {
        &self.conversation_id
    }

    /// Reconstruct a session from its raw serialized fields (used by
    /// [`crate::store`] on load).
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        root_key: [u8; 32],
        chain_key_send: [u8; 32],
        chain_key_receive: [u8; 32],
        message_count_send: u32,
        message_count_receive: u32,
        skipped: Vec<(u32, [u8; 32])>,
        decrypted: Vec<(u32, [u8; 32])>,
        conversation_id: Vec<u8>,
    ) -> Self {
        Self {
            root_key: SessionKey(root_key),
            chain_key_send: SessionKey(chain_key_send),
            chain_key_receive: SessionKey(chain_key_receive),
            message_count_send,
            message_count_receive,
            skipped_message_keys: skipped
                .into_iter()
                .map(|(c, k)| (c, SessionKey(k)))
                .collect(),
            decrypted_message_keys: decrypted.into_iter().map(|(c, k)| (c, SessionKey(k))).collect(),
            conversation_id,
        }
    }

    /// Break a session into its raw fields for serialization.
    #[allow(clippy::type_complexity)]
    pub fn to_parts(
        &self,
    ) -> (
        [u8; 32],
        [u8; 32],
        [u8; 32],
        u32,
        u32,
        Vec<(u32, [u8; 32])>,
        Vec<(u32, [u8; 32])>,
        Vec<u8>,
    ) {
        (
            self.root_key.0,
            self.chain_key_send.0,
            self.chain_key_receive.0,
            self.message_count_send,
            self.message_count_receive,
            self.skipped_message_keys
                .iter()
                .map(|(c, k)| (*c, k.0))
                .collect(),
            self.decrypted_message_keys.iter().map(|(c, k)| (*c, k.0)).collect(),
            self.conversation_id.clone(),
        )
    }
}

fn build_aad(counter: u32, conversation_id: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(COUNTER_LEN + conversation_id.len());
    aad.extend_from_slice(&counter.to_be_bytes());
    aad.extend_from_slice(conversation_id);
    aad
}

/// Sorted concatenation of two compressed identity public keys: identical
/// regardless of which side computes it, so it is safe to use as a shared
/// AAD root (unlike each side's own local peer-lookup key, which is
/// asymmetric between the two parties of a conversation).
fn canonical_conversation_id(a: &PublicKeyBytes, b: &PublicKeyBytes) -> Vec<u8> {
    let (first, second) = if a.as_ref() <= b.as_ref() { (a, b) } else { (b, a) };
    let mut out = Vec::with_capacity(first.as_ref().len() + second.as_ref().len());
    out.extend_from_slice(first.as_ref());
    out.extend_from_slice(second.as_ref());
    out
}

/// X3DH-style session initialization. `own_identity` plays the
/// initiator role against `peer_bundle`'s published keys. When this call
/// consumed a one-time prekey that `own_identity` itself had published (the
/// peer told us out-of-band which id it used), pass `own_consumed_otpk` with
/// the local pool and the consumed id so it is removed (step 6); pass `None`
/// when no local one-time prekey was involved.
pub fn init_session(
    own_identity: &IdentityKey,
    peer_bundle: &PreKeyBundle,
    own_consumed_otpk: Option<(&mut OneTimePreKeys, u32)>,
) -> Result<Session> {
    info!("running X3DH handshake");
    peer_bundle.verify_signature()?;

    let ephemeral = KeyPair::generate()?;

    let dh1 = own_identity.keypair().ecdh(&peer_bundle.signed_pre_key)?;
    let dh2 = ephemeral.ecdh(&peer_bundle.identity_key)?;
    let dh3 = ephemeral.ecdh(&peer_bundle.signed_pre_key)?;
    let dh4 = match &peer_bundle.pre_key {
        Some(pk) => Some(ephemeral.ecdh(pk)?),
        None => None,
    };

    let dh4_present = dh4.is_some();
    let mut ikm = Vec::with_capacity(32 * 4);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(&dh4);
    }

    let root_chain = hkdf_sha256(&[0u8; 32], &ikm, X3DH_INFO, 64)?;
    let root_key = SessionKey::from_slice(&root_chain[..32]);
    let chain_key = SessionKey::from_slice(&root_chain[32..64]);

    if let Some((otpks, key_id)) = own_consumed_otpk {
        otpks.take(key_id);
        debug!(key_id, "consumed local one-time prekey during handshake");
    }

    debug!(dh_count = if dh4_present { 4 } else { 3 }, "derived root key from X3DH");

    let conversation_id = canonical_conversation_id(&own_identity.public_key(), &peer_bundle.identity_key);

    Ok(Session {
        root_key,
        chain_key_send: chain_key.clone(),
        chain_key_receive: chain_key,
        // Counters are 1-indexed: the first assigned send counter is 1, and
        // "highest consecutive counter decrypted" starts at 0 (none yet).
        message_count_send: 1,
        message_count_receive: 0,
        skipped_message_keys: HashMap::new(),
        decrypted_message_keys: Vec::new(),
        conversation_id,
    })
}

/// Encrypt one message on the sending chain, advancing it by one step.
/// Caller holds the session-manager mutex; this function itself does no
/// locking or persistence.
pub fn encrypt_message(session: &mut Session, plaintext: &[u8]) -> Result<Vec<u8>> {
    let counter = session.message_count_send;
    let (mk, next_ck) = kdf_ck(&session.chain_key_send);

    let iv = rng::random_bytes(MESSAGE_IV_LEN)?;
    let aad = build_aad(counter, &session.conversation_id);
    let cipher = AeadCipher::new(MESSAGE_ALGO, AeadKey(mk.0));
    let ct_and_tag = cipher.seal(&iv, &aad, plaintext)?;

    session.chain_key_send = next_ck;
    session.message_count_send = session.message_count_send.wrapping_add(1);

    let mut envelope = Vec::with_capacity(COUNTER_LEN + MESSAGE_IV_LEN + ct_and_tag.len());
    envelope.extend_from_slice(&counter.to_be_bytes());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&ct_and_tag);
    debug!(counter, "encrypted message envelope");
    Ok(envelope)
}

/// Decrypt one message, handling replay, in-order, future-gap, and
/// past-skipped counters. On AEAD failure no chain state is mutated, except
/// that message keys derived while probing a future gap remain cached.
pub fn decrypt_message(session: &mut Session, envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < COUNTER_LEN + MESSAGE_IV_LEN + TAG_LEN {
        return Err(Error::InvalidParam("envelope shorter than counter+iv+tag".into()));
    }
    let counter = u32::from_be_bytes(envelope[0..4].try_into().expect("4-byte slice"));
    let iv = &envelope[4..4 + MESSAGE_IV_LEN];
    let body = &envelope[4 + MESSAGE_IV_LEN..];
    let aad = build_aad(counter, &session.conversation_id);

    if let Some(mk) = session.decrypted_get(counter) {
        debug!(counter, "replayed envelope served from cache");
        let cipher = AeadCipher::new(MESSAGE_ALGO, AeadKey(mk.0));
        return cipher.open(iv, &aad, body);
    }

    if counter == session.message_count_receive + 1 {
        let (mk, next_ck) = kdf_ck(&session.chain_key_receive);
        let cipher = AeadCipher::new(MESSAGE_ALGO, AeadKey(mk.0));
        let plaintext = cipher.open(iv, &aad, body)?;
        session.chain_key_receive = next_ck;
        session.message_count_receive = counter;
        session.decrypted_insert(counter, mk);
        return Ok(plaintext);
    }

    if counter > session.message_count_receive + 1 {
        let start = session.message_count_receive + 1;
        warn!(
            counter,
            expected = session.message_count_receive + 1,
            "future-gap envelope, ratcheting forward to cache skipped keys"
        );
        let mut ck = session.chain_key_receive.clone();
        let mut newly_skipped = Vec::new();
        let mut last_mk = None;
        for i in start..=counter {
            let (mk_i, next_ck) = kdf_ck(&ck);
            ck = next_ck;
            if i < counter {
                newly_skipped.push((i, mk_i));
            } else {
                last_mk = Some(mk_i);
            }
        }
        // Retained even if the open below fails: a future attempt
        // is allowed to convert into a cheap successor success.
        for (i, key) in newly_skipped {
            session.skipped_message_keys.insert(i, key);
        }
        let mk = last_mk.expect("loop runs at least once since counter > message_count_receive + 1");
        let cipher = AeadCipher::new(MESSAGE_ALGO, AeadKey(mk.0));
        let plaintext = cipher.open(iv, &aad, body)?;
        session.chain_key_receive = ck;
        session.message_count_receive = counter;
        session.decrypted_insert(counter, mk);
        return Ok(plaintext);
    }

    if let Some(mk) = session.skipped_message_keys.get(&counter) {
        let cipher = AeadCipher::new(MESSAGE_ALGO, AeadKey(mk.0));
        let plaintext = cipher.open(iv, &aad, body)?;
        // Only remove the cached key once `open` has actually succeeded: a
        // failed attempt (e.g. a tampered ciphertext) must not mutate state.
        let mk = session
            .skipped_message_keys
            .remove(&counter)
            .expect("key was just confirmed present above");
        session.decrypted_insert(counter, mk);
        return Ok(plaintext);
    }

    warn!(counter, "rejecting out-of-order envelope");
    Err(Error::OutOfOrder)
}

/// A DH ratchet step. `dh_out` is the peer-supplied DH contribution when
/// one is available; otherwise a fresh random value is drawn locally.
pub fn perform_key_rotation(session: &mut Session, dh_out: Option<[u8; 32]>) -> Result<()> {
    info!(
        peer_supplied = dh_out.is_some(),
        "performing DH ratchet key rotation"
    );
    let dh = match dh_out {
        Some(d) => d,
        None => rng::random_32()?,
    };
    let (new_root, new_chain) = kdf_rk(&session.root_key, &dh)?;
    session.root_key = new_root;
    session.chain_key_send = new_chain.clone();
    session.chain_key_receive = new_chain;
    session.message_count_send = 1;
    session.message_count_receive = 0;
    session.skipped_message_keys.clear();
    session.decrypted_message_keys.clear();
    Ok(())
}
