#![forbid(unsafe_code)]

//! Durable on-disk session persistence and the single-mutex session manager
//! that sits in front of it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::identity::{IdentityKey, OneTimePreKeys, PreKeyBundle};
use crate::session::{self, Session};
use crate::{Error, Result};

fn write_u32_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    if bytes.len() < *pos + 4 {
        return Err(Error::Integrity("truncated u32 field in session store".into()));
    }
    let v = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().expect("4-byte slice"));
    *pos += 4;
    Ok(v)
}

fn read_bytes<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    if bytes.len() < *pos + len {
        return Err(Error::Integrity("truncated byte field in session store".into()));
    }
    let out = &bytes[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

/// Serialize one session's state.
fn serialize_session(session: &Session) -> Vec<u8> {
    let (rk, ck_send, ck_recv, msg_send, msg_recv, skipped, decrypted, conversation_id) =
        session.to_parts();
    let mut out = Vec::new();
    write_u32_prefixed(&mut out, &rk);
    write_u32_prefixed(&mut out, &ck_send);
    write_u32_prefixed(&mut out, &ck_recv);
    out.extend_from_slice(&msg_send.to_le_bytes());
    out.extend_from_slice(&msg_recv.to_le_bytes());
    write_u32_prefixed(&mut out, &conversation_id);

    out.extend_from_slice(&(skipped.len() as u32).to_le_bytes());
    for (key_id, key) in &skipped {
        out.extend_from_slice(&key_id.to_le_bytes());
        write_u32_prefixed(&mut out, key);
    }

    out.extend_from_slice(&(decrypted.len() as u32).to_le_bytes());
    for (key_id, key) in &decrypted {
        out.extend_from_slice(&key_id.to_le_bytes());
        write_u32_prefixed(&mut out, key);
    }
    out
}

/// Parse one session's state. A missing `decryptedCount` tail is tolerated
/// and yields an empty replay cache.
fn deserialize_session(bytes: &[u8]) -> Result<Session> {
    let mut pos = 0usize;

    let rk_len = read_u32(bytes, &mut pos)? as usize;
    let rk = read_bytes(bytes, &mut pos, rk_len)?;
    let mut root_key = [0u8; 32];
    root_key.copy_from_slice(rk);

    let ck_send_len = read_u32(bytes, &mut pos)? as usize;
    let ck_send = read_bytes(bytes, &mut pos, ck_send_len)?;
    let mut chain_key_send = [0u8; 32];
    chain_key_send.copy_from_slice(ck_send);

    let ck_recv_len = read_u32(bytes, &mut pos)? as usize;
    let ck_recv = read_bytes(bytes, &mut pos, ck_recv_len)?;
    let mut chain_key_receive = [0u8; 32];
    chain_key_receive.copy_from_slice(ck_recv);

    let message_count_send = read_u32(bytes, &mut pos)?;
    let message_count_receive = read_u32(bytes, &mut pos)?;

    let conversation_id_len = read_u32(bytes, &mut pos)? as usize;
    let conversation_id = read_bytes(bytes, &mut pos, conversation_id_len)?.to_vec();

    let skipped_count = read_u32(bytes, &mut pos)?;
    let mut skipped = Vec::with_capacity(skipped_count as usize);
    for _ in 0..skipped_count {
        let key_id = read_u32(bytes, &mut pos)?;
        let key_len = read_u32(bytes, &mut pos)? as usize;
        let key_bytes = read_bytes(bytes, &mut pos, key_len)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        skipped.push((key_id, key));
    }

    let mut decrypted = Vec::new();
    if let Ok(decrypted_count) = read_u32(bytes, &mut pos) {
        for _ in 0..decrypted_count {
            let key_id = match read_u32(bytes, &mut pos) {
                Ok(v) => v,
                Err(_) => break,
            };
            let key_len = match read_u32(bytes, &mut pos) {
                Ok(v) => v as usize,
                Err(_) => break,
            };
            let key_bytes = match read_bytes(bytes, &mut pos, key_len) {
                Ok(v) => v,
                Err(_) => break,
            };
            let mut key = [0u8; 32];
            key.copy_from_slice(key_bytes);
            decrypted.push((key_id, key));
        }
    }

    Ok(Session::from_parts(
        root_key,
        chain_key_send,
        chain_key_receive,
        message_count_send,
        message_count_receive,
        skipped,
        decrypted,
        conversation_id,
    ))
}

/// Serialize the whole session map.
fn serialize_all(sessions: &HashMap<String, Session>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(sessions.len() as u32).to_le_bytes());
    for (id, session) in sessions {
        write_u32_prefixed(&mut out, id.as_bytes());
        let data = serialize_session(session);
        write_u32_prefixed(&mut out, &data);
    }
    out
}

fn deserialize_all(bytes: &[u8]) -> Result<HashMap<String, Session>> {
    let mut pos = 0usize;
    let count = read_u32(bytes, &mut pos)?;
    let mut out = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let id_len = read_u32(bytes, &mut pos)? as usize;
        let id_bytes = read_bytes(bytes, &mut pos, id_len)?;
        let id = String::from_utf8(id_bytes.to_vec())
            .map_err(|_| Error::Integrity("session id is not valid utf-8".into()))?;
        let data_len = read_u32(bytes, &mut pos)? as usize;
        let data = read_bytes(bytes, &mut pos, data_len)?;
        let session = deserialize_session(data)?;
        out.insert(id, session);
    }
    Ok(out)
}

/// Write `bytes` to `path` atomically: write to a sibling temp file, then
/// rename over the destination.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp_path = PathBuf::from(parent);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session-store".to_string());
    tmp_path.push(format!(".{file_name}.tmp"));

    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.flush()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Owns every session for this identity, guarded by one non-reentrant mutex:
/// every public operation takes the mutex for its entire duration,
/// serializing writes so concurrent encryptors on the same session observe
/// FIFO counter assignment.
///
/// When constructed with [`SessionManager::open`], every mutating operation
/// persists the whole session map to the configured store path before
/// returning, so a crash can never land between a state transition and its
/// durable record. [`SessionManager::new`] builds a path-less, in-memory-only
/// manager for callers (and tests) that do not need durability.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    store_path: Option<PathBuf>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// An empty, path-less manager: sessions live only in memory and are
    /// never persisted automatically. Use [`SessionManager::open`] for a
    /// manager backed by a durable store.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store_path: None,
        }
    }

    /// A manager backed by the session store at `path`: existing sessions
    /// are loaded immediately (an absent file is treated as empty), and
    /// every subsequent mutation is written back to `path` before the
    /// mutating call returns.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store_path = path.into();
        let sessions = if store_path.exists() {
            let mut file = File::open(&store_path)?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            let loaded = deserialize_all(&bytes)?;
            info!(count = loaded.len(), path = %store_path.display(), "loaded session store");
            loaded
        } else {
            debug!(path = %store_path.display(), "no session store on disk, starting empty");
            HashMap::new()
        };
        Ok(Self {
            sessions: Mutex::new(sessions),
            store_path: Some(store_path),
        })
    }

    /// Write `sessions` to the configured store path, if any. A no-op for a
    /// path-less manager.
    fn persist(&self, sessions: &HashMap<String, Session>) -> Result<()> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        let bytes = serialize_all(sessions);
        let count = sessions.len();
        atomic_write(path, &bytes)?;
        debug!(count, path = %path.display(), "persisted session store");
        Ok(())
    }

    /// Run a handshake against `peer_bundle` and install the resulting
    /// session for `peer_id`, replacing any existing one atomically, then
    /// persist before returning.
    pub fn init(
        &self,
        peer_id: &str,
        own_identity: &IdentityKey,
        peer_bundle: &PreKeyBundle,
        own_consumed_otpk: Option<(&mut OneTimePreKeys, u32)>,
    ) -> Result<()> {
        let new_session = session::init_session(own_identity, peer_bundle, own_consumed_otpk)?;
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        let replaced = sessions.insert(peer_id.to_string(), new_session).is_some();
        self.persist(&sessions)?;
        info!(peer_id, replaced, "installed session");
        Ok(())
    }

    /// Encrypt `plaintext` under the session for `peer_id`, persisting the
    /// advanced send state before returning the envelope.
    pub fn encrypt(&self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        let session = sessions.get_mut(peer_id).ok_or(Error::NoSession)?;
        let envelope = session::encrypt_message(session, plaintext)?;
        self.persist(&sessions)?;
        Ok(envelope)
    }

    /// Decrypt `envelope` against the session for `peer_id`, persisting the
    /// advanced receive state (and any skipped-key cache changes) before
    /// returning the plaintext.
    pub fn decrypt(&self, peer_id: &str, envelope: &[u8]) -> Result<Vec<u8>> {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        let session = sessions.get_mut(peer_id).ok_or(Error::NoSession)?;
        let plaintext = session::decrypt_message(session, envelope)?;
        self.persist(&sessions)?;
        Ok(plaintext)
    }

    /// Rotate the root key of the session for `peer_id`, persisting the
    /// rotated state before returning.
    pub fn perform_key_rotation(&self, peer_id: &str, dh_out: Option<[u8; 32]>) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        let session = sessions.get_mut(peer_id).ok_or(Error::NoSession)?;
        session::perform_key_rotation(session, dh_out)?;
        self.persist(&sessions)?;
        Ok(())
    }

    /// Whether a session for `peer_id` is currently held.
    pub fn has_session(&self, peer_id: &str) -> bool {
        let sessions = self.sessions.lock().expect("session mutex poisoned");
        sessions.contains_key(peer_id)
    }

    /// Drop the session for `peer_id`, if any, and persist the removal.
    pub fn remove_session(&self, peer_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        sessions.remove(peer_id);
        self.persist(&sessions)?;
        info!(peer_id, "removed session");
        Ok(())
    }

    /// Serialize and atomically write the whole session map to `path`,
    /// regardless of the manager's configured store path. Useful for
    /// exporting a copy without changing where automatic persistence goes.
    pub fn save(&self, path: &Path) -> Result<()> {
        let sessions = self.sessions.lock().expect("session mutex poisoned");
        let bytes = serialize_all(&sessions);
        let count = sessions.len();
        drop(sessions);
        atomic_write(path, &bytes)?;
        debug!(count, path = %path.display(), "saved session store");
        Ok(())
    }

    /// Replace the in-memory map with the contents of `path`. An absent
    /// file is treated as an empty store. Does not change the manager's
    /// configured store path.
    pub fn load(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            let mut sessions = self.sessions.lock().expect("session mutex poisoned");
            sessions.clear();
            debug!(path = %path.display(), "no session store on disk, starting empty");
            return Ok(());
        }
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let loaded = deserialize_all(&bytes)?;
        let count = loaded.len();
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        *sessions = loaded;
        info!(count, path = %path.display(), "loaded session store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{assemble_bundle, IdentityKey, OneTimePreKeys, SignedPreKey};
    use tempfile::tempdir;

    struct Peer {
        identity: IdentityKey,
        spk: SignedPreKey,
        otpks: OneTimePreKeys,
        manager: SessionManager,
    }

    fn make_peer() -> Peer {
        let identity = IdentityKey::generate().unwrap();
        let spk = SignedPreKey::generate(&identity, 1).unwrap();
        let mut otpks = OneTimePreKeys::new();
        otpks.generate_batch(100).unwrap();
        Peer {
            identity,
            spk,
            otpks,
            manager: SessionManager::new(),
        }
    }

    #[test]
    fn s1_basic_session_via_manager() {
        let mut a = make_peer();
        let mut b = make_peer();
        let bundle_b = assemble_bundle(1, 1, &b.identity, &b.spk, &mut b.otpks);
        let bundle_a = assemble_bundle(2, 1, &a.identity, &a.spk, &mut a.otpks);

        a.manager.init("B", &a.identity, &bundle_b, None).unwrap();
        b.manager.init("A", &b.identity, &bundle_a, None).unwrap();

        let envelope = a.manager.encrypt("B", b"ping").unwrap();
        let plaintext = b.manager.decrypt("A", &envelope).unwrap();
        assert_eq!(plaintext, b"ping");
    }

    #[test]
    fn encrypt_without_session_fails() {
        let manager = SessionManager::new();
        let err = manager.encrypt("nobody", b"x").unwrap_err();
        assert!(matches!(err, Error::NoSession));
    }

    #[test]
    fn s4_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("sessions.bin");

        let mut a = make_peer();
        let mut b = make_peer();
        let bundle_b = assemble_bundle(1, 1, &b.identity, &b.spk, &mut b.otpks);
        let bundle_a = assemble_bundle(2, 1, &a.identity, &a.spk, &mut a.otpks);
        a.manager.init("B", &a.identity, &bundle_b, None).unwrap();
        b.manager.init("A", &b.identity, &bundle_a, None).unwrap();

        let e1 = a.manager.encrypt("B", b"ping").unwrap();
        b.manager.decrypt("A", &e1).unwrap();

        a.manager.save(&store_path).unwrap();
        drop(a);

        let reloaded = SessionManager::new();
        reloaded.load(&store_path).unwrap();
        assert!(reloaded.has_session("B"));

        let e2 = reloaded.encrypt("B", b"pong").unwrap();
        let plaintext = b.manager.decrypt("A", &e2).unwrap();
        assert_eq!(plaintext, b"pong");
    }

    #[test]
    fn load_missing_file_yields_empty_store() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new();
        manager.load(&dir.path().join("does-not-exist.bin")).unwrap();
        assert!(!manager.has_session("anyone"));
    }

    #[test]
    fn remove_session_reverts_to_fresh() {
        let mut a = make_peer();
        let mut b = make_peer();
        let bundle_b = assemble_bundle(1, 1, &b.identity, &b.spk, &mut b.otpks);
        a.manager.init("B", &a.identity, &bundle_b, None).unwrap();
        assert!(a.manager.has_session("B"));
        a.manager.remove_session("B").unwrap();
        assert!(!a.manager.has_session("B"));
    }

    #[test]
    fn open_persists_every_mutation_without_explicit_save() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("sessions.bin");

        let a = IdentityKey::generate().unwrap();
        let spk_a = SignedPreKey::generate(&a, 1).unwrap();
        let mut otpks_a = OneTimePreKeys::new();
        otpks_a.generate_batch(10).unwrap();

        let b = IdentityKey::generate().unwrap();
        let spk_b = SignedPreKey::generate(&b, 1).unwrap();
        let mut otpks_b = OneTimePreKeys::new();
        otpks_b.generate_batch(10).unwrap();
        let bundle_b = assemble_bundle(1, 1, &b, &spk_b, &mut otpks_b);

        let manager = SessionManager::open(&store_path).unwrap();
        manager.init("B", &a, &bundle_b, None).unwrap();

        // No explicit save() call: init() must have persisted on its own.
        let reopened = SessionManager::open(&store_path).unwrap();
        assert!(reopened.has_session("B"));

        // encrypt() must likewise persist its counter advance on its own.
        manager.encrypt("B", b"ping").unwrap();
        let reopened_again = SessionManager::open(&store_path).unwrap();
        assert!(reopened_again.has_session("B"));
    }
}
