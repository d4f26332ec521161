#![forbid(unsafe_code)]

//! Authenticated file codec: a fixed 144-byte header
//! followed by a streamed AEAD body.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::aead::{AeadCipher, AeadKey, AlgoTag};
use crate::{rng, Error, Result};

/// Header size in bytes.
pub const HEADER_LEN: usize = 144;
const IV_FIELD_LEN: usize = 64;
const TAG_FIELD_LEN: usize = 16;
const RESERVED_LEN: usize = 32;
/// Plaintext is streamed through the AEAD in chunks this size.
const CHUNK_LEN: usize = 4096;

/// The 144-byte fixed file header, little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Original plaintext length.
    pub file_size: u64,
    /// Ciphertext + tag length in the body.
    pub encrypted_size: u64,
    /// Algorithm tag.
    pub algo: AlgoTag,
    /// UNIX seconds at encryption time.
    pub timestamp: u64,
    /// The IV, left-aligned in a 64-byte field (unused trailing bytes zero).
    pub iv: Vec<u8>,
    /// The final AEAD tag.
    pub tag: [u8; 16],
}

impl FileHeader {
    /// Serialize into the fixed 144-byte layout.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(&self.file_size.to_le_bytes());
        out[8..16].copy_from_slice(&self.encrypted_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.algo.wire_value().to_le_bytes());
        out[20..28].copy_from_slice(&self.timestamp.to_le_bytes());
        let iv_len = self.iv.len().min(IV_FIELD_LEN);
        out[28..28 + iv_len].copy_from_slice(&self.iv[..iv_len]);
        out[92..92 + TAG_FIELD_LEN].copy_from_slice(&self.tag);
        // reserved[108..140] stays zero.
        out
    }

    /// Parse the fixed 144-byte layout. Rejects unknown algorithm tags and
    /// a non-zero reserved region.
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let file_size = u64::from_le_bytes(bytes[0..8].try_into().expect("8-byte slice"));
        let encrypted_size = u64::from_le_bytes(bytes[8..16].try_into().expect("8-byte slice"));
        let algo_raw = u32::from_le_bytes(bytes[16..20].try_into().expect("4-byte slice"));
        let algo = AlgoTag::from_wire_value(algo_raw)?;
        let timestamp = u64::from_le_bytes(bytes[20..28].try_into().expect("8-byte slice"));
        let iv = bytes[28..28 + algo.iv_len()].to_vec();
        let mut tag = [0u8; TAG_FIELD_LEN];
        tag.copy_from_slice(&bytes[92..92 + TAG_FIELD_LEN]);
        if bytes[108..108 + RESERVED_LEN].iter().any(|b| *b != 0) {
            return Err(Error::Integrity("reserved header bytes must be zero".into()));
        }
        Ok(Self {
            file_size,
            encrypted_size,
            algo,
            timestamp,
            iv,
            tag,
        })
    }
}

/// Encrypt the file at `in_path` into `out_path` under `algo`/`key`.
/// Empty input files produce a valid header, zero-byte ciphertext region,
/// and a tag over the empty plaintext.
pub fn encrypt_file(in_path: &Path, out_path: &Path, algo: AlgoTag, key: [u8; 32]) -> Result<()> {
    info!(in_path = %in_path.display(), out_path = %out_path.display(), ?algo, "encrypting file");
    let mut input = File::open(in_path)?;
    let file_size = input.metadata()?.len();

    let mut plaintext = Vec::with_capacity(file_size as usize);
    let mut buf = [0u8; CHUNK_LEN];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        plaintext.extend_from_slice(&buf[..n]);
    }

    let iv = rng::random_bytes(algo.iv_len())?;
    let cipher = AeadCipher::new(algo, AeadKey(key));
    let ct_and_tag = cipher.seal(&iv, &[], &plaintext)?;
    let tag_len = algo.tag_len();
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&ct_and_tag[ct_and_tag.len() - tag_len..]);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let header = FileHeader {
        file_size,
        encrypted_size: ct_and_tag.len() as u64,
        algo,
        timestamp,
        iv,
        tag,
    };

    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(out_path)?;
    // Write a zero header placeholder, stream the body, then rewind and
    // rewrite the header with real fields.
    output.write_all(&[0u8; HEADER_LEN])?;
    for chunk in ct_and_tag.chunks(CHUNK_LEN) {
        output.write_all(chunk)?;
    }
    output.seek(SeekFrom::Start(0))?;
    output.write_all(&header.to_bytes())?;
    output.flush()?;
    debug!(file_size, encrypted_size = header.encrypted_size, "wrote file header and body");
    Ok(())
}

/// Decrypt the file at `in_path` into `out_path` using `key`. The algorithm
/// is read from the header; `Error::Integrity` on unknown algo or size
/// mismatch, `Error::Auth` on tag mismatch.
pub fn decrypt_file(in_path: &Path, out_path: &Path, key: [u8; 32]) -> Result<()> {
    info!(in_path = %in_path.display(), out_path = %out_path.display(), "decrypting file");
    let mut input = File::open(in_path)?;
    let mut header_bytes = [0u8; HEADER_LEN];
    input.read_exact(&mut header_bytes)?;
    let header = FileHeader::from_bytes(&header_bytes)?;

    let tag_len = header.algo.tag_len();
    if header.encrypted_size < tag_len as u64 {
        return Err(Error::Integrity("encrypted_size shorter than tag".into()));
    }

    let mut body = Vec::with_capacity(header.encrypted_size as usize);
    let mut buf = [0u8; CHUNK_LEN];
    let mut remaining = header.encrypted_size;
    while remaining > 0 {
        let want = remaining.min(CHUNK_LEN as u64) as usize;
        input.read_exact(&mut buf[..want])?;
        body.extend_from_slice(&buf[..want]);
        remaining -= want as u64;
    }

    let cipher = AeadCipher::new(header.algo, AeadKey(key));
    let plaintext = cipher.open(&header.iv, &[], &body)?;

    if plaintext.len() as u64 != header.file_size {
        return Err(Error::Integrity(
            "decrypted length does not match header file_size".into(),
        ));
    }

    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(out_path)?;
    for chunk in plaintext.chunks(CHUNK_LEN) {
        output.write_all(chunk)?;
    }
    output.flush()?;
    debug!(file_size = header.file_size, "decrypted file body verified and written");
    Ok(())
}

/// Remove a possibly-partial output file after a failed decrypt. Callers are
/// expected to invoke this on error rather than leave a truncated file behind.
pub fn remove_partial_output(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn roundtrip(contents: &[u8], algo: AlgoTag) {
        let dir = tempdir().unwrap();
        let in_path = dir.path().join("plain.bin");
        let enc_path = dir.path().join("enc.bin");
        let dec_path = dir.path().join("dec.bin");
        fs::write(&in_path, contents).unwrap();

        let key = [0u8; 32];
        encrypt_file(&in_path, &enc_path, algo, key).unwrap();
        decrypt_file(&enc_path, &dec_path, key).unwrap();

        let round_tripped = fs::read(&dec_path).unwrap();
        assert_eq!(round_tripped, contents);
    }

    #[test]
    fn fs1_hello_world_gcm() {
        let dir = tempdir().unwrap();
        let in_path = dir.path().join("plain.bin");
        let enc_path = dir.path().join("enc.bin");
        let dec_path = dir.path().join("dec.bin");
        fs::write(&in_path, b"hello world\n").unwrap();

        let key = [0u8; 32];
        encrypt_file(&in_path, &enc_path, AlgoTag::Aes256Gcm, key).unwrap();

        let mut f = File::open(&enc_path).unwrap();
        let mut header_bytes = [0u8; HEADER_LEN];
        f.read_exact(&mut header_bytes).unwrap();
        let header = FileHeader::from_bytes(&header_bytes).unwrap();
        assert_eq!(header.file_size, 12);
        assert_eq!(header.encrypted_size, 12 + 16);

        decrypt_file(&enc_path, &dec_path, key).unwrap();
        assert_eq!(fs::read(&dec_path).unwrap(), b"hello world\n");
    }

    #[test]
    fn fs2_tamper_detected() {
        let dir = tempdir().unwrap();
        let in_path = dir.path().join("plain.bin");
        let enc_path = dir.path().join("enc.bin");
        let dec_path = dir.path().join("dec.bin");
        fs::write(&in_path, b"hello world\n").unwrap();
        let key = [0u8; 32];
        encrypt_file(&in_path, &enc_path, AlgoTag::Aes256Gcm, key).unwrap();

        let mut data = fs::read(&enc_path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&enc_path, &data).unwrap();

        let err = decrypt_file(&enc_path, &dec_path, key).unwrap_err();
        assert!(matches!(err, Error::Auth));
    }

    #[test]
    fn empty_file_roundtrips() {
        roundtrip(b"", AlgoTag::ChaCha20Poly1305);
    }

    #[test]
    fn size_not_multiple_of_16_roundtrips() {
        roundtrip(b"exactly 19 bytes!!!", AlgoTag::XChaCha20Poly1305);
    }

    #[test]
    fn rejects_non_zero_reserved_bytes() {
        let dir = tempdir().unwrap();
        let in_path = dir.path().join("plain.bin");
        let enc_path = dir.path().join("enc.bin");
        fs::write(&in_path, b"abc").unwrap();
        encrypt_file(&in_path, &enc_path, AlgoTag::Aes256Gcm, [1u8; 32]).unwrap();

        let mut data = fs::read(&enc_path).unwrap();
        data[108] = 0xAA;
        fs::write(&enc_path, &data).unwrap();

        let dec_path = dir.path().join("dec.bin");
        let err = decrypt_file(&enc_path, &dec_path, [1u8; 32]).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }
}
