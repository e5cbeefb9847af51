use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const KEY_SEPARATOR: &[u8] = b"!";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext shorter than nonce")]
    Truncated,
    #[error("encrypt failed")]
    Encrypt,
    #[error("authentication failed")]
    Authentication,
}

pub type CacheKey = Zeroizing<[u8; KEY_LEN]>;

/// Derive the cache key for one database file.
///
/// The digest input is `path!secret!modified_nanos`, so changing the file
/// (and therefore its mtime) yields an unrelated key and every record sealed
/// under the old one stops authenticating.
pub fn derive_cache_key(db_path: &str, secret: &str, modified_nanos: i128) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(db_path.as_bytes());
    hasher.update(KEY_SEPARATOR);
    hasher.update(secret.as_bytes());
    hasher.update(KEY_SEPARATOR);
    hasher.update(modified_nanos.to_string().as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&hasher.finalize());
    key
}

/// Nanoseconds since the unix epoch, negative for earlier timestamps.
pub fn unix_nanos(time: SystemTime) -> i128 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos() as i128,
        Err(before) => -(before.duration().as_nanos() as i128),
    }
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// AES-256-GCM seal; the output is `nonce || ciphertext`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key));
    let nonce = generate_nonce();
    let ciphertext = cipher
        .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal`].
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

/// A protected field value at rest in memory.
#[derive(Clone)]
pub struct SealedValue {
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl std::fmt::Debug for SealedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedValue")
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

/// Per-handle ChaCha20-Poly1305 key used to keep protected fields sealed
/// while a database is open.
pub struct FieldCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl FieldCipher {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self { key }
    }

    pub fn seal(&self, plaintext: &str) -> Result<SealedValue, CryptoError> {
        let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.key[..]));
        let nonce = generate_nonce();
        let ciphertext = cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(SealedValue { nonce, ciphertext })
    }

    pub fn open(&self, value: &SealedValue) -> Result<Zeroizing<String>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.key[..]));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    chacha20poly1305::Nonce::from_slice(&value.nonce),
                    value.ciphertext.as_slice(),
                )
                .map_err(|_| CryptoError::Authentication)?,
        );
        let text = std::str::from_utf8(&plaintext).map_err(|_| CryptoError::Authentication)?;
        Ok(Zeroizing::new(text.to_owned()))
    }
}
