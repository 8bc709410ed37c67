//! Key-value backends for credential persistence
//!
//! The credential store only needs three synchronous operations on string
//! values. `MemoryStore` keeps them in process memory; `FileStore` keeps them
//! in a JSON file, optionally encrypted with ChaCha20-Poly1305.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use common::Secret;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Synchronous string key-value persistence.
pub trait KeyValueStore: Send + Sync {
    /// Read a value. `Ok(None)` means the key is not present.
    fn get_string(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Volatile in-process backend.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with initial values.
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: Mutex::new(
                values
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| Error::Io("memory store lock poisoned".into()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// On-disk layout of an encrypted store.
#[derive(Serialize, Deserialize)]
struct EncryptedEnvelope {
    nonce: String,
    ciphertext: String,
}

/// JSON file backend.
///
/// Every read goes to disk so a corrupt or undecryptable file surfaces as a
/// read error on the key being read. Writes are read-modify-write under a
/// mutex and replace the file atomically (temp file + rename, mode 0600).
/// A file that cannot be parsed or decrypted is overwritten by the next write,
/// so a stale key or corrupt file never blocks persistence for good.
pub struct FileStore {
    path: PathBuf,
    cipher: Option<ChaCha20Poly1305>,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Plaintext store at `path`. The file is created on first write.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cipher: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Encrypted store at `path`. The cipher key is the SHA-256 digest of `key`.
    pub fn encrypted(path: PathBuf, key: &Secret<String>) -> Self {
        let digest = Sha256::digest(key.expose().as_bytes());
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&digest));
        Self {
            path,
            cipher: Some(cipher),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Io(format!("reading {}: {e}", self.path.display())))?;

        let plaintext = match &self.cipher {
            Some(cipher) => decrypt(cipher, &contents)?,
            None => contents.into_bytes(),
        };

        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Format(format!("parsing {}: {e}", self.path.display())))
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_vec(map)
            .map_err(|e| Error::Format(format!("serializing store: {e}")))?;
        let contents = match &self.cipher {
            Some(cipher) => encrypt(cipher, &json)?,
            None => json,
        };
        write_atomic(&self.path, &contents)
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Io("file store lock poisoned".into()))?;
        let mut map = match self.read_map() {
            Ok(map) => map,
            Err(e @ (Error::Format(_) | Error::Encryption(_))) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "unreadable store file, overwriting with fresh contents"
                );
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };
        apply(&mut map);
        self.write_map(&map)
    }
}

impl KeyValueStore for FileStore {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|map| {
            map.insert(key.to_owned(), value.to_owned());
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        self.update(|map| {
            map.remove(key);
        })
    }
}

fn encrypt(cipher: &ChaCha20Poly1305, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; 12];
    rand::rng().fill(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Encryption(format!("encrypting store: {e}")))?;

    let envelope = EncryptedEnvelope {
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
    };
    serde_json::to_vec(&envelope).map_err(|e| Error::Format(format!("serializing envelope: {e}")))
}

fn decrypt(cipher: &ChaCha20Poly1305, contents: &str) -> Result<Vec<u8>> {
    let envelope: EncryptedEnvelope = serde_json::from_str(contents)
        .map_err(|e| Error::Format(format!("parsing encrypted envelope: {e}")))?;
    let nonce = STANDARD
        .decode(&envelope.nonce)
        .map_err(|e| Error::Format(format!("decoding nonce: {e}")))?;
    if nonce.len() != 12 {
        return Err(Error::Format(format!(
            "nonce must be 12 bytes, got {}",
            nonce.len()
        )));
    }
    let ciphertext = STANDARD
        .decode(&envelope.ciphertext)
        .map_err(|e| Error::Format(format!("decoding ciphertext: {e}")))?;

    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| Error::Encryption("decryption failed (wrong key or tampered file)".into()))
}

/// Replace `path` with `contents` atomically, owner read/write only.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("auth-storage");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, contents)
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted auth storage");
    Ok(())
}
