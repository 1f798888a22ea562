use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::QualifiedId;

pub const SECRETS_FILE_NAME: &str = "secrets.enc";
pub const VAULT_KEY_FILE_NAME: &str = "vault.key";

const VAULT_FORMAT: u8 = 1;
const VAULT_NONCE_LEN: usize = 24;
const VAULT_AD: &[u8] = b"keepsake.secrets.v1";

#[derive(Debug, thiserror::Error)]
pub enum SecretsStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("random source failed: {message}")]
    Random { message: String },

    #[error("secrets vault could not be opened with this key")]
    Crypto,

    #[error("secrets vault is malformed: {message}")]
    InvalidFormat { message: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("vault key is not base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<getrandom::Error> for SecretsStoreError {
    fn from(e: getrandom::Error) -> Self {
        Self::Random {
            message: e.to_string(),
        }
    }
}

fn malformed(message: impl Into<String>) -> SecretsStoreError {
    SecretsStoreError::InvalidFormat {
        message: message.into(),
    }
}

/// In-memory key/value map of secrets, e.g. keystore passphrases and the remote token.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SecretsStore {
    entries: BTreeMap<String, String>,
}

impl SecretsStore {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Seals the map under `vault_key`: format byte, nonce, then ciphertext.
    fn seal(&self, vault_key: &[u8; 32]) -> Result<Vec<u8>, SecretsStoreError> {
        let plaintext = serde_json::to_vec(self)?;
        let mut nonce = [0u8; VAULT_NONCE_LEN];
        getrandom::getrandom(&mut nonce)?;

        let sealed = XChaCha20Poly1305::new(vault_key.into())
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: VAULT_AD,
                },
            )
            .map_err(|_| SecretsStoreError::Crypto)?;

        let mut out = Vec::with_capacity(1 + VAULT_NONCE_LEN + sealed.len());
        out.push(VAULT_FORMAT);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open_sealed(vault_key: &[u8; 32], bytes: &[u8]) -> Result<Self, SecretsStoreError> {
        let Some((&format, rest)) = bytes.split_first() else {
            return Err(malformed("empty vault file"));
        };
        if format != VAULT_FORMAT {
            return Err(malformed(format!("unsupported vault format {format}")));
        }
        if rest.len() < VAULT_NONCE_LEN {
            return Err(malformed("vault file is truncated"));
        }
        let (nonce, sealed) = rest.split_at(VAULT_NONCE_LEN);

        let plaintext = XChaCha20Poly1305::new(vault_key.into())
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: VAULT_AD,
                },
            )
            .map_err(|_| SecretsStoreError::Crypto)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreKind {
    Proteus,
    Mls,
}

impl KeystoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proteus => "proteus",
            Self::Mls => "mls",
        }
    }
}

/// Store key of a keystore database passphrase, e.g. `alice@example.com.mls.db_passphrase`.
pub fn db_passphrase_key(account: &QualifiedId, kind: KeystoreKind) -> String {
    format!("{account}.{}.db_passphrase", kind.as_str())
}

/// Secure key-value store holding keystore database passphrases.
pub trait PassphraseStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SecretsStoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SecretsStoreError>;
}

impl PassphraseStore for Mutex<SecretsStore> {
    fn get(&self, key: &str) -> Result<Option<String>, SecretsStoreError> {
        let store = self.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(store.get(key).map(str::to_string))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SecretsStoreError> {
        let mut store = self.lock().unwrap_or_else(PoisonError::into_inner);
        store.set(key, value);
        Ok(())
    }
}

/// Passphrase store persisted as an encrypted file; every `set` rewrites the file.
#[derive(Debug)]
pub struct EncryptedSecretsFile {
    path: PathBuf,
    vault_key: [u8; 32],
    cache: Mutex<SecretsStore>,
}

impl EncryptedSecretsFile {
    pub fn open(path: &Path, vault_key: [u8; 32]) -> Result<Self, SecretsStoreError> {
        let store = if path.exists() {
            SecretsStore::open_sealed(&vault_key, &std::fs::read(path)?)?
        } else {
            SecretsStore::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            vault_key,
            cache: Mutex::new(store),
        })
    }

    /// Opens `secrets.enc` under `dir`, creating the vault key next to it on first use.
    pub fn open_in_dir(dir: &Path) -> Result<Self, SecretsStoreError> {
        let key_path = dir.join(VAULT_KEY_FILE_NAME);
        let vault_key = if key_path.exists() {
            read_vault_key(&key_path)?
        } else {
            let mut key = [0u8; 32];
            getrandom::getrandom(&mut key)?;
            ensure_private_dir(dir)?;
            write_private(&key_path, format!("{}\n", B64.encode(key)).as_bytes())?;
            debug!(
                event = "secrets.vault_key_created",
                path = %key_path.display(),
                "secrets.vault_key_created"
            );
            key
        };
        Self::open(&dir.join(SECRETS_FILE_NAME), vault_key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PassphraseStore for EncryptedSecretsFile {
    fn get(&self, key: &str) -> Result<Option<String>, SecretsStoreError> {
        let store = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(store.get(key).map(str::to_string))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SecretsStoreError> {
        let mut store = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        store.set(key, value);
        let sealed = store.seal(&self.vault_key)?;
        write_private(&self.path, &sealed).map_err(|e| {
            warn!(
                event = "secrets.write_failed",
                path = %self.path.display(),
                error = %e,
                "secrets.write_failed"
            );
            SecretsStoreError::from(e)
        })
    }
}

fn read_vault_key(path: &Path) -> Result<[u8; 32], SecretsStoreError> {
    let text = std::fs::read_to_string(path)?;
    B64.decode(text.trim().as_bytes())?
        .try_into()
        .map_err(|_| malformed("vault key must be exactly 32 bytes"))
}

/// Replaces `path` through a sibling temp file, owner-only on unix.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");

    let mut options = std::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut f = options.open(&tmp)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    std::fs::rename(&tmp, path)
}

fn ensure_private_dir(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}
