use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::crypto::{KDF_DEFAULT_ITERATIONS, validate_kdf_iterations};
use crate::model::QualifiedId;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_TOKEN_KEY: &str = "remote.access_token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub crypto_state: CryptoStateSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Paths {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub page_size: u32,
    pub kdf_iterations: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoStateSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub base_url: String,
    /// Secrets-store key of the bearer token sent to the backup service.
    #[serde(default = "default_token_key")]
    pub token_key: String,
}

fn default_token_key() -> String {
    DEFAULT_TOKEN_KEY.to_string()
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            kdf_iterations: KDF_DEFAULT_ITERATIONS,
        }
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_key: default_token_key(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            paths: Paths::default(),
            backup: BackupSettings::default(),
            crypto_state: CryptoStateSettings::default(),
            remote: RemoteSettings::default(),
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) | None => {
            let mut table = raw;
            if let Some(t) = table.as_table_mut() {
                t.entry("version")
                    .or_insert(toml::Value::Integer(i64::from(SETTINGS_SCHEMA_VERSION)));
            }
            table.try_into::<Settings>()
        }
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
    }
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })?;

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    if settings.backup.page_size == 0 {
        return Err(Error::InvalidConfig {
            message: "backup.page_size must be >= 1".to_string(),
        });
    }

    validate_kdf_iterations(settings.backup.kdf_iterations).map_err(|e| Error::InvalidConfig {
        message: format!("backup.kdf_iterations: {e}"),
    })?;

    if settings.crypto_state.enabled && settings.remote.base_url.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "crypto_state.enabled requires remote.base_url".to_string(),
        });
    }

    if !settings.remote.base_url.trim().is_empty()
        && !(settings.remote.base_url.starts_with("http://")
            || settings.remote.base_url.starts_with("https://"))
    {
        return Err(Error::InvalidConfig {
            message: "remote.base_url must be an http(s) url".to_string(),
        });
    }

    Ok(())
}

/// Per-account locations under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPaths {
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub proteus_dir: PathBuf,
    pub mls_dir: PathBuf,
    pub secrets_dir: PathBuf,
    pub client_registration: PathBuf,
    pub recovery_marker: PathBuf,
    pub cache_dir: PathBuf,
}

impl AccountPaths {
    pub fn new(data_dir: &Path, cache_dir: Option<&Path>, account: &QualifiedId) -> Self {
        let root = data_dir
            .join("accounts")
            .join(sanitize_path_component(&account.to_string()));
        let cache_dir = cache_dir
            .map(|c| c.join(sanitize_path_component(&account.to_string())))
            .unwrap_or_else(|| root.join("cache"));
        Self {
            db_path: root.join("user.db"),
            proteus_dir: root.join("keystores").join("proteus"),
            mls_dir: root.join("keystores").join("mls"),
            secrets_dir: root.join("secrets"),
            client_registration: root.join("client.json"),
            recovery_marker: root.join("slow-sync.pending"),
            cache_dir,
            root,
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}

fn sanitize_path_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' | '@' => c,
            _ => '_',
        })
        .collect()
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let s = parse_settings("[crypto_state]\nenabled = false\n").unwrap();
        assert_eq!(s.version, SETTINGS_SCHEMA_VERSION);
        assert_eq!(s.backup.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(s.backup.kdf_iterations, KDF_DEFAULT_ITERATIONS);
        assert_eq!(s.remote.token_key, DEFAULT_TOKEN_KEY);
        validate_settings(&s).unwrap();
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let err = parse_settings("version = 9\n").unwrap_err();
        assert!(err.to_string().contains("unsupported settings schema version"));
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut s = Settings::default();
        s.backup.page_size = 0;
        assert!(validate_settings(&s).unwrap_err().to_string().contains("page_size"));

        let mut s = Settings::default();
        s.backup.kdf_iterations = 5;
        assert!(
            validate_settings(&s)
                .unwrap_err()
                .to_string()
                .contains("kdf_iterations")
        );

        let mut s = Settings::default();
        s.crypto_state.enabled = true;
        assert!(validate_settings(&s).unwrap_err().to_string().contains("base_url"));
        s.remote.base_url = "https://backup.example.com".to_string();
        validate_settings(&s).unwrap();
    }

    #[test]
    fn settings_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::default();
        s.backup.page_size = 50;
        save_settings(dir.path(), &s).unwrap();
        let loaded = load_settings(dir.path()).unwrap();
        assert_eq!(loaded.backup.page_size, 50);
    }

    #[test]
    fn account_paths_are_scoped_per_account() {
        let a = AccountPaths::new(Path::new("/data"), None, &QualifiedId::new("u1", "d.com"));
        assert_eq!(a.root, Path::new("/data/accounts/u1@d.com"));
        assert_eq!(a.mls_dir, Path::new("/data/accounts/u1@d.com/keystores/mls"));
        assert_eq!(a.cache_dir, Path::new("/data/accounts/u1@d.com/cache"));
    }
}
