use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Result;

/// Registration state of the local client.
pub trait ClientRegistry: Send + Sync {
    fn current_client_id(&self) -> Result<Option<String>>;
    fn mark_mls_client_registered(&self) -> Result<()>;
    fn is_mls_client_registered(&self) -> Result<bool>;
}

/// Asks the sync engine to reconcile local state against the server.
pub trait SlowSyncRecovery: Send + Sync {
    fn restart_slow_sync_for_recovery(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClientRegistration {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    mls_client_registered: bool,
}

#[derive(Debug, Clone)]
pub struct ClientRegistrationFile {
    path: PathBuf,
}

impl ClientRegistrationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn register(&self, client_id: &str) -> Result<()> {
        let mut reg = self.load()?;
        reg.client_id = Some(client_id.to_string());
        self.save(&reg)?;
        info!(event = "client.registered", client_id, "client.registered");
        Ok(())
    }

    fn load(&self) -> Result<ClientRegistration> {
        if !self.path.exists() {
            return Ok(ClientRegistration::default());
        }
        let bytes = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, reg: &ClientRegistration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(reg)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ClientRegistry for ClientRegistrationFile {
    fn current_client_id(&self) -> Result<Option<String>> {
        Ok(self.load()?.client_id)
    }

    fn mark_mls_client_registered(&self) -> Result<()> {
        let mut reg = self.load()?;
        reg.mls_client_registered = true;
        self.save(&reg)?;
        debug!(event = "client.mls_registered", "client.mls_registered");
        Ok(())
    }

    fn is_mls_client_registered(&self) -> Result<bool> {
        Ok(self.load()?.mls_client_registered)
    }
}

/// Drops a marker file the sync engine picks up on its next start.
#[derive(Debug, Clone)]
pub struct RecoveryMarkerFile {
    path: PathBuf,
}

impl RecoveryMarkerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn is_pending(&self) -> bool {
        self.path.exists()
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl SlowSyncRecovery for RecoveryMarkerFile {
    fn restart_slow_sync_for_recovery(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, chrono::Utc::now().to_rfc3339())?;
        info!(
            event = "sync.recovery_requested",
            marker = %self.path.display(),
            "sync.recovery_requested"
        );
        Ok(())
    }
}
