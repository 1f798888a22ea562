use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use keepsake_core::client::{ClientRegistrationFile, ClientRegistry};
use keepsake_core::model::QualifiedId;
use keepsake_core::secrets::{KeystoreKind, PassphraseStore, SecretsStore, db_passphrase_key};
use keepsake_core::{
    CryptoStateRestore, CryptoStateSync, Error, InMemoryRemoteBackup, backup_crypto_state,
    restore_crypto_state,
};
use tempfile::TempDir;

fn account() -> QualifiedId {
    QualifiedId::new("alice", "example.com")
}

struct Device {
    proteus: PathBuf,
    mls: PathBuf,
    cache: PathBuf,
    passphrases: Mutex<SecretsStore>,
    registry: ClientRegistrationFile,
}

impl Device {
    fn new(root: &Path) -> Self {
        let proteus = root.join("proteus");
        let mls = root.join("mls");
        std::fs::create_dir_all(&proteus).unwrap();
        std::fs::create_dir_all(&mls).unwrap();
        Self {
            proteus,
            mls,
            cache: root.join("cache"),
            passphrases: Mutex::new(SecretsStore::default()),
            registry: ClientRegistrationFile::new(root.join("client.json")),
        }
    }

    fn seed_keystores(&self) {
        std::fs::create_dir_all(self.proteus.join("prekeys")).unwrap();
        std::fs::write(self.proteus.join("identity.db"), b"proteus identity").unwrap();
        std::fs::write(self.proteus.join("prekeys/1"), b"prekey one").unwrap();
        std::fs::write(self.mls.join("keystore"), b"mls keystore").unwrap();

        let me = account();
        self.passphrases
            .set(&db_passphrase_key(&me, KeystoreKind::Proteus), "proteus-pass")
            .unwrap();
        self.passphrases
            .set(&db_passphrase_key(&me, KeystoreKind::Mls), "mls-pass")
            .unwrap();
    }

    fn sync<'a>(
        &'a self,
        account: &'a QualifiedId,
        remote: &'a InMemoryRemoteBackup,
        enabled: bool,
    ) -> CryptoStateSync<'a> {
        CryptoStateSync {
            account,
            enabled,
            proteus_dir: &self.proteus,
            mls_dir: &self.mls,
            cache_dir: &self.cache,
            remote,
            passphrases: &self.passphrases,
            registry: &self.registry,
        }
    }
}

#[tokio::test]
async fn empty_keystores_never_reach_the_network() {
    let temp = TempDir::new().unwrap();
    let device = Device::new(temp.path());
    device.registry.register("client-1").unwrap();
    let remote = InMemoryRemoteBackup::new();
    let me = account();

    let err = backup_crypto_state(&device.sync(&me, &remote, true), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Precondition { .. }), "{err:?}");
    assert_eq!(remote.calls(), 0);
}

#[tokio::test]
async fn disabled_sync_or_missing_client_is_a_precondition_failure() {
    let temp = TempDir::new().unwrap();
    let device = Device::new(temp.path());
    device.seed_keystores();
    let remote = InMemoryRemoteBackup::new();
    let me = account();

    let err = backup_crypto_state(&device.sync(&me, &remote, true), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Precondition { .. }), "{err:?}");

    device.registry.register("client-1").unwrap();
    let err = backup_crypto_state(&device.sync(&me, &remote, false), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Precondition { .. }), "{err:?}");
    assert_eq!(remote.calls(), 0);
}

#[tokio::test]
async fn unchanged_material_is_uploaded_once() {
    let temp = TempDir::new().unwrap();
    let device = Device::new(temp.path());
    device.seed_keystores();
    device.registry.register("client-1").unwrap();
    let remote = InMemoryRemoteBackup::new();
    let me = account();
    let sync = device.sync(&me, &remote, true);

    let first = backup_crypto_state(&sync, None).await.unwrap();
    assert!(first.uploaded);
    assert_eq!(first.hash.len(), 64);

    let second = backup_crypto_state(&sync, Some(&first.hash)).await.unwrap();
    assert!(!second.uploaded);
    assert_eq!(second.hash, first.hash);
    assert_eq!(remote.state_uploads.load(Ordering::Relaxed), 1);

    std::fs::write(device.mls.join("keystore"), b"rotated mls keystore").unwrap();
    let third = backup_crypto_state(&sync, Some(&first.hash)).await.unwrap();
    assert!(third.uploaded);
    assert_ne!(third.hash, first.hash);
    assert_eq!(remote.state_uploads.load(Ordering::Relaxed), 2);

    let leftovers: Vec<_> = std::fs::read_dir(&device.cache).unwrap().collect();
    assert!(leftovers.is_empty(), "temporary archives must be removed");
}

#[tokio::test]
async fn restore_without_stored_state_reports_nothing_found() {
    let temp = TempDir::new().unwrap();
    let device = Device::new(temp.path());
    let remote = InMemoryRemoteBackup::new();
    let me = account();

    let outcome = restore_crypto_state(&device.sync(&me, &remote, true))
        .await
        .unwrap();
    assert_eq!(outcome, CryptoStateRestore::NoBackupFound);
    assert_eq!(remote.state_downloads.load(Ordering::Relaxed), 1);
    assert!(std::fs::read_dir(&device.proteus).unwrap().next().is_none());
}

#[tokio::test]
async fn backup_restores_onto_a_fresh_device() {
    let temp = TempDir::new().unwrap();
    let old = Device::new(&temp.path().join("old"));
    old.seed_keystores();
    old.registry.register("client-1").unwrap();
    let remote = InMemoryRemoteBackup::new();
    let me = account();

    backup_crypto_state(&old.sync(&me, &remote, true), None)
        .await
        .unwrap();
    assert!(remote.crypto_state(&me).await.is_some());

    let new = Device::new(&temp.path().join("new"));
    let outcome = restore_crypto_state(&new.sync(&me, &remote, true))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CryptoStateRestore::Restored {
            client_id: "client-1".to_string(),
            proteus: true,
            mls: true,
        }
    );

    assert_eq!(
        std::fs::read(new.proteus.join("identity.db")).unwrap(),
        b"proteus identity"
    );
    assert_eq!(
        std::fs::read(new.proteus.join("prekeys/1")).unwrap(),
        b"prekey one"
    );
    assert_eq!(std::fs::read(new.mls.join("keystore")).unwrap(), b"mls keystore");
    assert_eq!(
        new.passphrases
            .get(&db_passphrase_key(&me, KeystoreKind::Proteus))
            .unwrap()
            .as_deref(),
        Some("proteus-pass")
    );
    assert_eq!(
        new.passphrases
            .get(&db_passphrase_key(&me, KeystoreKind::Mls))
            .unwrap()
            .as_deref(),
        Some("mls-pass")
    );
    assert!(new.registry.is_mls_client_registered().unwrap());
}
