use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use keepsake_core::client::{ClientRegistrationFile, ClientRegistry, RecoveryMarkerFile};
use keepsake_core::config::{AccountPaths, Settings, load_settings, save_settings, validate_settings};
use keepsake_core::model::QualifiedId;
use keepsake_core::progress::{ProgressSink, TaskProgress};
use keepsake_core::run_log::{RunLogGuard, start_run_log};
use keepsake_core::secrets::{EncryptedSecretsFile, PassphraseStore};
use keepsake_core::{
    APP_NAME, BackupFormat, CryptoStateRestore, CryptoStateSync, ExportOptions, ExportUploadJob,
    HttpRemoteBackupConfig, HttpRemoteBackupService, LegacyExportOptions, MultiplatformExporter,
    MultiplatformImporter, PassphraseCipher, RemoteBackupService, RestoreContext, RestoreFailure,
    SqliteUserDb, backup_crypto_state, classify, detect_format, export_legacy,
    export_multiplatform, restore_backup, restore_crypto_state, restore_multiplatform,
    restore_remote_messages, spawn_export_upload,
};
use serde::Serialize;
use tracing::debug;

#[derive(Parser)]
#[command(name = "keepsake")]
#[command(about = "Keepsake CLI (message history backup and crypto-state archives)", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Account as `id@domain`.
    #[arg(long, global = true)]
    account: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    Secrets {
        #[command(subcommand)]
        cmd: SecretsCmd,
    },
    Client {
        #[command(subcommand)]
        cmd: ClientCmd,
    },
    Export {
        #[command(subcommand)]
        cmd: ExportCmd,
    },
    Import {
        #[arg(long)]
        archive: PathBuf,
        /// Read the backup password from stdin.
        #[arg(long)]
        password_stdin: bool,
    },
    Detect {
        #[arg(long)]
        archive: PathBuf,
    },
    CryptoState {
        #[command(subcommand)]
        cmd: CryptoStateCmd,
    },
    Messages {
        #[command(subcommand)]
        cmd: MessagesCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Subcommand)]
enum SecretsCmd {
    SetRemoteToken,
}

#[derive(Subcommand)]
enum ClientCmd {
    Register {
        #[arg(long)]
        client_id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Legacy,
    Multiplatform,
}

#[derive(Subcommand)]
enum ExportCmd {
    Run {
        #[arg(long, value_enum, default_value = "multiplatform")]
        format: ExportFormat,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        password_stdin: bool,
        /// Upload the finished artifact to the backup service.
        #[arg(long)]
        upload: bool,
    },
}

#[derive(Subcommand)]
enum CryptoStateCmd {
    Backup {
        /// Digest of the last uploaded archive; an identical archive is not uploaded again.
        #[arg(long)]
        last_hash: Option<String>,
    },
    Restore,
}

#[derive(Subcommand)]
enum MessagesCmd {
    Restore,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

struct NdjsonProgressSink {
    task_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: TaskProgress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "phase": p.phase,
            "pagesTotal": p.pages_total,
            "pagesDone": p.pages_done,
            "itemsDone": p.items_done,
            "bytesWritten": p.bytes_written,
            "bytesUploaded": p.bytes_uploaded,
            "fraction": p.fraction(),
        });
        println!("{line}");
    }
}

/// Resolved locations and settings shared by every account-scoped command.
struct Env {
    settings: Settings,
    data_dir: PathBuf,
    account: QualifiedId,
    paths: AccountPaths,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("KEEPSAKE_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir_override = cli
        .data_dir
        .or_else(|| std::env::var("KEEPSAKE_DATA_DIR").ok().map(PathBuf::from));

    match cli.cmd {
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
        Command::Detect { archive } => detect_run(&archive, cli.json),
        cmd => {
            let env = account_env(&config_dir, data_dir_override, cli.account.as_deref())?;
            match cmd {
                Command::Secrets { cmd } => match cmd {
                    SecretsCmd::SetRemoteToken => secrets_set_remote_token(&env, cli.json),
                },
                Command::Client { cmd } => match cmd {
                    ClientCmd::Register { client_id } => client_register(&env, &client_id, cli.json),
                },
                Command::Export { cmd } => match cmd {
                    ExportCmd::Run {
                        format,
                        out,
                        password_stdin,
                        upload,
                    } => {
                        let password = read_password(password_stdin)?;
                        export_run(&env, format, out, password, upload, cli.json, cli.events).await
                    }
                },
                Command::Import {
                    archive,
                    password_stdin,
                } => {
                    let password = read_password(password_stdin)?;
                    import_run(&env, archive, password, cli.json).await
                }
                Command::CryptoState { cmd } => match cmd {
                    CryptoStateCmd::Backup { last_hash } => {
                        crypto_state_backup(&env, last_hash.as_deref(), cli.json).await
                    }
                    CryptoStateCmd::Restore => crypto_state_restore(&env, cli.json).await,
                },
                Command::Messages { cmd } => match cmd {
                    MessagesCmd::Restore => messages_restore(&env, cli.json).await,
                },
                Command::Settings { .. } | Command::Detect { .. } => Ok(()),
            }
        }
    }
}

fn account_env(
    config_dir: &Path,
    data_dir_override: Option<PathBuf>,
    account: Option<&str>,
) -> Result<Env, CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    let account = account
        .map(str::to_string)
        .or_else(|| std::env::var("KEEPSAKE_ACCOUNT").ok())
        .ok_or_else(|| CliError::new("config.invalid", "--account is required"))?;
    let account: QualifiedId = account.parse().map_err(map_core_err)?;

    let data_dir = data_dir_override
        .or_else(|| settings.paths.data_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);
    let cache_dir = settings.paths.cache_dir.as_ref().map(PathBuf::from);
    let paths = AccountPaths::new(&data_dir, cache_dir.as_deref(), &account);
    paths
        .create_dirs()
        .map_err(|e| CliError::new("config.write_failed", e.to_string()))?;

    Ok(Env {
        settings,
        data_dir,
        account,
        paths,
    })
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = toml::to_string(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = keepsake_core::config::parse_settings(&input)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    validate_settings(&settings).map_err(map_core_err)?;
    save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

fn secrets_set_remote_token(env: &Env, json: bool) -> Result<(), CliError> {
    let mut token = String::new();
    std::io::stdin()
        .read_to_string(&mut token)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(CliError::new("config.invalid", "token is empty"));
    }
    let store = open_secrets(env)?;
    store
        .set(&env.settings.remote.token_key, &token)
        .map_err(|e| CliError::new("secrets.write_failed", e.to_string()))?;
    print_ok(json);
    Ok(())
}

fn client_register(env: &Env, client_id: &str, json: bool) -> Result<(), CliError> {
    ClientRegistrationFile::new(&env.paths.client_registration)
        .register(client_id)
        .map_err(map_core_err)?;
    print_ok(json);
    Ok(())
}

fn detect_run(archive: &Path, json: bool) -> Result<(), CliError> {
    let class = classify(archive).map_err(map_core_err)?;
    let format = detect_format(archive).map_err(map_core_err)?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "class": class.as_str(),
                "format": format.map(BackupFormat::as_str),
            })
        );
    } else {
        println!("class={}", class.as_str());
        println!("format={}", format.map_or("unknown", BackupFormat::as_str));
    }
    Ok(())
}

async fn export_run(
    env: &Env,
    format: ExportFormat,
    out: PathBuf,
    password: Option<String>,
    upload: bool,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let task_id = format!("tsk_{}", uuid::Uuid::new_v4());
    let _log = run_log("export", &task_id, &env.data_dir)?;
    let db = open_db(env).await?;
    let cipher = cipher(&env.settings)?;
    let client_id = current_client_id(env)?;

    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": task_id,
                "kind": "export",
                "state": "running"
            })
        );
    }

    let artifact = match format {
        ExportFormat::Legacy => {
            let artifact = export_legacy(
                &db,
                LegacyExportOptions {
                    account: &env.account,
                    client_id: client_id.as_deref(),
                    work_root: &env.paths.cache_dir,
                    output: &out,
                    password: password.as_deref(),
                    cipher,
                },
            )
            .await
            .map_err(map_core_err)?;
            if upload {
                let remote = remote_service(env)?;
                remote
                    .upload_backup_artifact(&env.account, &artifact.path, artifact.size)
                    .await
                    .map_err(map_core_err)?;
            }
            artifact
        }
        ExportFormat::Multiplatform => {
            let exporter = MultiplatformExporter::new(
                &env.account,
                client_id.as_deref(),
                env.settings.backup.page_size,
                &env.paths.cache_dir,
                cipher,
            )
            .map_err(map_core_err)?;
            let db = Arc::new(db);

            if upload {
                let remote: Arc<dyn RemoteBackupService> = Arc::new(remote_service(env)?);
                let progress: Option<Arc<dyn ProgressSink>> = if events {
                    Some(Arc::new(NdjsonProgressSink {
                        task_id: task_id.clone(),
                    }))
                } else {
                    None
                };
                let task = spawn_export_upload(ExportUploadJob {
                    db,
                    remote,
                    exporter,
                    password,
                    output: out,
                    progress,
                });
                task.wait().await.map_err(map_core_err)?
            } else {
                let sink = NdjsonProgressSink {
                    task_id: task_id.clone(),
                };
                let exporter = Arc::new(exporter);
                export_multiplatform(
                    db,
                    exporter.clone(),
                    ExportOptions {
                        cancel: None,
                        progress: if events { Some(&sink) } else { None },
                    },
                )
                .await
                .map_err(map_core_err)?;
                tokio::task::spawn_blocking(move || exporter.finalize(password.as_deref(), &out))
                    .await
                    .map_err(|e| CliError::new("unknown", e.to_string()))?
                    .map_err(map_core_err)?
            }
        }
    };

    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": task_id,
                "kind": "export",
                "state": "succeeded",
                "path": artifact.path,
            })
        );
        return Ok(());
    }
    if json {
        println!("{}", to_json(&artifact)?);
    } else {
        println!("path={}", artifact.path.display());
        println!("size={} encrypted={}", artifact.size, artifact.encrypted);
    }
    Ok(())
}

async fn import_run(
    env: &Env,
    archive: PathBuf,
    password: Option<String>,
    json: bool,
) -> Result<(), CliError> {
    let task_id = format!("tsk_{}", uuid::Uuid::new_v4());
    let _log = run_log("import", &task_id, &env.data_dir)?;
    let db = open_db(env).await?;
    let cipher = cipher(&env.settings)?;

    let format = detect_format(&archive).map_err(map_core_err)?;
    let report = match format {
        Some(BackupFormat::MultiplatformPaged) => {
            let importer = MultiplatformImporter::new(&env.account, &env.paths.cache_dir)
                .with_cipher(cipher);
            let mut import = tokio::task::spawn_blocking(move || {
                importer.import_from_file(&archive, password.as_deref())
            })
            .await
            .map_err(|e| CliError::new("unknown", e.to_string()))?
            .map_err(|e| map_restore_failure(e.into()))?;
            let stats = restore_multiplatform(&mut import, &db)
                .await
                .map_err(|e| map_restore_failure(e.into()))?;
            serde_json::json!({ "kind": "multiplatform", "stats": stats })
        }
        Some(BackupFormat::LegacySingleDb | BackupFormat::WebCompatible) => {
            let client_id = current_client_id(env)?;
            let recovery = RecoveryMarkerFile::new(&env.paths.recovery_marker);
            let mut ctx = RestoreContext::new(&env.account, &env.paths.cache_dir, &recovery);
            ctx.current_client_id = client_id.as_deref();
            ctx.cipher = cipher;
            let report = restore_backup(&db, &archive, password.as_deref(), &ctx)
                .await
                .map_err(map_restore_failure)?;
            serde_json::to_value(report)
                .map_err(|e| CliError::new("unknown", e.to_string()))?
        }
        Some(BackupFormat::CryptoState) => {
            return Err(CliError::new(
                "backup.incompatible",
                "crypto-state archives are restored with `crypto-state restore`",
            ));
        }
        None => {
            return Err(CliError::new(
                "backup.incompatible",
                "archive is not a recognised backup",
            ));
        }
    };

    if json {
        println!("{report}");
    } else {
        println!("{report:#}");
    }
    Ok(())
}

async fn crypto_state_backup(env: &Env, last_hash: Option<&str>, json: bool) -> Result<(), CliError> {
    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _log = run_log("crypto-state", &run_id, &env.data_dir)?;
    let remote = remote_service(env)?;
    let secrets = open_secrets(env)?;
    let registry = ClientRegistrationFile::new(&env.paths.client_registration);

    let res = backup_crypto_state(
        &crypto_state_sync(env, &remote, &secrets, &registry),
        last_hash,
    )
    .await
    .map_err(map_core_err)?;

    if json {
        println!("{}", to_json(&res)?);
    } else {
        println!("hash={}", res.hash);
        println!("uploaded={}", res.uploaded);
    }
    Ok(())
}

async fn crypto_state_restore(env: &Env, json: bool) -> Result<(), CliError> {
    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _log = run_log("crypto-state", &run_id, &env.data_dir)?;
    let remote = remote_service(env)?;
    let secrets = open_secrets(env)?;
    let registry = ClientRegistrationFile::new(&env.paths.client_registration);

    let res = restore_crypto_state(&crypto_state_sync(env, &remote, &secrets, &registry))
        .await
        .map_err(map_core_err)?;

    if json {
        println!("{}", to_json(&res)?);
    } else {
        match res {
            CryptoStateRestore::Restored {
                client_id,
                proteus,
                mls,
            } => {
                println!("clientId={client_id}");
                println!("proteus={proteus} mls={mls}");
            }
            CryptoStateRestore::NoBackupFound => println!("noBackupFound=true"),
        }
    }
    Ok(())
}

async fn messages_restore(env: &Env, json: bool) -> Result<(), CliError> {
    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let _log = run_log("message-restore", &run_id, &env.data_dir)?;
    let remote = remote_service(env)?;
    let db = open_db(env).await?;

    let restored = restore_remote_messages(&remote, &db, &env.account)
        .await
        .map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "restored": restored }));
    } else {
        println!("restored={restored}");
    }
    Ok(())
}

fn crypto_state_sync<'a>(
    env: &'a Env,
    remote: &'a HttpRemoteBackupService,
    secrets: &'a EncryptedSecretsFile,
    registry: &'a ClientRegistrationFile,
) -> CryptoStateSync<'a> {
    CryptoStateSync {
        account: &env.account,
        enabled: env.settings.crypto_state.enabled,
        proteus_dir: &env.paths.proteus_dir,
        mls_dir: &env.paths.mls_dir,
        cache_dir: &env.paths.cache_dir,
        remote,
        passphrases: secrets,
        registry,
    }
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    if cfg!(target_os = "macos") {
        PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join(APP_NAME)
    } else {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(home).join(".config"))
            .join(APP_NAME.to_lowercase())
    }
}

fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        return default_config_dir();
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".local").join("share"))
        .join(APP_NAME.to_lowercase())
}

fn run_log(kind: &str, run_id: &str, data_dir: &Path) -> Result<RunLogGuard, CliError> {
    let guard = start_run_log(kind, run_id, data_dir)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))?;
    debug!(event = "run.log_path", path = %guard.path().display(), "run.log_path");
    Ok(guard)
}

async fn open_db(env: &Env) -> Result<SqliteUserDb, CliError> {
    SqliteUserDb::open(&env.paths.db_path)
        .await
        .map_err(map_core_err)
}

fn cipher(settings: &Settings) -> Result<PassphraseCipher, CliError> {
    PassphraseCipher::new(settings.backup.kdf_iterations).map_err(map_core_err)
}

fn current_client_id(env: &Env) -> Result<Option<String>, CliError> {
    ClientRegistrationFile::new(&env.paths.client_registration)
        .current_client_id()
        .map_err(map_core_err)
}

fn open_secrets(env: &Env) -> Result<EncryptedSecretsFile, CliError> {
    EncryptedSecretsFile::open_in_dir(&env.paths.secrets_dir)
        .map_err(|e| CliError::new("secrets.unavailable", e.to_string()))
}

fn remote_service(env: &Env) -> Result<HttpRemoteBackupService, CliError> {
    let base_url = env.settings.remote.base_url.trim();
    if base_url.is_empty() {
        return Err(CliError::new("config.invalid", "remote.base_url is empty"));
    }
    let access_token = open_secrets(env)?
        .get(&env.settings.remote.token_key)
        .map_err(|e| CliError::new("secrets.unavailable", e.to_string()))?;
    Ok(HttpRemoteBackupService::new(HttpRemoteBackupConfig {
        base_url: base_url.to_string(),
        access_token,
    }))
}

fn read_password(from_stdin: bool) -> Result<Option<String>, CliError> {
    if !from_stdin {
        return Ok(None);
    }
    let mut password = String::new();
    std::io::stdin()
        .read_to_string(&mut password)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let password = password.trim_end_matches(['\r', '\n']).to_string();
    Ok((!password.is_empty()).then_some(password))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CliError> {
    serde_json::to_string(value).map_err(|e| CliError::new("unknown", e.to_string()))
}

fn print_ok(json: bool) {
    if json {
        println!("{}", serde_json::json!({ "ok": true }));
    } else {
        println!("ok");
    }
}

fn map_core_err(e: keepsake_core::Error) -> CliError {
    match e {
        keepsake_core::Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        keepsake_core::Error::Remote { message } => {
            CliError::retryable("remote.unavailable", message)
        }
        keepsake_core::Error::Precondition { message } => {
            CliError::new("precondition.failed", message)
        }
        keepsake_core::Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
        other => map_restore_failure(other.into()),
    }
}

fn map_restore_failure(f: RestoreFailure) -> CliError {
    match f {
        RestoreFailure::InvalidPassword => {
            CliError::new("backup.invalid_password", f.to_string())
        }
        RestoreFailure::InvalidUserId => CliError::new("backup.invalid_user_id", f.to_string()),
        RestoreFailure::IncompatibleBackup(reason) => {
            CliError::new("backup.incompatible", reason)
        }
        RestoreFailure::IoFailure(reason) => CliError::new("backup.io_failure", reason),
        RestoreFailure::DecryptionFailure(reason) => {
            CliError::new("backup.decryption_failure", reason)
        }
        RestoreFailure::Unknown(reason) => CliError::new("unknown", reason),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
