use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static RUN_LOGGER: OnceLock<RunLogger> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

pub const RUN_KINDS: &[&str] = &["export", "import", "crypto-state", "message-restore"];

#[derive(Debug)]
struct RunState {
    writer: Option<BufWriter<std::fs::File>>,
}

#[derive(Debug)]
struct RunLogger {
    state: Mutex<RunState>,
}

impl RunLogger {
    fn new() -> Self {
        Self {
            state: Mutex::new(RunState { writer: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, path: &Path) -> std::io::Result<()> {
        let mut guard = self.lock();
        if guard.writer.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "run log already active",
            ));
        }

        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        guard.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn finish(&self) -> std::io::Result<()> {
        let mut guard = self.lock();
        let Some(mut writer) = guard.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

enum RunLogWriter<'a> {
    Sink(std::io::Sink),
    Guard(MutexGuard<'a, RunState>),
}

impl Write for RunLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Sink(sink) => sink.write(buf),
            Self::Guard(guard) => match guard.writer.as_mut() {
                Some(w) => w.write(buf),
                None => Ok(buf.len()),
            },
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Sink(sink) => sink.flush(),
            Self::Guard(guard) => match guard.writer.as_mut() {
                Some(w) => w.flush(),
                None => Ok(()),
            },
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RunLogger {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = self.lock();
        if guard.writer.is_some() {
            RunLogWriter::Guard(guard)
        } else {
            RunLogWriter::Sink(std::io::sink())
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &RunLogger {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(keepsake_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("debug");

    if let Some(v) = keepsake_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var("KEEPSAKE_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

pub fn init_run_logging() {
    TRACING_INIT.get_or_init(|| {
        let logger = RUN_LOGGER.get_or_init(RunLogger::new);
        let env_filter = build_env_filter();

        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(logger);

        let subscriber = tracing_subscriber::registry().with(env_filter).with(layer);
        let _ = subscriber.try_init();
    });
}

/// Active run log. Dropping it records `run.finish` with the elapsed time, then
/// flushes and closes the file.
pub struct RunLogGuard {
    path: PathBuf,
    kind: String,
    run_id: String,
    started: Instant,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        info!(
            event = "run.finish",
            kind = %self.kind,
            run_id = %self.run_id,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "run.finish"
        );
        if let Some(logger) = RUN_LOGGER.get() {
            let _ = logger.finish();
        }
    }
}

/// Routes all tracing events to `runs/<kind>-<utc>-<run_id>.ndjson` until the guard
/// drops. Only one run log is active per process.
pub fn start_run_log(kind: &str, run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_run_logging();

    if !RUN_KINDS.contains(&kind) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported run kind: {kind}"),
        ));
    }

    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;
    let path = log_dir.join(format!(
        "{}-{}-{}.ndjson",
        sanitize_filename_component(kind),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    ));

    RUN_LOGGER.get_or_init(RunLogger::new).start(&path)?;
    info!(event = "run.start", kind, run_id, "run.start");

    Ok(RunLogGuard {
        path,
        kind: kind.to_string(),
        run_id: run_id.to_string(),
        started: Instant::now(),
    })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    if let Ok(v) = std::env::var("KEEPSAKE_LOG_DIR") {
        return PathBuf::from(v);
    }
    data_dir.join("runs")
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
