use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;

use crate::metrics::TelemetrySnapshot;
use crate::module_store::ModuleId;

/// What a journal entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchKind {
    Attach,
    Detach,
}

/// One attempted scheduler switch, written as a JSON line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchingEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SwitchKind,
    pub previous_scheduler: Option<String>,
    pub new_scheduler: Option<String>,
    pub priority: Option<u8>,
    pub metrics: BTreeMap<String, f64>,
    pub switch_duration_ms: Option<u64>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl SwitchingEvent {
    /// A successful attach of `to`
    pub fn switched(
        from: Option<&ModuleId>,
        to: &ModuleId,
        priority: u8,
        snapshot: &TelemetrySnapshot,
        switch_duration_ms: u64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: SwitchKind::Attach,
            previous_scheduler: from.map(|m| m.name.clone()),
            new_scheduler: Some(to.name.clone()),
            priority: Some(priority),
            metrics: snapshot.to_named(),
            switch_duration_ms: Some(switch_duration_ms),
            success: true,
            error_message: None,
        }
    }

    /// An attach of `to` that the activator rejected
    pub fn failed(
        current: Option<&ModuleId>,
        to: &ModuleId,
        priority: u8,
        snapshot: &TelemetrySnapshot,
        error_message: String,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: SwitchKind::Attach,
            previous_scheduler: current.map(|m| m.name.clone()),
            new_scheduler: Some(to.name.clone()),
            priority: Some(priority),
            metrics: snapshot.to_named(),
            switch_duration_ms: None,
            success: false,
            error_message: Some(error_message),
        }
    }

    /// Detaching `module` on shutdown
    pub fn detached(module: &ModuleId, error_message: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: SwitchKind::Detach,
            previous_scheduler: Some(module.name.clone()),
            new_scheduler: None,
            priority: None,
            metrics: BTreeMap::new(),
            switch_duration_ms: None,
            success: error_message.is_none(),
            error_message,
        }
    }
}

/// Appends switching events to a JSON-lines journal
#[derive(Debug, Clone)]
pub struct SwitchLogger {
    log_file_path: PathBuf,
}

impl SwitchLogger {
    pub fn new(log_file_path: impl Into<PathBuf>) -> Self {
        Self {
            log_file_path: log_file_path.into(),
        }
    }

    /// Log a switching event to file
    pub fn log_switch_event(&self, event: &SwitchingEvent) -> Result<()> {
        let json_line = serde_json::to_string(event)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .map_err(|e| {
                error!("Failed to open log file {}: {}", self.log_file_path.display(), e);
                e
            })
            .with_context(|| format!("Failed to open {}", self.log_file_path.display()))?;

        writeln!(file, "{}", json_line)
            .with_context(|| format!("Failed to write {}", self.log_file_path.display()))?;
        debug!("Switching event logged to {}", self.log_file_path.display());

        Ok(())
    }

    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }
}

/// Initialize tracing: human-readable output on stdout and, when `log_file` is
/// given, JSON lines in a daily rolling file next to it.
///
/// `RUST_LOG` overrides `log_level`. Keep the returned guard alive for as long
/// as file output is wanted.
pub fn init_logging(log_level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false);

    let (file_layer, guard) = match log_file {
        Some(log_path) => {
            let log_dir = match log_path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("Failed to create {}", log_dir.display()))?;

            let file_name = log_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("scx-adapt.log"));
            let file_appender = tracing_appender::rolling::daily(log_dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(log_path) = log_file {
        info!("Logging system initialized, writing to {}", log_path.display());
    }
    Ok(guard)
}
