use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use fs2::FileExt;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::activation::{Activation, ActivationError, ActivationState, Activator, Transition};
use crate::config::Configuration;
use crate::logging::{SwitchLogger, SwitchingEvent};
use crate::metrics::{CollectionError, TelemetrySource};
use crate::policy::{Decision, PolicyEngine};

pub const DEFAULT_LOCK_FILE: &str = "/tmp/scx-adapt.lock";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("another profile is already running (lock held on {})", .0.display())]
    AlreadyRunning(PathBuf),
    #[error("failed to lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("telemetry collection failed: {0}")]
    Collection(#[from] CollectionError),
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

/// Result of one sampling tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub decision: Decision,
    pub transition: Transition,
}

/// Periodically samples telemetry, decides, and switches schedulers
pub struct ControlLoop<S, A> {
    config: Configuration,
    source: S,
    engine: PolicyEngine,
    activation: Activation<A>,
    journal: Option<SwitchLogger>,
    ticks: u64,
}

impl<S: TelemetrySource, A: Activator> ControlLoop<S, A> {
    pub fn new(config: Configuration, source: S, activator: A) -> Self {
        Self {
            config,
            source,
            engine: PolicyEngine::new(),
            activation: Activation::new(activator),
            journal: None,
            ticks: 0,
        }
    }

    /// Record every attempted switch in `journal`
    pub fn with_journal(mut self, journal: SwitchLogger) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn state(&self) -> &ActivationState {
        self.activation.state()
    }

    pub fn activator(&self) -> &A {
        self.activation.activator()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Sample, decide and apply once
    pub fn tick(&mut self) -> Result<TickOutcome, DaemonError> {
        let snapshot = self.source.sample()?;
        self.ticks += 1;

        let decision = self.engine.decide(&self.config, &snapshot);
        debug!(tick = self.ticks, ?decision, "evaluated profile");

        let previous = self.activation.state().module().cloned();
        let started = Instant::now();
        match self.activation.apply(&decision) {
            Ok(transition) => {
                if let (Transition::Switched { from, to }, Decision::Selected { priority, .. }) =
                    (&transition, &decision)
                {
                    self.record(&SwitchingEvent::switched(
                        from.as_ref(),
                        to,
                        *priority,
                        &snapshot,
                        started.elapsed().as_millis() as u64,
                    ));
                }
                Ok(TickOutcome {
                    decision,
                    transition,
                })
            }
            Err(err) => {
                if let Decision::Selected { module, priority } = &decision {
                    self.record(&SwitchingEvent::failed(
                        previous.as_ref(),
                        module,
                        *priority,
                        &snapshot,
                        err.to_string(),
                    ));
                }
                Err(err.into())
            }
        }
    }

    /// Tick at the profile interval until `stop` turns true or collection
    /// fails. The stop flag is only looked at between ticks. Whatever the exit
    /// path, the attached scheduler is detached once on the way out.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<(), DaemonError> {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.interval_ms(),
            candidates = self.config.candidates().len(),
            "control loop started"
        );

        let result = loop {
            if *stop.borrow() {
                break Ok(());
            }

            let stop_requested = tokio::select! {
                biased;
                changed = stop.changed() => Some(changed.is_err() || *stop.borrow()),
                _ = ticker.tick() => None,
            };
            match stop_requested {
                Some(true) => break Ok(()),
                Some(false) => continue,
                None => {}
            }

            match self.tick() {
                Ok(_) => {}
                Err(DaemonError::Activation(err)) => {
                    error!(module = %err.module(), error = %err, "scheduler switch failed");
                }
                Err(err) => {
                    error!(error = %err, "stopping control loop");
                    break Err(err);
                }
            }
        };

        self.shutdown();
        info!(ticks = self.ticks, "control loop stopped");
        result
    }

    /// Best-effort detach. Failures are logged, not retried.
    fn shutdown(&mut self) {
        match self.activation.shutdown() {
            Ok(Some(module)) => self.record(&SwitchingEvent::detached(&module, None)),
            Ok(None) => {}
            Err(err) => {
                error!(error = %err, "failed to detach scheduler on shutdown");
                self.record(&SwitchingEvent::detached(err.module(), Some(err.to_string())));
            }
        }
    }

    fn record(&self, event: &SwitchingEvent) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.log_switch_event(event) {
                warn!(error = %e, "failed to write switching event");
            }
        }
    }
}

/// Exclusive lock preventing two profiles from running at once
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let path = path.into();
        let lock_error = |source| DaemonError::Lock {
            path: path.clone(),
            source,
        };

        // A previous holder unlinks the file before unlocking, so a lock taken
        // on an inode that is no longer at `path` is stale and must be retaken.
        let mut file = loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(lock_error)?;

            if let Err(e) = file.try_lock_exclusive() {
                return Err(if e.kind() == ErrorKind::WouldBlock {
                    DaemonError::AlreadyRunning(path.clone())
                } else {
                    lock_error(e)
                });
            }

            if is_current(&file, &path).map_err(lock_error)? {
                break file;
            }
            debug!(path = %path.display(), "lock file replaced while locking, retrying");
        };

        file.set_len(0).map_err(lock_error)?;
        writeln!(file, "{}", std::process::id()).map_err(lock_error)?;

        debug!(path = %path.display(), "instance lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether `file` is still the inode linked at `path`
fn is_current(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(linked) => Ok(held.dev() == linked.dev() && held.ino() == linked.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
        let _ = self.file.unlock();
    }
}

/// Turn the first SIGINT or SIGTERM into `true` on the stop channel
pub fn spawn_signal_listener(tx: watch::Sender<bool>) -> Result<JoinHandle<()>, DaemonError> {
    let mut sigterm = signal(SignalKind::terminate()).map_err(DaemonError::Signal)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(DaemonError::Signal)?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        let _ = tx.send(true);
    }))
}
