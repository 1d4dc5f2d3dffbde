use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scx_adapt::daemon::DEFAULT_LOCK_FILE;
use scx_adapt::module_store::DEFAULT_MODULE_DIR;
use scx_adapt::{
    init_logging, spawn_signal_listener, BpftoolActivator, BpftoolConfig, Configuration,
    ControlLoop, DirModuleStore, InstanceLock, ModuleStore, SwitchLogger, TelemetryCollector,
};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "scx-adapt")]
#[command(about = "Switch sched_ext schedulers according to a profile and live system load", long_about = None)]
struct Cli {
    /// Directory holding installed scheduler modules
    #[arg(long, global = true, default_value = DEFAULT_MODULE_DIR)]
    module_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write JSON logs to this file (rotated daily)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a profile until interrupted
    StartProfile {
        /// YAML profile
        profile: PathBuf,

        /// Lock file preventing concurrent profiles
        #[arg(long, default_value = DEFAULT_LOCK_FILE)]
        lock_file: PathBuf,

        /// Append a JSON line for every scheduler switch to this file
        #[arg(long)]
        events_log: Option<PathBuf>,

        /// bpftool binary
        #[arg(long, default_value = "bpftool")]
        bpftool: PathBuf,
    },

    /// Validate a profile, read from stdin when no path is given
    CheckProfile { profile: Option<PathBuf> },

    /// List installed scheduler modules
    ListSchedulers,

    /// Show the attached sched_ext scheduler
    Current,
}

fn read_profile(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read profile {}", path.display())),
        None => {
            let mut raw = Vec::new();
            std::io::stdin()
                .read_to_end(&mut raw)
                .context("Failed to read profile from stdin")?;
            Ok(raw)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli.log_level, cli.log_file.as_deref())?;
    let store = DirModuleStore::new(&cli.module_dir);

    match cli.command {
        Commands::StartProfile {
            profile,
            lock_file,
            events_log,
            bpftool,
        } => {
            let raw = read_profile(Some(&profile))?;
            let config = Configuration::parse(&raw, &store)
                .with_context(|| format!("Invalid profile {}", profile.display()))?;

            let activator = BpftoolActivator::new(BpftoolConfig {
                bpftool,
                ..Default::default()
            });
            activator.check_dependencies()?;

            let _lock = InstanceLock::acquire(lock_file)?;
            let (tx, rx) = watch::channel(false);
            spawn_signal_listener(tx)?;

            info!(
                profile = %profile.display(),
                interval_ms = config.interval_ms(),
                "Starting profile"
            );

            let mut control = ControlLoop::new(config, TelemetryCollector::new(), activator);
            if let Some(events_log) = events_log {
                control = control.with_journal(SwitchLogger::new(events_log));
            }
            control.run(rx).await?;
        }

        Commands::CheckProfile { profile } => {
            let raw = read_profile(profile.as_deref())?;
            match Configuration::parse(&raw, &store) {
                Ok(_) => println!("Valid config."),
                Err(e) => {
                    eprintln!("Invalid config: {e}");
                    process::exit(1);
                }
            }
        }

        Commands::ListSchedulers => {
            let modules = store
                .list()
                .with_context(|| format!("Failed to list {}", store.root().display()))?;
            if modules.is_empty() {
                println!("No schedulers installed in {}", store.root().display());
            }
            for module in modules {
                println!("{}", module.name);
            }
        }

        Commands::Current => match BpftoolActivator::default().current()? {
            Some(ops) => println!("{ops}"),
            None => println!("No custom schedulers are attached"),
        },
    }

    Ok(())
}
