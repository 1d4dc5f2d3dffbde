//! scx-adapt - adaptive sched_ext scheduler switching
//!
//! Samples kernel pressure and load telemetry on a fixed interval and keeps
//! the most preferred qualifying scheduler module of a YAML profile attached.

pub mod activation;
pub mod bpftool;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod metrics;
pub mod module_store;
pub mod policy;

// Re-export the main types for convenience
pub use activation::{Activation, ActivationError, ActivationState, Activator, Transition};
pub use bpftool::{BpftoolActivator, BpftoolConfig};
pub use config::{Candidate, Configuration, Criterion, ValidationError, ValidationRule};
pub use daemon::{spawn_signal_listener, ControlLoop, DaemonError, InstanceLock, TickOutcome};
pub use logging::{init_logging, SwitchLogger, SwitchingEvent};
pub use metrics::{
    CollectionError, MetricName, TelemetryCollector, TelemetrySnapshot, TelemetrySource,
};
pub use module_store::{DirModuleStore, ModuleError, ModuleId, ModuleStore, StaticModuleStore};
pub use policy::{Decision, PolicyEngine};
