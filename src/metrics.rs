use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use procfs::{DiskStat, FromRead, LoadAverage};
use thiserror::Error;
use tracing::trace;

/// Default location of the kernel's proc filesystem
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Resource tracked by pressure stall information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Cpu,
    Io,
    Memory,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Cpu, Resource::Io, Resource::Memory];

    /// Prefix used in metric names (`cpu`, `io`, `mem`)
    fn tag(self) -> &'static str {
        match self {
            Resource::Cpu => "cpu",
            Resource::Io => "io",
            Resource::Memory => "mem",
        }
    }

    /// File name under `<proc>/pressure`
    fn file_name(self) -> &'static str {
        match self {
            Resource::Cpu => "cpu",
            Resource::Io => "io",
            Resource::Memory => "memory",
        }
    }
}

/// Severity of a pressure stall: at least one task, or all non-idle tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StallClass {
    Some,
    Full,
}

impl StallClass {
    pub const ALL: [StallClass; 2] = [StallClass::Some, StallClass::Full];

    fn tag(self) -> &'static str {
        match self {
            StallClass::Some => "some",
            StallClass::Full => "full",
        }
    }
}

/// Averaging window of a pressure ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PressureWindow {
    Avg10,
    Avg60,
    Avg300,
}

impl PressureWindow {
    pub const ALL: [PressureWindow; 3] = [
        PressureWindow::Avg10,
        PressureWindow::Avg60,
        PressureWindow::Avg300,
    ];

    fn seconds(self) -> &'static str {
        match self {
            PressureWindow::Avg10 => "10",
            PressureWindow::Avg60 => "60",
            PressureWindow::Avg300 => "300",
        }
    }

    fn field_key(self) -> &'static str {
        match self {
            PressureWindow::Avg10 => "avg10",
            PressureWindow::Avg60 => "avg60",
            PressureWindow::Avg300 => "avg300",
        }
    }
}

/// Averaging window of the load average, in minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LoadWindow {
    One,
    Five,
    Fifteen,
}

impl LoadWindow {
    pub const ALL: [LoadWindow; 3] = [LoadWindow::One, LoadWindow::Five, LoadWindow::Fifteen];

    fn minutes(self) -> &'static str {
        match self {
            LoadWindow::One => "1",
            LoadWindow::Five => "5",
            LoadWindow::Fifteen => "15",
        }
    }
}

/// A metric the profile may put a threshold on.
///
/// The set is closed: every name a profile can mention parses into exactly one
/// of these cases, anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricName {
    /// `(cpu|io|mem)_psi_(some|full)_(10|60|300)`
    Pressure {
        resource: Resource,
        stall: StallClass,
        window: PressureWindow,
    },
    /// `load_avg_(1|5|15)`
    LoadAverage(LoadWindow),
    /// `procs_running`
    ProcsRunning,
    /// `procs_blocked`
    ProcsBlocked,
    /// `procs_disk_io`, I/Os in flight summed over top-level block devices
    DiskIoInProgress,
}

impl MetricName {
    /// Every metric in the vocabulary
    pub fn all() -> Vec<MetricName> {
        let mut names = Vec::with_capacity(24);
        for resource in Resource::ALL {
            for stall in StallClass::ALL {
                for window in PressureWindow::ALL {
                    names.push(MetricName::Pressure {
                        resource,
                        stall,
                        window,
                    });
                }
            }
        }
        names.extend(LoadWindow::ALL.map(MetricName::LoadAverage));
        names.push(MetricName::ProcsRunning);
        names.push(MetricName::ProcsBlocked);
        names.push(MetricName::DiskIoInProgress);
        names
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricName::Pressure {
                resource,
                stall,
                window,
            } => write!(
                f,
                "{}_psi_{}_{}",
                resource.tag(),
                stall.tag(),
                window.seconds()
            ),
            MetricName::LoadAverage(window) => write!(f, "load_avg_{}", window.minutes()),
            MetricName::ProcsRunning => f.write_str("procs_running"),
            MetricName::ProcsBlocked => f.write_str("procs_blocked"),
            MetricName::DiskIoInProgress => f.write_str("procs_disk_io"),
        }
    }
}

/// A metric name outside the vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown metric name `{0}`")]
pub struct UnknownMetric(pub String);

impl FromStr for MetricName {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownMetric(s.to_string());

        match s {
            "procs_running" => return Ok(MetricName::ProcsRunning),
            "procs_blocked" => return Ok(MetricName::ProcsBlocked),
            "procs_disk_io" => return Ok(MetricName::DiskIoInProgress),
            _ => {}
        }

        if let Some(minutes) = s.strip_prefix("load_avg_") {
            return LoadWindow::ALL
                .into_iter()
                .find(|w| w.minutes() == minutes)
                .map(MetricName::LoadAverage)
                .ok_or_else(unknown);
        }

        let mut parts = s.split('_');
        match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(resource), Some("psi"), Some(stall), Some(window), None) => {
                let resource = Resource::ALL.into_iter().find(|r| r.tag() == resource);
                let stall = StallClass::ALL.into_iter().find(|c| c.tag() == stall);
                let window = PressureWindow::ALL
                    .into_iter()
                    .find(|w| w.seconds() == window);
                match (resource, stall, window) {
                    (Some(resource), Some(stall), Some(window)) => Ok(MetricName::Pressure {
                        resource,
                        stall,
                        window,
                    }),
                    _ => Err(unknown()),
                }
            }
            _ => Err(unknown()),
        }
    }
}

/// Metric values captured at one sampling instant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    values: BTreeMap<MetricName, f64>,
}

impl TelemetrySnapshot {
    pub fn get(&self, metric: MetricName) -> Option<f64> {
        self.values.get(&metric).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricName, f64)> + '_ {
        self.values.iter().map(|(name, value)| (*name, *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values keyed by their profile names, for the event journal
    pub fn to_named(&self) -> BTreeMap<String, f64> {
        self.iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

impl FromIterator<(MetricName, f64)> for TelemetrySnapshot {
    fn from_iter<I: IntoIterator<Item = (MetricName, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Failure to read or parse one of the telemetry sources
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: missing {what}", .path.display())]
    Missing { path: PathBuf, what: String },
    #[error("{}: cannot parse `{token}` as a number", .path.display())]
    Invalid { path: PathBuf, token: String },
    #[error("{}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },
}

impl CollectionError {
    /// The source file that failed
    pub fn path(&self) -> &Path {
        match self {
            CollectionError::Read { path, .. }
            | CollectionError::Missing { path, .. }
            | CollectionError::Invalid { path, .. }
            | CollectionError::Malformed { path, .. } => path,
        }
    }
}

/// Anything that can produce telemetry snapshots for the control loop
pub trait TelemetrySource {
    fn sample(&mut self) -> Result<TelemetrySnapshot, CollectionError>;
}

/// Reads every metric of the vocabulary from the proc filesystem
#[derive(Debug, Clone)]
pub struct TelemetryCollector {
    root: PathBuf,
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self::with_root(DEFAULT_PROC_ROOT)
    }

    /// Collector reading from an alternative proc root
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Collect a complete snapshot. Any failing source aborts the whole sample.
    pub fn collect(&self) -> Result<TelemetrySnapshot, CollectionError> {
        let mut values = BTreeMap::new();

        for resource in Resource::ALL {
            let path = self.root.join("pressure").join(resource.file_name());
            let content = read_source(&path)?;
            for stall in StallClass::ALL {
                for window in PressureWindow::ALL {
                    let value = parse_pressure(&path, &content, stall, window)?;
                    values.insert(
                        MetricName::Pressure {
                            resource,
                            stall,
                            window,
                        },
                        value,
                    );
                }
            }
        }

        let path = self.root.join("loadavg");
        let content = read_source(&path)?;
        let load = parse_load_average(&path, &content)?;
        for window in LoadWindow::ALL {
            values.insert(MetricName::LoadAverage(window), load.get(window));
        }

        let path = self.root.join("stat");
        let content = read_source(&path)?;
        values.insert(
            MetricName::ProcsRunning,
            parse_named_counter(&path, &content, "procs_running")? as f64,
        );
        values.insert(
            MetricName::ProcsBlocked,
            parse_named_counter(&path, &content, "procs_blocked")? as f64,
        );

        let path = self.root.join("diskstats");
        let content = read_source(&path)?;
        values.insert(
            MetricName::DiskIoInProgress,
            parse_disk_io_in_progress(&path, &content)? as f64,
        );

        trace!(metrics = values.len(), "telemetry sampled");
        Ok(TelemetrySnapshot { values })
    }
}

impl TelemetrySource for TelemetryCollector {
    fn sample(&mut self) -> Result<TelemetrySnapshot, CollectionError> {
        self.collect()
    }
}

fn read_source(path: &Path) -> Result<String, CollectionError> {
    fs::read_to_string(path).map_err(|source| CollectionError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_number<T: FromStr>(path: &Path, token: &str) -> Result<T, CollectionError> {
    token.parse().map_err(|_| CollectionError::Invalid {
        path: path.to_path_buf(),
        token: token.to_string(),
    })
}

fn malformed(path: &Path, error: procfs::ProcError) -> CollectionError {
    CollectionError::Malformed {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

fn missing(path: &Path, what: impl Into<String>) -> CollectionError {
    CollectionError::Missing {
        path: path.to_path_buf(),
        what: what.into(),
    }
}

/// Pressure files look like:
///
/// ```text
/// some avg10=0.12 avg60=0.08 avg300=0.02 total=123456
/// full avg10=0.00 avg60=0.00 avg300=0.00 total=4567
/// ```
fn parse_pressure(
    path: &Path,
    content: &str,
    stall: StallClass,
    window: PressureWindow,
) -> Result<f64, CollectionError> {
    let line = content
        .lines()
        .find(|line| line.split_whitespace().next() == Some(stall.tag()))
        .ok_or_else(|| missing(path, format!("`{}` line", stall.tag())))?;

    let value = line
        .split_whitespace()
        .skip(1)
        .filter_map(|field| field.split_once('='))
        .find(|(key, _)| *key == window.field_key())
        .map(|(_, value)| value)
        .ok_or_else(|| {
            missing(
                path,
                format!("`{}` in `{}` line", window.field_key(), stall.tag()),
            )
        })?;

    parse_number(path, value)
}

/// The three load averages of one `/proc/loadavg` read
#[derive(Debug, Clone, Copy, PartialEq)]
struct LoadSample {
    one: f64,
    five: f64,
    fifteen: f64,
}

impl LoadSample {
    fn get(&self, window: LoadWindow) -> f64 {
        match window {
            LoadWindow::One => self.one,
            LoadWindow::Five => self.five,
            LoadWindow::Fifteen => self.fifteen,
        }
    }
}

/// The kernel prints load averages with two decimals; procfs hands them back
/// as `f32`, which is rounded back to those two decimals.
fn hundredths(value: f32) -> f64 {
    (f64::from(value) * 100.0).round() / 100.0
}

fn parse_load_average(path: &Path, content: &str) -> Result<LoadSample, CollectionError> {
    let load = LoadAverage::from_read(content.as_bytes()).map_err(|e| malformed(path, e))?;
    Ok(LoadSample {
        one: hundredths(load.one),
        five: hundredths(load.five),
        fifteen: hundredths(load.fifteen),
    })
}

/// Finds the line whose first token is exactly `name` and parses its value
fn parse_named_counter(path: &Path, content: &str, name: &str) -> Result<u64, CollectionError> {
    let mut fields = content
        .lines()
        .map(str::split_whitespace)
        .find_map(|mut fields| {
            let key = fields.next()?;
            (key.trim_end_matches(':') == name).then_some(fields)
        })
        .ok_or_else(|| missing(path, format!("`{name}` line")))?;

    let token = fields
        .next()
        .ok_or_else(|| missing(path, format!("value of `{name}`")))?;
    parse_number(path, token)
}

/// Sums "I/Os currently in progress" across top-level block devices
/// (minor number 0); partitions would count the same I/O twice.
fn parse_disk_io_in_progress(path: &Path, content: &str) -> Result<u64, CollectionError> {
    let mut total = 0u64;

    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        let disk = DiskStat::from_line(line).map_err(|e| malformed(path, e))?;
        if disk.minor == 0 {
            total += disk.in_progress as u64;
        }
    }

    Ok(total)
}
