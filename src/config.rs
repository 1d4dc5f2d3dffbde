//! Scheduler profile: which modules may run and under which load conditions.
//!
//! A profile is a YAML document:
//!
//! ```yaml
//! interval: 1000
//! schedulers:
//!   - path: fifo.bpf.c.o
//!     priority: 1
//!     criterias:
//!       - value_name: load_avg_1
//!         less_than: 5
//! ```
//!
//! Parsing validates the whole document before anything is sampled or
//! attached. The first violation is reported, in a fixed order: structure,
//! then each criterion, then each candidate, then priorities across candidates.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::metrics::MetricName;
use crate::module_store::{ModuleError, ModuleId, ModuleStore};

/// Highest priority value a candidate may use
pub const MAX_PRIORITY: u8 = 139;
/// Lowest (and most preferred) priority value
pub const MIN_PRIORITY: u8 = 1;

/// A threshold condition on one metric. Both bounds are strict.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    metric: MetricName,
    more_than: Option<f64>,
    less_than: Option<f64>,
}

impl Criterion {
    pub fn metric(&self) -> MetricName {
        self.metric
    }

    pub fn more_than(&self) -> Option<f64> {
        self.more_than
    }

    pub fn less_than(&self) -> Option<f64> {
        self.less_than
    }

    /// Whether `value` lies strictly inside the bounds
    pub fn is_satisfied_by(&self, value: f64) -> bool {
        self.more_than.map_or(true, |lower| value > lower)
            && self.less_than.map_or(true, |upper| value < upper)
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.more_than, self.less_than) {
            (Some(lower), Some(upper)) => write!(f, "{lower} < {} < {upper}", self.metric),
            (Some(lower), None) => write!(f, "{} > {lower}", self.metric),
            (None, Some(upper)) => write!(f, "{} < {upper}", self.metric),
            (None, None) => write!(f, "{}", self.metric),
        }
    }
}

/// A scheduler module together with its priority and activation guard
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    module: ModuleId,
    priority: u8,
    criteria: Vec<Criterion>,
}

impl Candidate {
    pub fn module(&self) -> &ModuleId {
        &self.module
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }
}

/// A validated profile. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    interval_ms: u64,
    candidates: Vec<Candidate>,
}

impl Configuration {
    /// Parse and validate a YAML profile, resolving module references through
    /// `store`.
    pub fn parse(raw: &[u8], store: &dyn ModuleStore) -> Result<Self, ValidationError> {
        let document: RawProfile = serde_yaml::from_slice(raw)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        document.validate(store)
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Candidates in ascending priority value (most preferred first)
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }
}

/// Tag identifying which rule a profile broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationRule {
    Malformed,
    MissingField,
    IntervalOutOfRange,
    PriorityOutOfRange,
    EmptyCriteria,
    UnknownMetric,
    MissingBound,
    InvertedBounds,
    DuplicateCriterion,
    UnresolvableModule,
    DuplicatePriority,
}

/// A profile that cannot be used
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed profile: {0}")]
    Malformed(String),

    #[error("missing required field `{field}` in {location}")]
    MissingField {
        field: &'static str,
        location: String,
    },

    #[error("interval must be at least 1 ms, got {0}")]
    IntervalOutOfRange(i64),

    #[error("priority {priority} of scheduler '{module}' is outside 1..=139")]
    PriorityOutOfRange { module: String, priority: i64 },

    #[error("scheduler '{module}' has no criterias")]
    EmptyCriteria { module: String },

    #[error("invalid value_name '{name}' in scheduler '{module}'")]
    UnknownMetric { module: String, name: String },

    #[error("there is no 'more_than' and/or 'less_than' parameter for value '{metric}' in scheduler '{module}'")]
    MissingBound { module: String, metric: MetricName },

    #[error("parameter 'more_than' ({more_than}) must be below 'less_than' ({less_than}) in value '{metric}' of scheduler '{module}'")]
    InvertedBounds {
        module: String,
        metric: MetricName,
        more_than: f64,
        less_than: f64,
    },

    #[error("criteria '{metric}' defined multiple times for scheduler '{module}'")]
    DuplicateCriterion { module: String, metric: MetricName },

    #[error("scheduler '{module}' cannot be used: {source}")]
    UnresolvableModule {
        module: String,
        #[source]
        source: ModuleError,
    },

    #[error("priority {priority} is assigned to both '{first}' and '{second}'")]
    DuplicatePriority {
        priority: u8,
        first: String,
        second: String,
    },
}

impl ValidationError {
    pub fn rule(&self) -> ValidationRule {
        match self {
            ValidationError::Malformed(_) => ValidationRule::Malformed,
            ValidationError::MissingField { .. } => ValidationRule::MissingField,
            ValidationError::IntervalOutOfRange(_) => ValidationRule::IntervalOutOfRange,
            ValidationError::PriorityOutOfRange { .. } => ValidationRule::PriorityOutOfRange,
            ValidationError::EmptyCriteria { .. } => ValidationRule::EmptyCriteria,
            ValidationError::UnknownMetric { .. } => ValidationRule::UnknownMetric,
            ValidationError::MissingBound { .. } => ValidationRule::MissingBound,
            ValidationError::InvertedBounds { .. } => ValidationRule::InvertedBounds,
            ValidationError::DuplicateCriterion { .. } => ValidationRule::DuplicateCriterion,
            ValidationError::UnresolvableModule { .. } => ValidationRule::UnresolvableModule,
            ValidationError::DuplicatePriority { .. } => ValidationRule::DuplicatePriority,
        }
    }
}

// Raw document. Every field is optional so that absence is reported as a
// rule violation rather than a YAML error; unknown keys are still rejected.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProfile {
    interval: Option<i64>,
    schedulers: Option<Vec<RawScheduler>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScheduler {
    path: Option<String>,
    priority: Option<i64>,
    criterias: Option<Vec<RawCriterion>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCriterion {
    value_name: Option<String>,
    more_than: Option<f64>,
    less_than: Option<f64>,
}

/// A scheduler entry that passed the structural checks
struct Checked<'a> {
    path: &'a str,
    priority: u8,
    criteria: &'a [RawCriterion],
}

impl RawProfile {
    fn validate(self, store: &dyn ModuleStore) -> Result<Configuration, ValidationError> {
        // Structure
        let interval = self.interval.ok_or_else(|| ValidationError::MissingField {
            field: "interval",
            location: "profile".to_string(),
        })?;
        let interval_ms = u64::try_from(interval)
            .ok()
            .filter(|ms| *ms >= 1)
            .ok_or(ValidationError::IntervalOutOfRange(interval))?;

        let schedulers = self
            .schedulers
            .as_deref()
            .ok_or_else(|| ValidationError::MissingField {
                field: "schedulers",
                location: "profile".to_string(),
            })?;

        let checked = schedulers
            .iter()
            .enumerate()
            .map(|(index, scheduler)| scheduler.check_structure(index))
            .collect::<Result<Vec<_>, _>>()?;

        // Criteria
        let metrics = checked
            .iter()
            .map(|scheduler| {
                scheduler
                    .criteria
                    .iter()
                    .map(|criterion| criterion.check(scheduler.path))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Candidates
        let mut candidates = Vec::with_capacity(checked.len());
        for (scheduler, criteria) in checked.iter().zip(metrics) {
            let mut seen = HashSet::new();
            if let Some(duplicate) = criteria.iter().find(|c| !seen.insert(c.metric)) {
                return Err(ValidationError::DuplicateCriterion {
                    module: scheduler.path.to_string(),
                    metric: duplicate.metric,
                });
            }

            let module =
                store
                    .resolve(scheduler.path)
                    .map_err(|source| ValidationError::UnresolvableModule {
                        module: scheduler.path.to_string(),
                        source,
                    })?;

            candidates.push(Candidate {
                module,
                priority: scheduler.priority,
                criteria,
            });
        }

        // Priorities across candidates
        let mut owners: HashMap<u8, &str> = HashMap::new();
        for scheduler in &checked {
            if let Some(first) = owners.insert(scheduler.priority, scheduler.path) {
                return Err(ValidationError::DuplicatePriority {
                    priority: scheduler.priority,
                    first: first.to_string(),
                    second: scheduler.path.to_string(),
                });
            }
        }

        candidates.sort_by_key(|candidate| candidate.priority);
        debug!(
            interval_ms,
            candidates = candidates.len(),
            "profile validated"
        );

        Ok(Configuration {
            interval_ms,
            candidates,
        })
    }
}

impl RawScheduler {
    fn check_structure(&self, index: usize) -> Result<Checked<'_>, ValidationError> {
        let location = || format!("scheduler #{}", index + 1);

        let path = self
            .path
            .as_deref()
            .ok_or_else(|| ValidationError::MissingField {
                field: "path",
                location: location(),
            })?;
        let priority = self.priority.ok_or_else(|| ValidationError::MissingField {
            field: "priority",
            location: format!("scheduler '{path}'"),
        })?;
        let criteria = self
            .criterias
            .as_deref()
            .ok_or_else(|| ValidationError::MissingField {
                field: "criterias",
                location: format!("scheduler '{path}'"),
            })?;

        let priority = u8::try_from(priority)
            .ok()
            .filter(|p| (MIN_PRIORITY..=MAX_PRIORITY).contains(p))
            .ok_or_else(|| ValidationError::PriorityOutOfRange {
                module: path.to_string(),
                priority,
            })?;

        // A candidate with no criteria would always win.
        if criteria.is_empty() {
            return Err(ValidationError::EmptyCriteria {
                module: path.to_string(),
            });
        }

        Ok(Checked {
            path,
            priority,
            criteria,
        })
    }
}

impl RawCriterion {
    fn check(&self, module: &str) -> Result<Criterion, ValidationError> {
        let name = self
            .value_name
            .as_deref()
            .ok_or_else(|| ValidationError::MissingField {
                field: "value_name",
                location: format!("scheduler '{module}'"),
            })?;

        let metric: MetricName = name.parse().map_err(|_| ValidationError::UnknownMetric {
            module: module.to_string(),
            name: name.to_string(),
        })?;

        if self.more_than.is_none() && self.less_than.is_none() {
            return Err(ValidationError::MissingBound {
                module: module.to_string(),
                metric,
            });
        }

        // Present bounds must be finite and ordered; an absent bound is open.
        let more_than = self.more_than.unwrap_or(f64::NEG_INFINITY);
        let less_than = self.less_than.unwrap_or(f64::INFINITY);
        let finite = |bound: Option<f64>| bound.map_or(true, f64::is_finite);
        if !(more_than < less_than) || !finite(self.more_than) || !finite(self.less_than) {
            return Err(ValidationError::InvertedBounds {
                module: module.to_string(),
                metric,
                more_than,
                less_than,
            });
        }

        Ok(Criterion {
            metric,
            more_than: self.more_than,
            less_than: self.less_than,
        })
    }
}
