use serde::Serialize;

use crate::config::{Candidate, Configuration};
use crate::metrics::TelemetrySnapshot;
use crate::module_store::ModuleId;

/// Outcome of evaluating a profile against one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Decision {
    /// The most preferred candidate whose criteria all hold
    Selected { module: ModuleId, priority: u8 },
    /// No candidate qualifies
    NoneQualify,
}

impl Decision {
    pub fn module(&self) -> Option<&ModuleId> {
        match self {
            Decision::Selected { module, .. } => Some(module),
            Decision::NoneQualify => None,
        }
    }
}

/// Picks which scheduler module should be active for a snapshot.
///
/// Stateless: the same profile and snapshot always give the same decision.
/// Memory of what is currently attached lives in
/// [`Activation`](crate::activation::Activation).
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Walk candidates from the most preferred priority down and select the
    /// first whose every criterion is satisfied.
    pub fn decide(&self, config: &Configuration, snapshot: &TelemetrySnapshot) -> Decision {
        config
            .candidates()
            .iter()
            .find(|candidate| Self::qualifies(candidate, snapshot))
            .map_or(Decision::NoneQualify, |candidate| Decision::Selected {
                module: candidate.module().clone(),
                priority: candidate.priority(),
            })
    }

    /// A metric missing from the snapshot never satisfies a criterion.
    fn qualifies(candidate: &Candidate, snapshot: &TelemetrySnapshot) -> bool {
        candidate.criteria().iter().all(|criterion| {
            snapshot
                .get(criterion.metric())
                .is_some_and(|value| criterion.is_satisfied_by(value))
        })
    }
}
