//! Tracks which scheduler module is attached and performs switches.
//!
//! `NoneQualify` never detaches: the last selected module stays attached until
//! a different one qualifies. Detaching with nothing to replace it would leave
//! sched_ext without a policy.

use anyhow::Error as AnyError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::module_store::ModuleId;
use crate::policy::Decision;

/// The external attach/detach primitive.
///
/// At most one module is attached at a time. [`Activation`] always detaches
/// the current module before attaching another one.
pub trait Activator {
    fn activate(&mut self, module: &ModuleId) -> anyhow::Result<()>;
    fn deactivate(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum ActivationState {
    #[default]
    Inactive,
    Active(ModuleId),
}

impl ActivationState {
    pub fn module(&self) -> Option<&ModuleId> {
        match self {
            ActivationState::Inactive => None,
            ActivationState::Active(module) => Some(module),
        }
    }
}

/// What applying a decision did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Switched {
        from: Option<ModuleId>,
        to: ModuleId,
    },
}

#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("failed to attach scheduler '{module}': {cause:#}")]
    Attach { module: ModuleId, cause: AnyError },
    #[error("failed to detach scheduler '{module}': {cause:#}")]
    Detach { module: ModuleId, cause: AnyError },
}

impl ActivationError {
    pub fn module(&self) -> &ModuleId {
        match self {
            ActivationError::Attach { module, .. } | ActivationError::Detach { module, .. } => {
                module
            }
        }
    }
}

/// Single owner of the activation state and the activator
#[derive(Debug)]
pub struct Activation<A> {
    state: ActivationState,
    activator: A,
}

impl<A: Activator> Activation<A> {
    /// Starts with nothing attached
    pub fn new(activator: A) -> Self {
        Self {
            state: ActivationState::Inactive,
            activator,
        }
    }

    pub fn state(&self) -> &ActivationState {
        &self.state
    }

    pub fn activator(&self) -> &A {
        &self.activator
    }

    /// Apply one decision.
    ///
    /// Switching is a detach of the current module followed by an attach of
    /// the new one. The state follows each step as it succeeds, so a failed
    /// attach after a successful detach leaves the machine `Inactive`.
    pub fn apply(&mut self, decision: &Decision) -> Result<Transition, ActivationError> {
        let target = match decision {
            Decision::NoneQualify => {
                if let ActivationState::Active(current) = &self.state {
                    debug!(module = %current, "no scheduler qualifies, keeping current");
                }
                return Ok(Transition::Unchanged);
            }
            Decision::Selected { module, .. } => module,
        };

        if self.state.module() == Some(target) {
            return Ok(Transition::Unchanged);
        }

        let from = self.state.module().cloned();
        if let Some(current) = &from {
            self.activator
                .deactivate()
                .map_err(|cause| ActivationError::Detach {
                    module: current.clone(),
                    cause,
                })?;
            self.state = ActivationState::Inactive;
            debug!(module = %current, "scheduler detached for switch");
        }

        self.activator
            .activate(target)
            .map_err(|cause| ActivationError::Attach {
                module: target.clone(),
                cause,
            })?;
        self.state = ActivationState::Active(target.clone());

        info!(
            from = from.as_ref().map_or("none", |m| m.name.as_str()),
            to = %target,
            "scheduler switched"
        );

        Ok(Transition::Switched {
            from,
            to: target.clone(),
        })
    }

    /// Detach the active module, if any. On failure the state is left as is.
    pub fn shutdown(&mut self) -> Result<Option<ModuleId>, ActivationError> {
        let module = match std::mem::take(&mut self.state) {
            ActivationState::Inactive => return Ok(None),
            ActivationState::Active(module) => module,
        };

        if let Err(cause) = self.activator.deactivate() {
            warn!(module = %module, error = %cause, "failed to detach scheduler on shutdown");
            self.state = ActivationState::Active(module.clone());
            return Err(ActivationError::Detach { module, cause });
        }

        info!(module = %module, "scheduler detached");
        Ok(Some(module))
    }
}
