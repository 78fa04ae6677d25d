//! Failure taxonomy for the automation core.
//!
//! None of these abort a tick: the controller logs them, reports them back in
//! the tick outcome, and moves on to the next sub-step.

use crate::ports::ActuatorAction;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    /// The actuator port rejected or failed a single command.
    #[error("actuator command {action} failed: {reason}")]
    ActuatorFailure {
        action: ActuatorAction,
        reason: String,
    },

    /// The config store could not be reached or returned a backend error.
    #[error("config store unavailable: {0}")]
    StoreUnavailable(String),

    /// A persisted start date could not be parsed as RFC 3339.
    #[error("malformed {field} date: {value:?}")]
    MalformedStartDate { field: &'static str, value: String },
}

impl From<anyhow::Error> for ControlError {
    fn from(e: anyhow::Error) -> Self {
        Self::StoreUnavailable(format!("{e:#}"))
    }
}
