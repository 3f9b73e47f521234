//! Error taxonomy shared by every stage of the control loop.

use thiserror::Error;

use crate::plan::StepStatus;

/// Failures reported by a browser-driver primitive.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("browser error: {0}")]
    Browser(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("page unreachable: {0}")]
    Unreachable(String),
}

impl DriverError {
    pub fn browser(message: impl Into<String>) -> Self {
        Self::Browser(message.into())
    }
}

/// Failures reported by the language/vision model backend.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("oracle transport error: {0}")]
    Transport(String),

    #[error("oracle API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("oracle returned an empty response")]
    EmptyResponse,

    #[error("oracle call timed out after {0}ms")]
    Timeout(u64),

    #[error("oracle is not configured: {0}")]
    NotConfigured(String),
}

/// The live page could not be read into a snapshot.
#[derive(Debug, Clone, Error)]
pub enum PerceptionFailure {
    #[error("page unreachable: {0}")]
    Unreachable(String),

    #[error("screenshot capture failed: {0}")]
    Screenshot(String),

    #[error("page kept changing during capture ({before} -> {after})")]
    Inconsistent { before: String, after: String },
}

/// No safe action could be derived from an utterance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterpretationError {
    #[error("unrecognized command: {0}")]
    Unrecognized(String),

    #[error("could not resolve target: {0}")]
    Unresolvable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("vision oracle failure: {0}")]
    OracleFailure(String),
}

impl From<OracleError> for ResolverError {
    fn from(err: OracleError) -> Self {
        Self::OracleFailure(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanningError {
    /// The oracle judged the task unachievable from the current page.
    #[error("task is infeasible: {0}")]
    Infeasible(String),

    #[error("planning oracle failure: {0}")]
    OracleFailure(String),

    #[error("malformed plan: {0}")]
    Malformed(String),
}

impl PlanningError {
    /// Infeasibility is terminal; everything else may succeed on another call.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Infeasible(_))
    }
}

impl From<OracleError> for PlanningError {
    fn from(err: OracleError) -> Self {
        Self::OracleFailure(err.to_string())
    }
}

/// One attempt at an action did not produce the expected page state.
#[derive(Debug, Clone, Error)]
pub enum ActionFailure {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Perception(#[from] PerceptionFailure),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Interpretation(#[from] InterpretationError),

    #[error("post-condition failed: {0}")]
    PostCondition(String),

    #[error("action cannot run as a step: {0}")]
    NotExecutable(String),

    #[error("cancelled by caller")]
    Cancelled,
}

impl ActionFailure {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Interpretation(InterpretationError::Unrecognized(_))
            | Self::NotExecutable(_)
            | Self::Cancelled => false,
            _ => true,
        }
    }
}

/// A plan or step was asked to move backwards through its state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid step transition from {from:?} to {to}")]
pub struct TransitionError {
    pub from: StepStatus,
    pub to: &'static str,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors surfaced to callers of the controller.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Interpretation(#[from] InterpretationError),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Perception(#[from] PerceptionFailure),

    #[error(transparent)]
    State(#[from] TransitionError),

    #[error("no plan is ready to execute")]
    NoActivePlan,

    #[error("cancelled by caller")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_and_cancellation_are_not_retried() {
        assert!(!ActionFailure::from(InterpretationError::Unrecognized("x".into())).is_transient());
        assert!(!ActionFailure::Cancelled.is_transient());
        assert!(ActionFailure::from(InterpretationError::Unresolvable("x".into())).is_transient());
        assert!(ActionFailure::PostCondition("unchanged".into()).is_transient());
        assert!(ActionFailure::from(ResolverError::OracleFailure("timeout".into())).is_transient());
    }

    #[test]
    fn infeasible_planning_is_terminal() {
        assert!(!PlanningError::Infeasible("no form".into()).is_transient());
        assert!(PlanningError::OracleFailure("500".into()).is_transient());
    }

    #[test]
    fn driver_timeout_display() {
        let err = DriverError::Timeout {
            operation: "click".into(),
            timeout_ms: 500,
        };
        assert_eq!(err.to_string(), "click timed out after 500ms");
    }
}
