//! Workflow error types.

use crate::state::{WorkflowInstanceId, WorkflowStatus};
use crate::step::StepName;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by step bodies and external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while defining, executing or persisting workflows.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A step returned a failure or an error, and retries did not help.
    #[error("Step failed: {step_name}, details: {details}")]
    StepExecution {
        /// The name of the step that failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
        /// Whether another attempt may succeed.
        retryable: bool,
    },

    /// The workflow definition is malformed or refers to something unknown.
    #[error("Invalid workflow configuration: {0}")]
    Configuration(String),

    /// A step exceeded its own deadline.
    #[error("Timeout occurred in step: {step_name} after {timeout:?}")]
    StepTimeout {
        /// The name of the step that timed out.
        step_name: StepName,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The workflow-level deadline was exceeded.
    #[error("Workflow timed out after {timeout:?}")]
    WorkflowTimeout {
        /// The workflow deadline.
        timeout: Duration,
    },

    /// The caller cancelled the execution.
    #[error("Workflow execution was cancelled")]
    Cancelled,

    /// The optimistic guard rejected an update.
    #[error("State conflict on instance {instance_id}: expected {expected}, found {actual}")]
    StateConflict {
        /// The instance whose update was rejected.
        instance_id: WorkflowInstanceId,
        /// What the caller observed.
        expected: String,
        /// What is actually persisted.
        actual: String,
    },

    /// No persisted state exists for the instance.
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(WorkflowInstanceId),

    /// No definition is registered for the descriptor.
    #[error("No workflow definition registered for '{workflow_id}' with context '{context_type}'")]
    DefinitionNotFound {
        /// The workflow identity.
        workflow_id: String,
        /// The context type identity.
        context_type: String,
    },

    /// The status state machine does not allow the transition.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: WorkflowStatus,
        /// Requested status.
        to: WorkflowStatus,
    },

    /// The state repository failed.
    #[error("Repository error: {0}")]
    Repository(String),

    /// Context or state could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl WorkflowError {
    /// Creates a retryable step failure.
    pub fn step(step_name: impl Into<StepName>, details: impl Into<String>) -> Self {
        WorkflowError::StepExecution {
            step_name: step_name.into(),
            details: details.into(),
            retryable: true,
        }
    }

    /// Returns `true` if retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::StepExecution { retryable, .. } => *retryable,
            WorkflowError::StepTimeout { .. } | WorkflowError::Repository(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Serialization(err.to_string())
    }
}

/// A rollback action that itself failed.
///
/// Accumulated on the workflow result; never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    /// The step whose compensation failed.
    pub step_name: StepName,
    /// The error message reported by the compensation.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = WorkflowError::step("test_step", "test error");
        assert_eq!(
            error.to_string(),
            "Step failed: test_step, details: test error"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(WorkflowError::step("s", "boom").is_retryable());
        assert!(WorkflowError::StepTimeout {
            step_name: StepName::new("s"),
            timeout: Duration::from_millis(5),
        }
        .is_retryable());
        assert!(!WorkflowError::Cancelled.is_retryable());
        assert!(!WorkflowError::Configuration("bad".into()).is_retryable());
        assert!(!WorkflowError::StepExecution {
            step_name: StepName::new("s"),
            details: "invalid card".into(),
            retryable: false,
        }
        .is_retryable());
    }
}
