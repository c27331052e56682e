//! Persisted workflow instance state.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::result::StepExecutionTrace;

/// Metadata key holding the payload of a delivered signal.
pub fn signal_metadata_key(signal_name: &str) -> String {
    format!("signal_{signal_name}")
}

/// Metadata key marking that the wait for a signal expired.
pub fn signal_timeout_metadata_key(signal_name: &str) -> String {
    format!("signal_timeout_{signal_name}")
}

/// Metadata key for the cancellation reason.
pub const CANCELLATION_REASON_KEY: &str = "cancellation_reason";
/// Metadata key for the cancellation timestamp.
pub const CANCELLED_AT_KEY: &str = "cancelled_at";
/// Metadata key for the failure reason.
pub const FAILURE_REASON_KEY: &str = "failure_reason";
/// Metadata key for the last orchestration error.
pub const LAST_ERROR_KEY: &str = "last_error";
/// Metadata key for the compensation failures of the final run.
pub const COMPENSATION_FAILURES_KEY: &str = "compensation_failures";

/// Opaque, globally unique identity of one workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowInstanceId(String);

impl WorkflowInstanceId {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkflowInstanceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Lifecycle status of a workflow instance.
///
/// ```text
/// Running → Completed | Failed | Cancelled | WaitingForSignal | WaitingForApproval
/// WaitingForSignal | WaitingForApproval → Running | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Executing, or ready to be resumed.
    Running,
    /// Suspended until a named signal arrives.
    WaitingForSignal,
    /// Suspended until an approval decision arrives.
    WaitingForApproval,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
}

impl WorkflowStatus {
    /// Returns `true` if the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (
                Running,
                Completed | Failed | Cancelled | WaitingForSignal | WaitingForApproval
            ) | (WaitingForSignal | WaitingForApproval, Running | Cancelled)
        )
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Non-terminal statuses.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    /// Suspended statuses.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            WorkflowStatus::WaitingForSignal | WorkflowStatus::WaitingForApproval
        )
    }

    /// Validates a transition, returning the typed error on rejection.
    pub fn transition_to(self, next: WorkflowStatus) -> Result<WorkflowStatus, WorkflowError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(WorkflowError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::WaitingForSignal => "waiting_for_signal",
            WorkflowStatus::WaitingForApproval => "waiting_for_approval",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Enough information to look a definition back up in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionDescriptor {
    /// Stable workflow identity.
    pub workflow_id: String,
    /// Definition version at start time.
    pub version: u32,
    /// Stable context type identity.
    pub context_type: String,
}

impl fmt::Display for DefinitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@v{}[{}]",
            self.workflow_id, self.version, self.context_type
        )
    }
}

/// The persisted record of one workflow instance.
///
/// Created when a persistent workflow starts and mutated only through the
/// state coordinator. Immutable once the status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceState<C> {
    /// Instance identity.
    pub workflow_instance_id: WorkflowInstanceId,
    /// Workflow identity.
    pub workflow_id: String,
    /// Human readable workflow name.
    pub workflow_display_name: String,
    /// The user context as of the last persisted point.
    pub context: C,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last accepted update.
    pub last_updated_at: DateTime<Utc>,
    /// Time the instance reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Signal the instance is suspended on.
    pub waiting_for_signal: Option<String>,
    /// Deadline for the awaited signal.
    pub signal_timeout_at: Option<DateTime<Utc>>,
    /// Free-form annotations: delivered payloads, failure and cancellation reasons.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Registry lookup key.
    pub definition: DefinitionDescriptor,
    /// Every step attempt across all runs, in execution order.
    #[serde(default)]
    pub execution_trace: Vec<StepExecutionTrace>,
    /// Incremented on every accepted update.
    #[serde(default)]
    pub revision: u64,
}

/// Instance state with the context type erased to JSON, as stored.
pub type StoredWorkflowState = WorkflowInstanceState<Value>;

impl<C> WorkflowInstanceState<C> {
    /// Fresh `Running` state for a new instance.
    pub fn new(
        workflow_instance_id: WorkflowInstanceId,
        workflow_id: impl Into<String>,
        workflow_display_name: impl Into<String>,
        definition: DefinitionDescriptor,
        context: C,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_instance_id,
            workflow_id: workflow_id.into(),
            workflow_display_name: workflow_display_name.into(),
            context,
            status: WorkflowStatus::Running,
            created_at: now,
            last_updated_at: now,
            completed_at: None,
            waiting_for_signal: None,
            signal_timeout_at: None,
            metadata: HashMap::new(),
            definition,
            execution_trace: Vec::new(),
            revision: 0,
        }
    }

    /// Signal payloads delivered so far, keyed by signal name.
    pub fn delivered_signals(&self) -> HashMap<String, Value> {
        self.metadata
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix("signal_")
                    .filter(|name| !name.starts_with("timeout_"))
                    .map(|name| (name.to_string(), value.clone()))
            })
            .collect()
    }

    /// Signals whose wait expired, by name.
    pub fn expired_signals(&self) -> Vec<String> {
        self.metadata
            .keys()
            .filter_map(|key| key.strip_prefix("signal_timeout_"))
            .map(str::to_string)
            .collect()
    }

    /// Returns `true` if the instance waits on a signal whose deadline has passed.
    pub fn signal_deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && self.signal_timeout_at.is_some_and(|at| at <= now)
    }

    /// Lightweight view for callers that do not know the context type.
    pub fn info(&self) -> WorkflowStateInfo {
        WorkflowStateInfo {
            workflow_instance_id: self.workflow_instance_id.clone(),
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            waiting_for_signal: self.waiting_for_signal.clone(),
            signal_timeout_at: self.signal_timeout_at,
            definition: self.definition.clone(),
            revision: self.revision,
            last_updated_at: self.last_updated_at,
        }
    }
}

impl<C: WorkflowContext> WorkflowInstanceState<C> {
    /// Erases the context to JSON for storage.
    pub fn to_stored(&self) -> Result<StoredWorkflowState, WorkflowError> {
        Ok(WorkflowInstanceState {
            workflow_instance_id: self.workflow_instance_id.clone(),
            workflow_id: self.workflow_id.clone(),
            workflow_display_name: self.workflow_display_name.clone(),
            context: serde_json::to_value(&self.context)?,
            status: self.status,
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
            completed_at: self.completed_at,
            waiting_for_signal: self.waiting_for_signal.clone(),
            signal_timeout_at: self.signal_timeout_at,
            metadata: self.metadata.clone(),
            definition: self.definition.clone(),
            execution_trace: self.execution_trace.clone(),
            revision: self.revision,
        })
    }
}

impl StoredWorkflowState {
    /// Restores the typed context.
    pub fn into_typed<C: DeserializeOwned>(self) -> Result<WorkflowInstanceState<C>, WorkflowError> {
        let context = serde_json::from_value(self.context)?;
        Ok(WorkflowInstanceState {
            workflow_instance_id: self.workflow_instance_id,
            workflow_id: self.workflow_id,
            workflow_display_name: self.workflow_display_name,
            context,
            status: self.status,
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
            completed_at: self.completed_at,
            waiting_for_signal: self.waiting_for_signal,
            signal_timeout_at: self.signal_timeout_at,
            metadata: self.metadata,
            definition: self.definition,
            execution_trace: self.execution_trace,
            revision: self.revision,
        })
    }
}

/// Status information readable without knowing the context type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStateInfo {
    /// Instance identity.
    pub workflow_instance_id: WorkflowInstanceId,
    /// Workflow identity.
    pub workflow_id: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Awaited signal, if waiting.
    pub waiting_for_signal: Option<String>,
    /// Deadline for the awaited signal.
    pub signal_timeout_at: Option<DateTime<Utc>>,
    /// Registry lookup key, including the context type.
    pub definition: DefinitionDescriptor,
    /// Revision of the persisted record.
    pub revision: u64,
    /// Last accepted update.
    pub last_updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use WorkflowStatus::*;

    #[test]
    fn test_allowed_transitions() {
        for next in [Completed, Failed, Cancelled, WaitingForSignal, WaitingForApproval] {
            assert!(Running.can_transition_to(next), "running -> {next}");
        }
        for waiting in [WaitingForSignal, WaitingForApproval] {
            assert!(waiting.can_transition_to(Running));
            assert!(waiting.can_transition_to(Cancelled));
            assert!(!waiting.can_transition_to(Completed));
            assert!(!waiting.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_terminal_statuses_are_final() {
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Running, Completed, Failed, Cancelled, WaitingForSignal] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(matches!(
            Completed.transition_to(Running),
            Err(WorkflowError::InvalidTransition { from: Completed, to: Running })
        ));
    }

    fn descriptor() -> DefinitionDescriptor {
        DefinitionDescriptor {
            workflow_id: "orders".into(),
            version: 2,
            context_type: "json".into(),
        }
    }

    #[test]
    fn test_signal_metadata_views() {
        let mut state =
            WorkflowInstanceState::new("i-1".into(), "orders", "Orders", descriptor(), json!({}));
        state.metadata.insert(signal_metadata_key("payment"), json!({"amount": 10}));
        state.metadata.insert(signal_timeout_metadata_key("approval"), json!(true));
        state.metadata.insert(CANCELLATION_REASON_KEY.into(), json!("nope"));

        let signals = state.delivered_signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals["payment"], json!({"amount": 10}));
        assert_eq!(state.expired_signals(), vec!["approval".to_string()]);
    }

    #[test]
    fn test_typed_round_trip_preserves_record() {
        let state = WorkflowInstanceState::new(
            "i-2".into(),
            "orders",
            "Orders",
            descriptor(),
            json!({"value": 1}),
        );
        let stored = state.to_stored().expect("serializable");
        let typed: WorkflowInstanceState<Value> = stored.clone().into_typed().expect("typed");
        assert_eq!(typed, state);
        assert_eq!(stored.info().status, Running);
        assert_eq!(descriptor().to_string(), "orders@v2[json]");
    }
}
