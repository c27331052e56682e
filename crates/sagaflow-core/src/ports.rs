//! Interfaces to external collaborators.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{BoxError, WorkflowError};
use crate::result::WorkflowResult;
use crate::state::{StoredWorkflowState, WorkflowInstanceId};

/// Durable store of workflow instance state, keyed by instance id.
///
/// Implementations must be safe for concurrent calls on distinct ids.
/// Per-instance consistency is enforced by the coordinator, not here.
#[async_trait]
pub trait WorkflowStateRepository: Send + Sync {
    /// Persists a new instance record.
    async fn save_workflow_state(&self, state: &StoredWorkflowState) -> Result<(), WorkflowError>;

    /// Loads an instance record.
    async fn get_workflow_state(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> Result<Option<StoredWorkflowState>, WorkflowError>;

    /// Replaces an existing instance record.
    async fn update_workflow_state(&self, state: &StoredWorkflowState)
        -> Result<(), WorkflowError>;
}

/// Fire-and-forget delivery of workflow outcomes.
///
/// Errors are logged by the caller and never fail the workflow operation
/// that triggered the notification.
#[async_trait]
pub trait WorkflowNotificationService: Send + Sync {
    /// The instance reached a terminal status.
    async fn send_workflow_completion_notification(
        &self,
        state: &StoredWorkflowState,
        result: &WorkflowResult<Value>,
    ) -> Result<(), BoxError>;

    /// The instance failed, or orchestration around it did.
    async fn send_workflow_error_notification(
        &self,
        state: &StoredWorkflowState,
        message: &str,
        error: Option<&WorkflowError>,
    ) -> Result<(), BoxError>;
}
