//! Notification services.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use sagaflow_core::{
    BoxError, StoredWorkflowState, WorkflowError, WorkflowNotificationService, WorkflowResult,
};

/// Emits notifications as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationService;

#[async_trait]
impl WorkflowNotificationService for TracingNotificationService {
    async fn send_workflow_completion_notification(
        &self,
        state: &StoredWorkflowState,
        result: &WorkflowResult<Value>,
    ) -> Result<(), BoxError> {
        info!(
            instance_id = %state.workflow_instance_id,
            workflow_id = %state.workflow_id,
            status = %state.status,
            success = result.is_success(),
            steps = result.step_attempts(),
            "Workflow finished"
        );
        Ok(())
    }

    async fn send_workflow_error_notification(
        &self,
        state: &StoredWorkflowState,
        message: &str,
        error: Option<&WorkflowError>,
    ) -> Result<(), BoxError> {
        warn!(
            instance_id = %state.workflow_instance_id,
            workflow_id = %state.workflow_id,
            status = %state.status,
            error = ?error,
            "{message}"
        );
        Ok(())
    }
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotificationService;

#[async_trait]
impl WorkflowNotificationService for NoopNotificationService {
    async fn send_workflow_completion_notification(
        &self,
        _state: &StoredWorkflowState,
        _result: &WorkflowResult<Value>,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    async fn send_workflow_error_notification(
        &self,
        _state: &StoredWorkflowState,
        _message: &str,
        _error: Option<&WorkflowError>,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}
