//! Delivery of external signals to waiting instances.

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use sagaflow_core::{
    signal_metadata_key, signal_timeout_metadata_key, WorkflowError, WorkflowInstanceId,
    WorkflowStatus,
};

use crate::coordinator::WorkflowStateCoordinator;

/// Invoked in the background after a signal moved an instance back to `Running`.
pub type ResumeCallback = Arc<dyn Fn(WorkflowInstanceId) -> BoxFuture<'static, ()> + Send + Sync>;

/// How a delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Payload stored; the instance is ready to resume.
    Accepted,
    /// The wait had already expired. The timeout was recorded and the
    /// instance is ready to resume into its failure path.
    Expired,
    /// Nothing changed.
    Rejected(String),
}

/// Validates and routes signals to waiting instances.
pub struct SignalHandler {
    coordinator: Arc<WorkflowStateCoordinator>,
    on_resume: Option<ResumeCallback>,
}

impl std::fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHandler")
            .field("resumes", &self.on_resume.is_some())
            .finish()
    }
}

impl SignalHandler {
    /// Creates a handler that does not resume instances.
    pub fn new(coordinator: Arc<WorkflowStateCoordinator>) -> Self {
        Self {
            coordinator,
            on_resume: None,
        }
    }

    /// Resume instances through `callback` once a signal is accepted.
    pub fn with_resume_callback(mut self, callback: ResumeCallback) -> Self {
        self.on_resume = Some(callback);
        self
    }

    /// Delivers `payload` as signal `signal_name`.
    ///
    /// Returns `true` if the instance was waiting for exactly this signal
    /// and its deadline had not passed. Resumption runs afterwards in the
    /// background and reports through notifications, not through this
    /// return value.
    pub async fn deliver_signal(
        &self,
        instance_id: &WorkflowInstanceId,
        signal_name: &str,
        payload: Value,
    ) -> bool {
        match self.deliver(instance_id, signal_name, payload).await {
            Delivery::Accepted => true,
            Delivery::Expired | Delivery::Rejected(_) => false,
        }
    }

    /// Like [`deliver_signal`](Self::deliver_signal), with the reason.
    pub async fn deliver(
        &self,
        instance_id: &WorkflowInstanceId,
        signal_name: &str,
        payload: Value,
    ) -> Delivery {
        let now = Utc::now();
        let applied = self
            .coordinator
            .transition(instance_id, |state| {
                if !state.status.is_waiting() {
                    return Ok(Delivery::Rejected(format!(
                        "instance is {}, not waiting",
                        state.status
                    )));
                }
                if state.waiting_for_signal.as_deref() != Some(signal_name) {
                    return Ok(Delivery::Rejected(format!(
                        "instance waits for {:?}",
                        state.waiting_for_signal
                    )));
                }

                let delivery = if state.signal_deadline_passed(now) {
                    state.metadata.insert(
                        signal_timeout_metadata_key(signal_name),
                        Value::String(now.to_rfc3339()),
                    );
                    Delivery::Expired
                } else {
                    state
                        .metadata
                        .insert(signal_metadata_key(signal_name), payload);
                    Delivery::Accepted
                };
                state.status = WorkflowStatus::Running;
                state.waiting_for_signal = None;
                state.signal_timeout_at = None;
                Ok(delivery)
            })
            .await;

        let delivery = match applied {
            Ok((delivery, _)) => delivery,
            Err(WorkflowError::InstanceNotFound(_)) => {
                Delivery::Rejected("instance not found".to_string())
            }
            Err(error) => Delivery::Rejected(error.to_string()),
        };

        match &delivery {
            Delivery::Accepted => {
                info!(instance_id = %instance_id, signal = signal_name, "Signal accepted");
                self.resume(instance_id);
            }
            Delivery::Expired => {
                warn!(instance_id = %instance_id, signal = signal_name, "Signal arrived after its deadline");
                self.resume(instance_id);
            }
            Delivery::Rejected(reason) => {
                info!(instance_id = %instance_id, signal = signal_name, %reason, "Signal rejected");
            }
        }
        delivery
    }

    fn resume(&self, instance_id: &WorkflowInstanceId) {
        if let Some(callback) = &self.on_resume {
            tokio::spawn(callback(instance_id.clone()));
        }
    }
}
