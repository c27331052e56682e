//! Guarded access to persisted instance state.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use sagaflow_core::{
    StoredWorkflowState, WorkflowContext, WorkflowError, WorkflowInstanceId,
    WorkflowInstanceState, WorkflowStateInfo, WorkflowStateRepository, WorkflowStatus,
};

/// Wraps a [`WorkflowStateRepository`] with per-instance mutual exclusion,
/// context type checks and an optimistic status/revision guard.
///
/// Every accepted write increments the record's revision and stamps
/// `last_updated_at`; a write that reaches a terminal status also stamps
/// `completed_at`.
pub struct WorkflowStateCoordinator {
    repository: Arc<dyn WorkflowStateRepository>,
    locks: SyncMutex<HashMap<WorkflowInstanceId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for WorkflowStateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStateCoordinator").finish_non_exhaustive()
    }
}

impl WorkflowStateCoordinator {
    /// Creates a coordinator over `repository`.
    pub fn new(repository: Arc<dyn WorkflowStateRepository>) -> Self {
        Self {
            repository,
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    /// Persists a new instance.
    pub async fn save_workflow_state<C: WorkflowContext>(
        &self,
        state: &WorkflowInstanceState<C>,
    ) -> Result<(), WorkflowError> {
        let _guard = self.lock(&state.workflow_instance_id).await;
        self.repository
            .save_workflow_state(&state.to_stored()?)
            .await
    }

    /// Loads an instance with its typed context.
    ///
    /// Fails with [`WorkflowError::Configuration`] if the instance was
    /// started with a different context type.
    pub async fn load_workflow_state<C: WorkflowContext>(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstanceState<C>>, WorkflowError> {
        let Some(stored) = self.repository.get_workflow_state(instance_id).await? else {
            return Ok(None);
        };
        if stored.definition.context_type != C::context_type() {
            return Err(WorkflowError::Configuration(format!(
                "Instance {instance_id} stores context '{}', not '{}'",
                stored.definition.context_type,
                C::context_type()
            )));
        }
        stored.into_typed().map(Some)
    }

    /// Loads an instance with its context left as JSON.
    pub async fn load_stored_state(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> Result<Option<StoredWorkflowState>, WorkflowError> {
        self.repository.get_workflow_state(instance_id).await
    }

    /// Status of an instance, for callers that do not know its context type.
    ///
    /// The returned descriptor names the context type the instance was started with.
    pub async fn get_workflow_state_info(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> Result<Option<WorkflowStateInfo>, WorkflowError> {
        Ok(self
            .repository
            .get_workflow_state(instance_id)
            .await?
            .map(|stored| stored.info()))
    }

    /// Writes `state` if the persisted record still has status `observed`
    /// and the revision `state` was loaded at.
    ///
    /// `observed` must be live. On success `state.revision` and the
    /// timestamps are updated to match what was persisted.
    pub async fn update_workflow_state<C: WorkflowContext>(
        &self,
        state: &mut WorkflowInstanceState<C>,
        observed: WorkflowStatus,
    ) -> Result<(), WorkflowError> {
        let instance_id = state.workflow_instance_id.clone();
        let _guard = self.lock(&instance_id).await;

        let current = self
            .repository
            .get_workflow_state(&instance_id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.clone()))?;
        if current.status != observed || current.revision != state.revision || observed.is_terminal()
        {
            return Err(WorkflowError::StateConflict {
                instance_id,
                expected: format!("{observed}@{}", state.revision),
                actual: format!("{}@{}", current.status, current.revision),
            });
        }
        check_transition(observed, state.status)?;

        stamp(state, observed);
        let stored = state.to_stored()?;
        self.repository.update_workflow_state(&stored).await?;
        debug!(
            instance_id = %instance_id,
            status = %state.status,
            revision = state.revision,
            "Workflow state updated"
        );
        Ok(())
    }

    /// Applies `apply` to the persisted record under the instance lock.
    ///
    /// The record is written only if `apply` changed it; an `Err` from
    /// `apply` leaves it untouched. Returns the value produced by `apply`
    /// and the record as it now stands.
    pub async fn transition<T>(
        &self,
        instance_id: &WorkflowInstanceId,
        apply: impl FnOnce(&mut StoredWorkflowState) -> Result<T, WorkflowError> + Send,
    ) -> Result<(T, StoredWorkflowState), WorkflowError> {
        let _guard = self.lock(instance_id).await;

        let current = self
            .repository
            .get_workflow_state(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.clone()))?;
        let mut next = current.clone();
        let value = apply(&mut next)?;
        if next == current {
            return Ok((value, current));
        }
        if current.status.is_terminal() {
            return Err(WorkflowError::StateConflict {
                instance_id: instance_id.clone(),
                expected: "live status".to_string(),
                actual: current.status.to_string(),
            });
        }
        check_transition(current.status, next.status)?;

        next.revision = current.revision;
        stamp(&mut next, current.status);
        self.repository.update_workflow_state(&next).await?;
        debug!(
            instance_id = %instance_id,
            from = %current.status,
            to = %next.status,
            revision = next.revision,
            "Workflow state transitioned"
        );
        Ok((value, next))
    }

    async fn lock(&self, instance_id: &WorkflowInstanceId) -> InstanceGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(instance_id.clone()).or_default())
        };
        // Dropping this future before the lock is acquired must still prune the entry.
        let mut guard = InstanceGuard {
            locks: &self.locks,
            instance_id: instance_id.clone(),
            lock,
            held: None,
        };
        guard.held = Some(Arc::clone(&guard.lock).lock_owned().await);
        guard
    }
}

/// Holds an instance lock; the table entry is removed once nobody else wants it.
struct InstanceGuard<'a> {
    locks: &'a SyncMutex<HashMap<WorkflowInstanceId, Arc<Mutex<()>>>>,
    instance_id: WorkflowInstanceId,
    lock: Arc<Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one here.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.instance_id);
        }
    }
}

/// Live records may be rewritten in place; status changes follow the state machine.
fn check_transition(from: WorkflowStatus, to: WorkflowStatus) -> Result<(), WorkflowError> {
    if from == to && from.is_live() {
        return Ok(());
    }
    from.transition_to(to).map(|_| ())
}

fn stamp<C>(state: &mut WorkflowInstanceState<C>, previous: WorkflowStatus) {
    let now = Utc::now();
    state.revision += 1;
    state.last_updated_at = now;
    if state.status.is_terminal() && !previous.is_terminal() {
        state.completed_at = Some(now);
    }
}
