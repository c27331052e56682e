//! Durable workflow execution.

use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use sagaflow_core::{
    DefinitionDescriptor, StoredWorkflowState, Suspension, SuspensionKind, WorkflowContext,
    WorkflowDefinition, WorkflowError, WorkflowInstanceId, WorkflowInstanceState,
    WorkflowNotificationService, WorkflowOutcome, WorkflowResult, WorkflowStateInfo,
    WorkflowStateRepository, WorkflowStatus, CANCELLATION_REASON_KEY, CANCELLED_AT_KEY,
    COMPENSATION_FAILURES_KEY, FAILURE_REASON_KEY, LAST_ERROR_KEY,
};

use crate::config::EngineConfig;
use crate::coordinator::WorkflowStateCoordinator;
use crate::engine::{ExecutionOptions, WorkflowEngine};
use crate::notification::TracingNotificationService;
use crate::registry::DefinitionRegistry;
use crate::signal::{ResumeCallback, SignalHandler};

type Executing = Mutex<HashMap<WorkflowInstanceId, CancellationToken>>;

/// Start, resume, signal and cancel operations over persisted instances.
///
/// Cheap to clone; clones share the same coordinator, registry and
/// in-process execution table.
#[derive(Clone)]
pub struct PersistentWorkflowEngine {
    inner: Arc<Inner>,
}

struct Inner {
    engine: WorkflowEngine,
    coordinator: Arc<WorkflowStateCoordinator>,
    signals: SignalHandler,
    registry: Arc<DefinitionRegistry>,
    notifier: Arc<dyn WorkflowNotificationService>,
    executing: Executing,
}

impl std::fmt::Debug for PersistentWorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentWorkflowEngine")
            .field("engine", &self.inner.engine)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

/// Builder for [`PersistentWorkflowEngine`].
pub struct PersistentWorkflowEngineBuilder {
    repository: Arc<dyn WorkflowStateRepository>,
    registry: Option<Arc<DefinitionRegistry>>,
    notifier: Option<Arc<dyn WorkflowNotificationService>>,
    config: EngineConfig,
}

impl PersistentWorkflowEngineBuilder {
    /// Definitions used to resume instances. Defaults to an empty registry.
    pub fn registry(mut self, registry: Arc<DefinitionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Notification service. Defaults to [`TracingNotificationService`].
    pub fn notifier(mut self, notifier: Arc<dyn WorkflowNotificationService>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine.
    pub fn build(self) -> PersistentWorkflowEngine {
        let coordinator = Arc::new(WorkflowStateCoordinator::new(self.repository));
        let registry = self.registry.unwrap_or_default();
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotificationService));
        let engine = WorkflowEngine::from_config(&self.config);
        let resume_on_signal = self.config.resume_on_signal;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let mut signals = SignalHandler::new(Arc::clone(&coordinator));
            if resume_on_signal {
                signals = signals.with_resume_callback(background_resume(weak.clone()));
            }
            Inner {
                engine,
                coordinator,
                signals,
                registry,
                notifier,
                executing: Mutex::new(HashMap::new()),
            }
        });
        PersistentWorkflowEngine { inner }
    }
}

fn background_resume(weak: Weak<Inner>) -> ResumeCallback {
    Arc::new(move |instance_id| {
        let weak = weak.clone();
        async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let engine = PersistentWorkflowEngine { inner };
            if let Err(error) = engine.resume(&instance_id).await {
                warn!(instance_id = %instance_id, error = %error, "Background resume failed");
            }
        }
        .boxed()
    })
}

impl PersistentWorkflowEngine {
    /// Creates a builder over `repository`.
    pub fn builder(repository: Arc<dyn WorkflowStateRepository>) -> PersistentWorkflowEngineBuilder {
        PersistentWorkflowEngineBuilder {
            repository,
            registry: None,
            notifier: None,
            config: EngineConfig::default(),
        }
    }

    /// The registry used to resume instances.
    pub fn registry(&self) -> &Arc<DefinitionRegistry> {
        &self.inner.registry
    }

    /// The coordinator guarding persisted state.
    pub fn coordinator(&self) -> &Arc<WorkflowStateCoordinator> {
        &self.inner.coordinator
    }

    /// Persists a new instance of `definition` and executes it.
    ///
    /// By the time this returns the persisted state reflects the
    /// completion, failure or suspension of the first run. The definition
    /// is registered if the registry does not know it yet.
    #[instrument(skip_all, fields(workflow_id = %definition.workflow_id()))]
    pub async fn start_persistent_workflow<C: WorkflowContext>(
        &self,
        definition: Arc<WorkflowDefinition<C>>,
        context: C,
    ) -> Result<(WorkflowInstanceId, WorkflowResult<C>), WorkflowError> {
        let descriptor = definition.descriptor();
        if !self.inner.registry.contains(&descriptor) {
            self.inner.registry.register_shared(Arc::clone(&definition));
        }

        let instance_id = WorkflowInstanceId::generate();
        let state = WorkflowInstanceState::new(
            instance_id.clone(),
            definition.workflow_id(),
            definition.display_name(),
            descriptor,
            context,
        );
        self.inner.coordinator.save_workflow_state(&state).await?;
        info!(instance_id = %instance_id, "Workflow instance started");

        let result = self.run_instance(&definition, state).await?;
        Ok((instance_id, result))
    }

    /// Continues a persisted instance from the root of its graph.
    ///
    /// Terminal instances return their cached result, as do waiting
    /// instances whose signal has not arrived. A waiting instance whose
    /// deadline passed resumes into its timeout failure.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::InstanceNotFound`] if no state exists for `instance_id`.
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn resume_workflow<C: WorkflowContext>(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> Result<WorkflowResult<C>, WorkflowError> {
        let mut state = self
            .inner
            .coordinator
            .load_workflow_state::<C>(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.clone()))?;

        if state.status.is_terminal() {
            info!(status = %state.status, "Instance already finished, returning cached result");
            return Ok(cached_result(state));
        }
        if state.status.is_waiting() {
            let now = Utc::now();
            if !state.signal_deadline_passed(now) {
                info!(signal = ?state.waiting_for_signal, "Instance still waiting");
                return Ok(cached_result(state));
            }
            self.expire_wait(instance_id, now).await?;
            state = self
                .inner
                .coordinator
                .load_workflow_state::<C>(instance_id)
                .await?
                .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.clone()))?;
        }

        let Some(definition) = self.inner.registry.get::<C>(&state.workflow_id) else {
            let error = self.report_missing_definition(instance_id, &state.definition).await;
            return Ok(WorkflowResult::failed(
                error,
                state.context,
                state.execution_trace,
            ));
        };
        self.run_instance(&definition, state).await
    }

    /// Resumes an instance without knowing its context type.
    ///
    /// The definition registered for the instance's descriptor decides the
    /// context type; the returned context is JSON.
    pub async fn resume(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> Result<WorkflowResult<Value>, WorkflowError> {
        let info = self
            .inner
            .coordinator
            .get_workflow_state_info(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.clone()))?;
        match self.inner.registry.resume_entry(&info.definition) {
            Some(resume) => resume(self.clone(), instance_id.clone()).await,
            None => Err(self
                .report_missing_definition(instance_id, &info.definition)
                .await),
        }
    }

    /// Cancels a live instance.
    ///
    /// Returns `false`, changing nothing, for unknown or finished instances.
    /// An execution of the instance running in this process is cancelled too.
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn cancel_workflow(&self, instance_id: &WorkflowInstanceId, reason: &str) -> bool {
        let now = Utc::now();
        let applied = self
            .inner
            .coordinator
            .transition(instance_id, |state| {
                if !state.status.is_live() {
                    return Ok(false);
                }
                state.status = WorkflowStatus::Cancelled;
                state.waiting_for_signal = None;
                state.signal_timeout_at = None;
                state
                    .metadata
                    .insert(CANCELLATION_REASON_KEY.to_string(), Value::from(reason));
                state
                    .metadata
                    .insert(CANCELLED_AT_KEY.to_string(), Value::from(now.to_rfc3339()));
                Ok(true)
            })
            .await;

        match applied {
            Ok((true, _)) => {
                if let Some(token) = lock(&self.inner.executing).get(instance_id) {
                    token.cancel();
                }
                info!(reason, "Workflow instance cancelled");
                true
            }
            Ok((false, state)) => {
                info!(status = %state.status, "Instance is not live, nothing to cancel");
                false
            }
            Err(error) => {
                warn!(error = %error, "Cancellation rejected");
                false
            }
        }
    }

    /// Delivers a signal; see [`SignalHandler::deliver_signal`].
    pub async fn signal_workflow(
        &self,
        instance_id: &WorkflowInstanceId,
        signal_name: &str,
        payload: Value,
    ) -> bool {
        self.inner
            .signals
            .deliver_signal(instance_id, signal_name, payload)
            .await
    }

    /// Read-only snapshot of an instance.
    pub async fn get_workflow_state<C: WorkflowContext>(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstanceState<C>>, WorkflowError> {
        self.inner
            .coordinator
            .load_workflow_state::<C>(instance_id)
            .await
    }

    /// Status of an instance without knowing its context type.
    pub async fn get_workflow_state_info(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> Result<Option<WorkflowStateInfo>, WorkflowError> {
        self.inner
            .coordinator
            .get_workflow_state_info(instance_id)
            .await
    }

    /// Returns `true` while an execution of the instance runs in this process.
    pub fn is_executing(&self, instance_id: &WorkflowInstanceId) -> bool {
        lock(&self.inner.executing).contains_key(instance_id)
    }

    async fn run_instance<C: WorkflowContext>(
        &self,
        definition: &WorkflowDefinition<C>,
        mut state: WorkflowInstanceState<C>,
    ) -> Result<WorkflowResult<C>, WorkflowError> {
        let instance_id = state.workflow_instance_id.clone();
        let (_guard, cancellation) = ExecutionGuard::acquire(&self.inner.executing, &instance_id)?;

        let options = ExecutionOptions::new()
            .instance_id(instance_id.clone())
            .signals(state.delivered_signals())
            .expired_signals(state.expired_signals())
            .history(state.execution_trace.clone());
        let result = self
            .inner
            .engine
            .execute(definition, state.context.clone(), options, cancellation)
            .await;

        let observed = state.status;
        apply_result(&mut state, &result);
        if let Err(error) = self
            .inner
            .coordinator
            .update_workflow_state(&mut state, observed)
            .await
        {
            return self.handle_update_failure(&instance_id, error, result).await;
        }

        if state.status.is_terminal() {
            self.notify_finished(&state, &result);
        }
        Ok(result)
    }

    async fn handle_update_failure<C: WorkflowContext>(
        &self,
        instance_id: &WorkflowInstanceId,
        error: WorkflowError,
        result: WorkflowResult<C>,
    ) -> Result<WorkflowResult<C>, WorkflowError> {
        let current = self
            .inner
            .coordinator
            .load_stored_state(instance_id)
            .await
            .ok()
            .flatten();
        if let Some(current) = &current {
            if current.status == WorkflowStatus::Cancelled {
                info!(instance_id = %instance_id, "Instance was cancelled during execution");
                return Ok(result);
            }
        }

        warn!(instance_id = %instance_id, error = %error, "Failed to persist execution result");
        if !matches!(error, WorkflowError::StateConflict { .. }) {
            self.record_last_error(instance_id, &error).await;
        }
        if let Some(current) = current {
            self.notify_error(current, error.to_string(), Some(error.clone()));
        }
        Err(error)
    }

    async fn expire_wait(
        &self,
        instance_id: &WorkflowInstanceId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        self.inner
            .coordinator
            .transition(instance_id, |state| {
                if !state.signal_deadline_passed(now) {
                    return Ok(());
                }
                if let Some(signal) = state.waiting_for_signal.take() {
                    warn!(signal = %signal, "Signal deadline passed");
                    state.metadata.insert(
                        sagaflow_core::signal_timeout_metadata_key(&signal),
                        Value::from(now.to_rfc3339()),
                    );
                }
                state.status = WorkflowStatus::Running;
                state.signal_timeout_at = None;
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn report_missing_definition(
        &self,
        instance_id: &WorkflowInstanceId,
        descriptor: &DefinitionDescriptor,
    ) -> WorkflowError {
        let error = WorkflowError::DefinitionNotFound {
            workflow_id: descriptor.workflow_id.clone(),
            context_type: descriptor.context_type.clone(),
        };
        warn!(instance_id = %instance_id, definition = %descriptor, "No definition to resume with");
        if let Some(state) = self.record_last_error(instance_id, &error).await {
            self.notify_error(state, error.to_string(), Some(error.clone()));
        }
        error
    }

    async fn record_last_error(
        &self,
        instance_id: &WorkflowInstanceId,
        error: &WorkflowError,
    ) -> Option<StoredWorkflowState> {
        let message = error.to_string();
        match self
            .inner
            .coordinator
            .transition(instance_id, |state| {
                if state.status.is_live() {
                    state
                        .metadata
                        .insert(LAST_ERROR_KEY.to_string(), Value::from(message));
                }
                Ok(())
            })
            .await
        {
            Ok((_, state)) => Some(state),
            Err(nested) => {
                warn!(instance_id = %instance_id, error = %nested, "Failed to record error");
                None
            }
        }
    }

    fn notify_finished<C: WorkflowContext>(
        &self,
        state: &WorkflowInstanceState<C>,
        result: &WorkflowResult<C>,
    ) {
        let context = serde_json::to_value(&result.context).map_err(WorkflowError::from);
        let (stored, context) = match (state.to_stored(), context) {
            (Ok(stored), Ok(context)) => (stored, context),
            (Err(error), _) | (_, Err(error)) => {
                warn!(error = %error, "Failed to prepare notification");
                return;
            }
        };
        let erased = result.clone().map_context(|_| context);
        if let WorkflowOutcome::Failed { message, error } = &erased.outcome {
            self.notify_error(
                stored.clone(),
                message.clone(),
                error.as_deref().cloned(),
            );
        }

        let notifier = Arc::clone(&self.inner.notifier);
        tokio::spawn(async move {
            if let Err(error) = notifier
                .send_workflow_completion_notification(&stored, &erased)
                .await
            {
                warn!(
                    instance_id = %stored.workflow_instance_id,
                    error = %error,
                    "Completion notification failed"
                );
            }
        });
    }

    fn notify_error(&self, state: StoredWorkflowState, message: String, error: Option<WorkflowError>) {
        let notifier = Arc::clone(&self.inner.notifier);
        tokio::spawn(async move {
            if let Err(nested) = notifier
                .send_workflow_error_notification(&state, &message, error.as_ref())
                .await
            {
                warn!(
                    instance_id = %state.workflow_instance_id,
                    error = %nested,
                    "Error notification failed"
                );
            }
        });
    }
}

/// Copies an execution's outcome onto the instance record.
fn apply_result<C: Clone>(state: &mut WorkflowInstanceState<C>, result: &WorkflowResult<C>) {
    state.context = result.context.clone();
    state
        .execution_trace
        .extend(result.execution_trace.iter().cloned());
    state.waiting_for_signal = None;
    state.signal_timeout_at = None;

    if !result.is_failure() {
        state.metadata.remove(LAST_ERROR_KEY);
    }

    match &result.outcome {
        WorkflowOutcome::Completed => state.status = WorkflowStatus::Completed,
        WorkflowOutcome::Suspended(suspension) => {
            state.status = match suspension.kind {
                SuspensionKind::Signal => WorkflowStatus::WaitingForSignal,
                SuspensionKind::Approval => WorkflowStatus::WaitingForApproval,
            };
            state.waiting_for_signal = Some(suspension.signal_name.clone());
            state.signal_timeout_at = suspension
                .timeout
                .and_then(|timeout| chrono::Duration::from_std(timeout).ok())
                .and_then(|timeout| Utc::now().checked_add_signed(timeout));
        }
        WorkflowOutcome::Failed { message, .. } => {
            state.status = WorkflowStatus::Failed;
            state
                .metadata
                .insert(FAILURE_REASON_KEY.to_string(), Value::from(message.as_str()));
            if !result.compensation_failures.is_empty() {
                if let Ok(failures) = serde_json::to_value(&result.compensation_failures) {
                    state
                        .metadata
                        .insert(COMPENSATION_FAILURES_KEY.to_string(), failures);
                }
            }
        }
    }
}

/// The result a finished or still-waiting instance reports without running.
fn cached_result<C>(state: WorkflowInstanceState<C>) -> WorkflowResult<C> {
    let outcome = match state.status {
        WorkflowStatus::Completed | WorkflowStatus::Running => WorkflowOutcome::Completed,
        WorkflowStatus::Failed => WorkflowOutcome::Failed {
            message: state
                .metadata
                .get(FAILURE_REASON_KEY)
                .and_then(Value::as_str)
                .unwrap_or("Workflow failed")
                .to_string(),
            error: None,
        },
        WorkflowStatus::Cancelled => WorkflowOutcome::Failed {
            message: state
                .metadata
                .get(CANCELLATION_REASON_KEY)
                .and_then(Value::as_str)
                .map_or_else(|| WorkflowError::Cancelled.to_string(), str::to_string),
            error: Some(Arc::new(WorkflowError::Cancelled)),
        },
        WorkflowStatus::WaitingForSignal | WorkflowStatus::WaitingForApproval => {
            let signal_name = state.waiting_for_signal.clone().unwrap_or_default();
            let remaining = state
                .signal_timeout_at
                .and_then(|at| (at - Utc::now()).to_std().ok());
            WorkflowOutcome::Suspended(match state.status {
                WorkflowStatus::WaitingForApproval => Suspension::approval(signal_name, remaining),
                _ => Suspension::signal(signal_name, remaining),
            })
        }
    };
    WorkflowResult::with_outcome(outcome, state.context, state.execution_trace)
}

fn lock(executing: &Executing) -> std::sync::MutexGuard<'_, HashMap<WorkflowInstanceId, CancellationToken>> {
    executing.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks an instance as executing in this process until dropped.
struct ExecutionGuard<'a> {
    executing: &'a Executing,
    instance_id: WorkflowInstanceId,
}

impl<'a> ExecutionGuard<'a> {
    fn acquire(
        executing: &'a Executing,
        instance_id: &WorkflowInstanceId,
    ) -> Result<(Self, CancellationToken), WorkflowError> {
        let mut table = lock(executing);
        if table.contains_key(instance_id) {
            return Err(WorkflowError::StateConflict {
                instance_id: instance_id.clone(),
                expected: "idle".to_string(),
                actual: "executing".to_string(),
            });
        }
        let token = CancellationToken::new();
        table.insert(instance_id.clone(), token.clone());
        Ok((
            Self {
                executing,
                instance_id: instance_id.clone(),
            },
            token,
        ))
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        lock(self.executing).remove(&self.instance_id);
    }
}
