//! In-memory execution of workflow definitions.

use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use sagaflow_core::{
    CompensationFailure, Node, Replay, Step, StepContext, StepExecutionTrace, StepName,
    StepOutcome, StepResult, Suspension, SuspensionKind, TraceKind, WaitNode,
    WorkflowDefinition, WorkflowError, WorkflowInstanceId, WorkflowResult,
};

use crate::config::EngineConfig;

/// Per-call execution settings.
///
/// A fresh execution needs none of these. Resumed executions carry the
/// instance history and delivered signals.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    instance_id: Option<WorkflowInstanceId>,
    signals: HashMap<String, Value>,
    expired_signals: HashSet<String>,
    history: Vec<StepExecutionTrace>,
    compensate: Option<bool>,
    workflow_timeout: Option<Duration>,
}

impl ExecutionOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// The persistent instance being executed.
    pub fn instance_id(mut self, instance_id: WorkflowInstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Signal payloads delivered so far.
    pub fn signals(mut self, signals: HashMap<String, Value>) -> Self {
        self.signals = signals;
        self
    }

    /// Signals whose wait expired.
    pub fn expired_signals(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.expired_signals = names.into_iter().collect();
        self
    }

    /// Trace of earlier runs of the same instance.
    pub fn history(mut self, history: Vec<StepExecutionTrace>) -> Self {
        self.history = history;
        self
    }

    /// Overrides whether compensations run after a failure.
    pub fn compensate(mut self, enabled: bool) -> Self {
        self.compensate = Some(enabled);
        self
    }

    /// Overrides the workflow deadline.
    pub fn workflow_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_timeout = Some(timeout);
        self
    }
}

/// Walks a [`WorkflowDefinition`] against a context.
///
/// # Examples
///
/// ```
/// use sagaflow::prelude::*;
/// use async_trait::async_trait;
///
/// define_step!(AddOne);
///
/// #[async_trait]
/// impl Step<u32> for AddOne {
///     async fn execute(&self, ctx: &StepContext<u32>) -> Result<StepResult, BoxError> {
///         *ctx.lock().await += 1;
///         Ok(StepResult::success())
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let definition = WorkflowDefinition::builder("add")
///     .graph(Node::step(AddOne))
///     .build()
///     .expect("valid workflow");
///
/// let result = WorkflowEngine::new()
///     .execute(&definition, 41, ExecutionOptions::new(), CancellationToken::new())
///     .await;
/// assert!(result.is_success());
/// assert_eq!(result.context, 42);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    default_step_timeout: Duration,
    default_workflow_timeout: Option<Duration>,
    compensate_on_failure: bool,
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl WorkflowEngine {
    /// Engine with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine using the defaults of `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            default_step_timeout: config.default_step_timeout(),
            default_workflow_timeout: config.default_workflow_timeout(),
            compensate_on_failure: config.compensate_on_failure,
        }
    }

    /// Executes `definition` from its root node.
    ///
    /// Returns when every node completed, a failure was confirmed (and
    /// compensated), or a node suspended. Cancelling `cancellation` or
    /// passing the workflow deadline fails the execution.
    #[instrument(skip_all, fields(workflow_id = %definition.workflow_id()))]
    pub async fn execute<C>(
        &self,
        definition: &WorkflowDefinition<C>,
        context: C,
        options: ExecutionOptions,
        cancellation: CancellationToken,
    ) -> WorkflowResult<C>
    where
        C: Clone + Send + Sync + 'static,
    {
        let run_token = cancellation.child_token();
        let ctx = StepContext::new(
            context,
            options.signals,
            options.instance_id.clone(),
            run_token.clone(),
        );
        let run = Run {
            ctx,
            journal: Mutex::new(Journal::default()),
            completed: options
                .history
                .iter()
                .filter(|entry| entry.is_completed_step())
                .map(|entry| entry.step_name.clone())
                .collect(),
            consumed: options
                .history
                .iter()
                .filter(|entry| entry.kind == TraceKind::Signal)
                .map(|entry| entry.step_name.clone())
                .collect(),
            expired: options.expired_signals,
            halt: AtomicU8::new(Halt::None as u8),
            default_step_timeout: self.default_step_timeout,
        };

        let deadline = options
            .workflow_timeout
            .or(definition.timeout())
            .or(self.default_workflow_timeout);
        info!(
            instance_id = ?options.instance_id,
            resumed = !options.history.is_empty(),
            "Executing workflow"
        );

        let flow = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Flow::Failed(WorkflowError::Cancelled),
            _ = sleep_for(deadline) => Flow::Failed(WorkflowError::WorkflowTimeout {
                timeout: deadline.unwrap_or_default(),
            }),
            flow = run.launch(definition.graph()) => flow,
        };
        run_token.cancel();

        let outcome = settle(flow);
        let trace = match &outcome {
            Err(error) => run.journal.into_inner().interrupt(error),
            Ok(_) => run.journal.into_inner().entries,
        };
        let context = run.ctx.snapshot().await;

        match outcome {
            Ok(None) => {
                info!(steps = trace.len(), "Workflow completed");
                WorkflowResult::completed(context, trace)
            }
            Ok(Some(suspension)) => {
                info!(signal = %suspension.signal_name, "Workflow suspended");
                WorkflowResult::suspended(suspension, context, trace)
            }
            Err(error) => {
                warn!(error = %error, "Workflow failed");
                let compensate = options.compensate.unwrap_or(self.compensate_on_failure);
                let mut result = WorkflowResult::failed(error, context, Vec::new());
                if compensate {
                    let ctx = run.ctx.with_cancellation(CancellationToken::new());
                    let (compensated, failures) =
                        compensate_completed(definition, &ctx, &options.history, &trace).await;
                    result.context = ctx.snapshot().await;
                    result.compensated = compensated;
                    result.compensation_failures = failures;
                }
                result.execution_trace = trace;
                result
            }
        }
    }
}

/// Outcome of the root node: `Ok(None)` when completed, `Ok(Some(_))` when suspended.
fn settle(flow: Flow) -> Result<Option<Suspension>, WorkflowError> {
    match flow {
        Flow::Continue => Ok(None),
        Flow::Suspended(suspension) => Ok(Some(suspension)),
        Flow::Failed(error) => Err(error),
        Flow::Halted => Err(WorkflowError::Configuration(
            "Workflow halted without a failed or suspended node".to_string(),
        )),
    }
}

async fn sleep_for(deadline: Option<Duration>) {
    match deadline {
        Some(duration) => sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Result of walking one node.
#[derive(Debug)]
enum Flow {
    Continue,
    Failed(WorkflowError),
    Suspended(Suspension),
    /// Not started because another branch already failed or suspended.
    Halted,
}

/// Why no further nodes start. Ordered so that a failure overrides a suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Halt {
    None = 0,
    Suspended = 1,
    Failed = 2,
}

impl Halt {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Halt::None,
            1 => Halt::Suspended,
            _ => Halt::Failed,
        }
    }
}

/// An attempt that has started but not yet recorded its result.
#[derive(Debug)]
struct InFlight {
    attempt: u32,
    started_at: chrono::DateTime<Utc>,
    start: Instant,
}

#[derive(Debug, Default)]
struct Journal {
    entries: Vec<StepExecutionTrace>,
    in_flight: HashMap<StepName, InFlight>,
}

impl Journal {
    /// Closes attempts abandoned by the workflow deadline or cancellation.
    fn interrupt(mut self, error: &WorkflowError) -> Vec<StepExecutionTrace> {
        let mut abandoned: Vec<_> = self.in_flight.drain().collect();
        abandoned.sort_by_key(|(_, attempt)| attempt.started_at);
        for (step_name, attempt) in abandoned {
            warn!(step = %step_name, attempt = attempt.attempt, error = %error, "Step interrupted");
            self.entries.push(StepExecutionTrace {
                step_name,
                kind: TraceKind::Step,
                attempt: attempt.attempt,
                result: StepResult::from_error(error.clone()),
                started_at: attempt.started_at,
                duration: attempt.start.elapsed(),
            });
        }
        self.entries
    }
}

struct Run<C>
where
    C: Send + 'static,
{
    ctx: StepContext<C>,
    journal: Mutex<Journal>,
    completed: HashSet<StepName>,
    consumed: HashSet<StepName>,
    expired: HashSet<String>,
    halt: AtomicU8,
    default_step_timeout: Duration,
}

impl<C> Run<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Runs `node` unless another branch already failed or suspended.
    fn node<'b>(&'b self, node: &'b Node<C>) -> BoxFuture<'b, Flow> {
        async move {
            if self.halt() != Halt::None {
                return Flow::Halted;
            }
            self.launch(node).await
        }
        .boxed()
    }

    /// Runs `node` unconditionally. Parallel branches are launched together.
    fn launch<'b>(&'b self, node: &'b Node<C>) -> BoxFuture<'b, Flow> {
        async move {
            let flow = match node {
                Node::Step(step) => self.step(step).await,
                Node::Sequence(children) => {
                    for child in children {
                        match self.node(child).await {
                            Flow::Continue => {}
                            other => return other,
                        }
                    }
                    Flow::Continue
                }
                Node::Conditional {
                    predicate,
                    then_branch,
                    else_branch,
                } => {
                    let take_then = {
                        let guard = self.ctx.lock().await;
                        predicate(&*guard)
                    };
                    debug!(take_then, "Conditional evaluated");
                    let branch = if take_then { then_branch } else { else_branch };
                    self.node(branch).await
                }
                Node::Parallel(branches) => {
                    let flows = join_all(branches.iter().map(|branch| self.launch(branch))).await;
                    aggregate(flows)
                }
                Node::Delay(duration) => {
                    tokio::select! {
                        _ = self.ctx.cancellation().cancelled() => Flow::Failed(WorkflowError::Cancelled),
                        _ = sleep(*duration) => Flow::Continue,
                    }
                }
                Node::Wait(wait) => self.wait(wait).await,
            };
            match flow {
                Flow::Failed(_) => self.halt_with(Halt::Failed),
                Flow::Suspended(_) => self.halt_with(Halt::Suspended),
                Flow::Continue | Flow::Halted => {}
            }
            flow
        }
        .boxed()
    }

    async fn step(&self, step: &Arc<dyn Step<C>>) -> Flow {
        let name = step.name();
        let config = step.config();
        if config.replay == Replay::SkipCompleted && self.completed.contains(&name) {
            debug!(step = %name, "Step already completed, skipping");
            return Flow::Continue;
        }

        let policy = &config.retry_policy;
        let step_timeout = config.timeout.unwrap_or(self.default_step_timeout);
        let mut attempt = 1;
        loop {
            let started_at = Utc::now();
            let start = Instant::now();
            let attempt_ctx = self.ctx.for_attempt(attempt);
            self.journal.lock().await.in_flight.insert(
                name.clone(),
                InFlight {
                    attempt,
                    started_at,
                    start,
                },
            );
            let result = match timeout(step_timeout, step.execute(&attempt_ctx)).await {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => StepResult::from_error(policy.map_error(&name, &*err)),
                Err(_) => StepResult::from_error(WorkflowError::StepTimeout {
                    step_name: name.clone(),
                    timeout: step_timeout,
                }),
            };
            self.record(StepExecutionTrace {
                step_name: name.clone(),
                kind: TraceKind::Step,
                attempt,
                result: result.clone(),
                started_at,
                duration: start.elapsed(),
            })
            .await;

            match result.outcome {
                StepOutcome::Success => {
                    info!(step = %name, attempt, "Step completed successfully");
                    return Flow::Continue;
                }
                StepOutcome::Suspended(suspension) => {
                    info!(step = %name, signal = %suspension.signal_name, "Step suspended");
                    return Flow::Suspended(suspension);
                }
                StepOutcome::Failure {
                    message,
                    should_retry,
                } => {
                    let retry = should_retry
                        && policy.allows_retry_after(attempt)
                        && self.halt() != Halt::Failed;
                    if retry {
                        let delay = policy.delay_after(attempt);
                        info!(
                            step = %name,
                            attempt,
                            max_attempts = policy.max_attempts(),
                            ?delay,
                            "Step failed, retrying"
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    warn!(step = %name, attempt, %message, "Step failed");
                    let error = match result.error {
                        Some(error) => (*error).clone(),
                        None => WorkflowError::StepExecution {
                            step_name: name,
                            details: message,
                            retryable: should_retry,
                        },
                    };
                    return Flow::Failed(error);
                }
            }
        }
    }

    async fn wait(&self, wait: &WaitNode<C>) -> Flow {
        let signal_name = StepName::new(wait.signal_name.as_str());
        if self.expired.contains(&wait.signal_name) {
            warn!(signal = %wait.signal_name, "Signal wait expired");
            return Flow::Failed(WorkflowError::StepTimeout {
                step_name: signal_name,
                timeout: wait.timeout.unwrap_or_default(),
            });
        }

        let Some(payload) = self.ctx.signal_payload(&wait.signal_name).cloned() else {
            return Flow::Suspended(Suspension {
                signal_name: wait.signal_name.clone(),
                timeout: wait.timeout,
                kind: wait.kind,
            });
        };

        let verdict = match wait.kind {
            SuspensionKind::Signal => Ok(()),
            SuspensionKind::Approval => approval_verdict(&signal_name, &payload),
        };
        if !self.consumed.contains(&signal_name) {
            let result = match &verdict {
                Ok(()) => StepResult::success(),
                Err(error) => StepResult::from_error(error.clone()),
            };
            self.record(StepExecutionTrace {
                step_name: signal_name.clone(),
                kind: TraceKind::Signal,
                attempt: 1,
                result: result.with_metadata("payload", payload),
                started_at: Utc::now(),
                duration: Duration::ZERO,
            })
            .await;
        }
        if let Err(error) = verdict {
            warn!(signal = %signal_name, "Approval rejected");
            return Flow::Failed(error);
        }

        debug!(signal = %signal_name, "Signal consumed");
        match &wait.consumer {
            Some(consumer) => self.step(consumer).await,
            None => Flow::Continue,
        }
    }

    async fn record(&self, entry: StepExecutionTrace) {
        let mut journal = self.journal.lock().await;
        journal.in_flight.remove(&entry.step_name);
        journal.entries.push(entry);
    }

    fn halt(&self) -> Halt {
        Halt::from_u8(self.halt.load(Ordering::SeqCst))
    }

    fn halt_with(&self, reason: Halt) {
        self.halt.fetch_max(reason as u8, Ordering::SeqCst);
    }
}

/// Failure beats suspension, suspension beats halted; ties go to the first branch.
fn aggregate(flows: Vec<Flow>) -> Flow {
    let mut suspended = None;
    let mut halted = false;
    for flow in flows {
        match flow {
            Flow::Failed(error) => return Flow::Failed(error),
            Flow::Suspended(suspension) => {
                if suspended.is_none() {
                    suspended = Some(suspension);
                }
            }
            Flow::Halted => halted = true,
            Flow::Continue => {}
        }
    }
    match suspended {
        Some(suspension) => Flow::Suspended(suspension),
        None if halted => Flow::Halted,
        None => Flow::Continue,
    }
}

/// Reads an approval payload: `true`/`false`, or `{"approved": bool, "comment": ..}`.
fn approval_verdict(name: &StepName, payload: &Value) -> Result<(), WorkflowError> {
    let (approved, comment) = match payload {
        Value::Bool(approved) => (*approved, None),
        Value::Object(map) => match map.get("approved").and_then(Value::as_bool) {
            Some(approved) => (approved, map.get("comment").and_then(Value::as_str)),
            None => return Err(invalid_decision(name)),
        },
        _ => return Err(invalid_decision(name)),
    };
    if approved {
        return Ok(());
    }
    Err(WorkflowError::StepExecution {
        step_name: name.clone(),
        details: match comment {
            Some(comment) => format!("approval rejected: {comment}"),
            None => "approval rejected".to_string(),
        },
        retryable: false,
    })
}

fn invalid_decision(name: &StepName) -> WorkflowError {
    WorkflowError::Configuration(format!(
        "Approval '{name}' expects a boolean or an object with an 'approved' field"
    ))
}

/// Runs compensations for every completed step, latest completion first.
async fn compensate_completed<C>(
    definition: &WorkflowDefinition<C>,
    ctx: &StepContext<C>,
    history: &[StepExecutionTrace],
    trace: &[StepExecutionTrace],
) -> (Vec<StepName>, Vec<CompensationFailure>)
where
    C: Send + 'static,
{
    let mut order: Vec<&StepName> = Vec::new();
    for entry in history.iter().chain(trace).filter(|e| e.is_completed_step()) {
        order.retain(|name| *name != &entry.step_name);
        order.push(&entry.step_name);
    }

    let mut compensated = Vec::new();
    let mut failures = Vec::new();
    for name in order.into_iter().rev() {
        let Some(step) = definition.step(name.as_str()) else {
            warn!(step = %name, "No step to compensate in this definition version");
            continue;
        };
        info!(step = %name, "Compensating step");
        match step.compensate(ctx).await {
            Ok(()) => compensated.push(name.clone()),
            Err(err) => {
                warn!(step = %name, error = %err, "Compensation failed");
                failures.push(CompensationFailure {
                    step_name: name.clone(),
                    message: err.to_string(),
                });
            }
        }
    }
    (compensated, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sagaflow_core::{define_step, BoxError, RetryPolicy, StepConfig};
    use std::sync::atomic::AtomicU32;

    define_step!(Increment);
    define_step!(Boom);

    #[async_trait]
    impl Step<u32> for Increment {
        async fn execute(&self, ctx: &StepContext<u32>) -> Result<StepResult, BoxError> {
            *ctx.lock().await += 1;
            Ok(StepResult::success())
        }
    }

    #[async_trait]
    impl Step<u32> for Boom {
        async fn execute(&self, _ctx: &StepContext<u32>) -> Result<StepResult, BoxError> {
            Err("boom".into())
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl Step<u32> for Slow {
        async fn execute(&self, _ctx: &StepContext<u32>) -> Result<StepResult, BoxError> {
            sleep(self.0).await;
            Ok(StepResult::success())
        }

        fn name(&self) -> StepName {
            StepName::new("Slow")
        }

        fn config(&self) -> StepConfig {
            StepConfig {
                timeout: Some(Duration::from_millis(20)),
                ..StepConfig::default()
            }
        }
    }

    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    #[async_trait]
    impl Step<u32> for Flaky {
        async fn execute(&self, _ctx: &StepContext<u32>) -> Result<StepResult, BoxError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(StepResult::success())
            } else {
                Ok(StepResult::failure(format!("attempt {call} failed")))
            }
        }

        fn name(&self) -> StepName {
            StepName::new("Flaky")
        }

        fn config(&self) -> StepConfig {
            StepConfig {
                retry_policy: RetryPolicy::fixed(3, Duration::from_millis(1)),
                ..StepConfig::default()
            }
        }
    }

    async fn run(definition: &WorkflowDefinition<u32>, options: ExecutionOptions) -> WorkflowResult<u32> {
        WorkflowEngine::new()
            .execute(definition, 0, options, CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_sequence_runs_in_order() {
        let definition = WorkflowDefinition::builder("seq")
            .graph(Node::sequence([Node::step(Increment), Node::delay(Duration::from_millis(1))]))
            .build()
            .expect("valid workflow");
        let result = run(&definition, ExecutionOptions::new()).await;
        assert!(result.is_success());
        assert_eq!(result.context, 1);
        assert_eq!(result.step_attempts(), 1);
    }

    #[tokio::test]
    async fn test_error_is_mapped_to_failure() {
        let definition = WorkflowDefinition::builder("boom")
            .graph(Node::sequence([Node::step(Boom), Node::step(Increment)]))
            .build()
            .expect("valid workflow");
        let result = run(&definition, ExecutionOptions::new()).await;
        assert!(result.is_failure());
        assert_eq!(result.error_message(), Some("Step failed: Boom, details: boom"));
        assert_eq!(result.context, 0);
        assert_eq!(result.step_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let definition = WorkflowDefinition::builder("flaky")
            .graph(Node::step(Flaky {
                calls: Arc::clone(&calls),
                succeed_on: 2,
            }))
            .build()
            .expect("valid workflow");
        let result = run(&definition, ExecutionOptions::new()).await;
        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let attempts: Vec<u32> = result.execution_trace.iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let definition = WorkflowDefinition::builder("slow")
            .graph(Node::step(Slow(Duration::from_millis(200))))
            .build()
            .expect("valid workflow");
        let result = run(&definition, ExecutionOptions::new()).await;
        assert!(matches!(result.error(), Some(WorkflowError::StepTimeout { .. })));
        assert_eq!(result.step_attempts(), 1);
    }

    #[tokio::test]
    async fn test_workflow_timeout_fails_execution() {
        let definition = WorkflowDefinition::builder("deadline")
            .timeout(Duration::from_millis(10))
            .graph(Node::delay(Duration::from_secs(5)))
            .build()
            .expect("valid workflow");
        let result = run(&definition, ExecutionOptions::new()).await;
        assert!(matches!(
            result.error(),
            Some(WorkflowError::WorkflowTimeout { timeout }) if *timeout == Duration::from_millis(10)
        ));
    }

    #[tokio::test]
    async fn test_cancellation_fails_execution() {
        let definition = WorkflowDefinition::builder("cancel")
            .graph(Node::delay(Duration::from_secs(5)))
            .build()
            .expect("valid workflow");
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });
        let result = WorkflowEngine::new()
            .execute(&definition, 0, ExecutionOptions::new(), token)
            .await;
        assert_eq!(result.error(), Some(&WorkflowError::Cancelled));
    }

    #[tokio::test]
    async fn test_conditional_picks_one_branch() {
        let definition = WorkflowDefinition::builder("cond")
            .graph(Node::if_else(
                |value: &u32| *value == 0,
                Node::step(Increment),
                Node::step(Boom),
            ))
            .build()
            .expect("valid workflow");
        let result = run(&definition, ExecutionOptions::new()).await;
        assert!(result.is_success());
        assert_eq!(result.context, 1);
    }

    #[tokio::test]
    async fn test_wait_suspends_then_consumes() {
        let definition = WorkflowDefinition::builder("wait")
            .graph(Node::sequence([
                Node::wait_for_signal("go", Some(Duration::from_secs(60))),
                Node::step(Increment),
            ]))
            .build()
            .expect("valid workflow");

        let first = run(&definition, ExecutionOptions::new()).await;
        assert_eq!(first.suspended_signal_name(), Some("go"));
        assert_eq!(first.context, 0);

        let signals = HashMap::from([("go".to_string(), Value::Bool(true))]);
        let second = run(&definition, ExecutionOptions::new().signals(signals)).await;
        assert!(second.is_success());
        assert_eq!(second.context, 1);
        assert_eq!(second.execution_trace[0].kind, TraceKind::Signal);
    }

    #[tokio::test]
    async fn test_expired_wait_fails() {
        let definition = WorkflowDefinition::<u32>::builder("expired")
            .graph(Node::wait_for_signal("go", Some(Duration::from_secs(1))))
            .build()
            .expect("valid workflow");
        let options = ExecutionOptions::new().expired_signals(["go".to_string()]);
        let result = run(&definition, options).await;
        assert!(matches!(result.error(), Some(WorkflowError::StepTimeout { .. })));
    }

    #[test]
    fn test_aggregate_precedence() {
        let failed = aggregate(vec![
            Flow::Suspended(Suspension::signal("a", None)),
            Flow::Failed(WorkflowError::Cancelled),
        ]);
        assert!(matches!(failed, Flow::Failed(WorkflowError::Cancelled)));

        let suspended = aggregate(vec![Flow::Halted, Flow::Suspended(Suspension::signal("b", None))]);
        assert!(matches!(suspended, Flow::Suspended(s) if s.signal_name == "b"));

        assert!(matches!(aggregate(vec![Flow::Continue, Flow::Halted]), Flow::Halted));
        assert!(matches!(aggregate(vec![Flow::Continue]), Flow::Continue));
    }

    #[test]
    fn test_root_never_completes_when_halted() {
        assert!(matches!(settle(Flow::Continue), Ok(None)));
        assert!(matches!(
            settle(Flow::Suspended(Suspension::signal("a", None))),
            Ok(Some(s)) if s.signal_name == "a"
        ));
        assert!(matches!(settle(Flow::Halted), Err(WorkflowError::Configuration(_))));
    }

    #[test]
    fn test_approval_verdicts() {
        let name = StepName::new("manager");
        assert!(approval_verdict(&name, &Value::Bool(true)).is_ok());
        let rejected = approval_verdict(&name, &serde_json::json!({"approved": false, "comment": "too expensive"}));
        assert!(matches!(
            rejected,
            Err(WorkflowError::StepExecution { details, retryable: false, .. }) if details == "approval rejected: too expensive"
        ));
        assert!(matches!(
            approval_verdict(&name, &serde_json::json!("yes")),
            Err(WorkflowError::Configuration(_))
        ));
    }
}
