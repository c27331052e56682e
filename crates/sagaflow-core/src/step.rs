//! Step trait and related types.

use crate::context::StepContext;
use crate::error::{BoxError, WorkflowError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Type-safe step name wrapper.
///
/// Step names double as the step's identity inside a definition, so they
/// must be unique within one workflow graph.
///
/// # Examples
///
/// ```
/// use sagaflow_core::StepName;
///
/// let name = StepName::new("ReserveStock");
/// assert_eq!(name.as_str(), "ReserveStock");
///
/// let name: StepName = "ChargeCard".into();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates a StepName from a type's name (extracts last segment).
    pub fn from_type_name<T: ?Sized>() -> Self {
        let full_name = std::any::type_name::<T>();
        let short_name = full_name.rsplit("::").next().unwrap_or("UnknownStep");
        Self::new(short_name)
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Whether a step already completed in an earlier run executes again on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Replay {
    /// Skip the step if the instance history records a successful completion.
    #[default]
    SkipCompleted,
    /// Execute the step on every pass; the step must be idempotent.
    Always,
}

/// Configuration for a workflow step.
///
/// # Examples
///
/// ```
/// use sagaflow_core::{StepConfig, RetryPolicy};
/// use std::time::Duration;
///
/// let config = StepConfig {
///     timeout: Some(Duration::from_secs(60)),
///     retry_policy: RetryPolicy::fixed(3, Duration::from_secs(1)),
///     ..StepConfig::default()
/// };
/// assert_eq!(config.retry_policy.max_attempts(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct StepConfig {
    /// Maximum time allowed for one attempt. `None` uses the engine's
    /// default step timeout (30 seconds unless configured).
    pub timeout: Option<Duration>,
    /// Retry policy when the step fails. Default: a single attempt.
    pub retry_policy: RetryPolicy,
    /// Resume behaviour. Default: skip if already completed.
    pub replay: Replay,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            retry_policy: RetryPolicy::none(),
            replay: Replay::SkipCompleted,
        }
    }
}

/// Whether a suspension waits for a plain signal or for an approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    /// Waiting for a named signal.
    Signal,
    /// Waiting for a human approval decision.
    Approval,
}

/// The engine's request to pause execution until a named signal arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    /// Name of the awaited signal.
    pub signal_name: String,
    /// How long to wait before the wait counts as timed out.
    pub timeout: Option<Duration>,
    /// Signal or approval.
    pub kind: SuspensionKind,
}

impl Suspension {
    /// Suspension waiting for a signal.
    pub fn signal(signal_name: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            signal_name: signal_name.into(),
            timeout,
            kind: SuspensionKind::Signal,
        }
    }

    /// Suspension waiting for an approval.
    pub fn approval(signal_name: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            signal_name: signal_name.into(),
            timeout,
            kind: SuspensionKind::Approval,
        }
    }
}

/// What happened when a step ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step completed.
    Success,
    /// The step failed.
    Failure {
        /// Human readable failure description.
        message: String,
        /// Whether the engine may try again.
        should_retry: bool,
    },
    /// The step asked the workflow to wait for a signal.
    Suspended(Suspension),
}

/// Outcome of one step attempt, plus free-form metadata.
///
/// # Examples
///
/// ```
/// use sagaflow_core::StepResult;
///
/// let ok = StepResult::success().with_metadata("rows", 42);
/// assert!(ok.is_success());
///
/// let failed = StepResult::permanent_failure("card declined");
/// assert!(!failed.should_retry());
/// assert_eq!(failed.error_message(), Some("card declined"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// The outcome variant.
    pub outcome: StepOutcome,
    /// Annotations produced by the step.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// The typed error behind a failure, if any. Not persisted.
    #[serde(skip)]
    pub error: Option<Arc<WorkflowError>>,
}

impl StepResult {
    /// A successful result.
    pub fn success() -> Self {
        Self::from_outcome(StepOutcome::Success)
    }

    /// A failure the engine may retry.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::from_outcome(StepOutcome::Failure {
            message: message.into(),
            should_retry: true,
        })
    }

    /// A failure that must not be retried.
    pub fn permanent_failure(message: impl Into<String>) -> Self {
        Self::from_outcome(StepOutcome::Failure {
            message: message.into(),
            should_retry: false,
        })
    }

    /// A result that suspends the workflow.
    pub fn suspended(suspension: Suspension) -> Self {
        Self::from_outcome(StepOutcome::Suspended(suspension))
    }

    /// A failure derived from a typed error.
    pub fn from_error(error: WorkflowError) -> Self {
        let mut result = Self::from_outcome(StepOutcome::Failure {
            message: error.to_string(),
            should_retry: error.is_retryable(),
        });
        result.error = Some(Arc::new(error));
        result
    }

    fn from_outcome(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            metadata: HashMap::new(),
            error: None,
        }
    }

    /// Attaches a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns `true` for [`StepOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StepOutcome::Success)
    }

    /// Returns `true` for [`StepOutcome::Failure`].
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, StepOutcome::Failure { .. })
    }

    /// Returns the suspension request, if any.
    pub fn suspension(&self) -> Option<&Suspension> {
        match &self.outcome {
            StepOutcome::Suspended(suspension) => Some(suspension),
            _ => None,
        }
    }

    /// Returns the failure message, if any.
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            StepOutcome::Failure { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Returns `true` if this is a retryable failure.
    pub fn should_retry(&self) -> bool {
        matches!(
            self.outcome,
            StepOutcome::Failure {
                should_retry: true,
                ..
            }
        )
    }
}

/// A workflow step that can be executed asynchronously.
///
/// Each step receives a [`StepContext`] giving locked access to the shared
/// workflow context, the cancellation token and any delivered signal
/// payloads. Steps running in different branches of a `Parallel` node share
/// the same context; they must write disjoint fields or coordinate through
/// the context lock themselves.
///
/// # Examples
///
/// ```
/// use sagaflow_core::{define_step, BoxError, Step, StepContext, StepResult};
/// use async_trait::async_trait;
///
/// define_step!(IncrementStep);
///
/// #[async_trait]
/// impl Step<u32> for IncrementStep {
///     async fn execute(&self, ctx: &StepContext<u32>) -> Result<StepResult, BoxError> {
///         *ctx.lock().await += 1;
///         Ok(StepResult::success())
///     }
/// }
/// ```
#[async_trait]
pub trait Step<C>: Send + Sync
where
    C: Send + 'static,
{
    /// Executes one attempt of the step.
    ///
    /// An `Err` is treated like a failure: it is mapped through the retry
    /// policy's error mapper and may be retried.
    async fn execute(&self, ctx: &StepContext<C>) -> Result<StepResult, BoxError>;

    /// Returns the step name.
    ///
    /// By default, uses the type name. Override to provide a custom name.
    fn name(&self) -> StepName {
        StepName::from_type_name::<Self>()
    }

    /// Returns the step configuration.
    fn config(&self) -> StepConfig {
        StepConfig::default()
    }

    /// Undoes the step's side effects after a later failure.
    ///
    /// Called only for steps that completed successfully, in reverse
    /// completion order. Default implementation does nothing.
    async fn compensate(&self, _ctx: &StepContext<C>) -> Result<(), BoxError> {
        Ok(())
    }
}
