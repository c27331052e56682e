//! Retry policy for step execution.

use crate::error::WorkflowError;
use crate::step::StepName;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;
type ErrorMapper = Arc<dyn Fn(&StepName, &(dyn std::error::Error + 'static)) -> WorkflowError + Send + Sync>;

/// Computes the wait before the next attempt from the number of the attempt
/// that just failed (1-based).
#[derive(Clone, Default)]
pub enum DelayStrategy {
    /// Retry immediately.
    #[default]
    Immediate,
    /// Constant delay between attempts.
    Fixed(Duration),
    /// `min(base * 2^(attempt - 1), max)`.
    Exponential {
        /// Delay after the first failed attempt.
        base: Duration,
        /// Upper bound on any single delay.
        max: Duration,
    },
    /// Caller-supplied function of the attempt number.
    Custom(DelayFn),
}

impl DelayStrategy {
    /// Exponential backoff with a cap.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        DelayStrategy::Exponential { base, max }
    }

    /// Wraps a closure.
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        DelayStrategy::Custom(Arc::new(f))
    }

    /// Delay to wait after `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            DelayStrategy::Immediate => Duration::ZERO,
            DelayStrategy::Fixed(delay) => *delay,
            DelayStrategy::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(31);
                let factor = 1u32 << exponent;
                base.checked_mul(factor).unwrap_or(*max).min(*max)
            }
            DelayStrategy::Custom(f) => f(attempt),
        }
    }
}

impl fmt::Debug for DelayStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayStrategy::Immediate => write!(f, "Immediate"),
            DelayStrategy::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            DelayStrategy::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            DelayStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Error returned when [`RetryPolicy`] configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyError(pub &'static str);

impl fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryPolicyError {}

/// How often a failed step is attempted, how long to wait in between,
/// and how step errors are classified.
///
/// The policy is pure: the engine asks it for a delay once per failed
/// attempt and never goes beyond [`max_attempts`](Self::max_attempts).
///
/// # Examples
///
/// ```
/// use sagaflow_core::{DelayStrategy, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(5, Duration::from_millis(100));
/// assert_eq!(policy.max_attempts(), 5);
///
/// // Delays: 100ms, 200ms, 400ms, 800ms
/// assert_eq!(policy.delay_after(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_after(3), Duration::from_millis(400));
///
/// assert!(RetryPolicy::create(0, DelayStrategy::Immediate).is_err());
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: DelayStrategy,
    error_mapper: Option<ErrorMapper>,
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` counts the first attempt and must be positive.
    pub fn create(max_attempts: u32, delay: DelayStrategy) -> Result<Self, RetryPolicyError> {
        if max_attempts == 0 {
            return Err(RetryPolicyError("max_attempts must be greater than 0"));
        }
        if let DelayStrategy::Exponential { base, max } = &delay {
            if max < base {
                return Err(RetryPolicyError("max delay must be >= base delay"));
            }
        }
        Ok(Self {
            max_attempts,
            delay,
            error_mapper: None,
        })
    }

    /// A single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: DelayStrategy::Immediate,
            error_mapper: None,
        }
    }

    /// Fixed delay between attempts. A zero `max_attempts` is raised to one.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: DelayStrategy::Fixed(delay),
            error_mapper: None,
        }
    }

    /// Exponential backoff capped at 60 seconds. A zero `max_attempts` is raised to one.
    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: DelayStrategy::exponential(base, Duration::from_secs(60).max(base)),
            error_mapper: None,
        }
    }

    /// Installs a mapper converting errors returned by the step body into
    /// typed workflow errors. The mapped error's
    /// [`is_retryable`](WorkflowError::is_retryable) decides whether to retry.
    pub fn with_error_mapper(
        mut self,
        mapper: impl Fn(&StepName, &(dyn std::error::Error + 'static)) -> WorkflowError
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.error_mapper = Some(Arc::new(mapper));
        self
    }

    /// Total number of attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The configured delay strategy.
    pub fn delay_strategy(&self) -> &DelayStrategy {
        &self.delay
    }

    /// Delay to wait after attempt `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.delay.delay_for(attempt)
    }

    /// Returns `true` if another attempt may follow attempt `attempt`.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Maps an error returned by a step body into a typed error.
    ///
    /// Without a mapper every error becomes a retryable
    /// [`WorkflowError::StepExecution`], unless it already is a
    /// [`WorkflowError`], in which case it is kept.
    pub fn map_error(
        &self,
        step_name: &StepName,
        error: &(dyn std::error::Error + 'static),
    ) -> WorkflowError {
        if let Some(mapper) = &self.error_mapper {
            return mapper(step_name, error);
        }
        match error.downcast_ref::<WorkflowError>() {
            Some(typed) => typed.clone(),
            None => WorkflowError::step(step_name.clone(), error.to_string()),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("error_mapper", &self.error_mapper.is_some())
            .finish()
    }
}
