//! Execution trace and workflow results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CompensationFailure, WorkflowError};
use crate::step::{StepName, StepResult, Suspension};

/// What produced a trace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// An attempt of a `Step` node (or a signal consumer step).
    Step,
    /// Consumption of a delivered signal by a `WaitForSignal`/`WaitForApproval` node.
    Signal,
}

/// One step attempt.
///
/// Traces are append-only and ordered by execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionTrace {
    /// Step name, or signal name for [`TraceKind::Signal`].
    pub step_name: StepName,
    /// Entry kind.
    pub kind: TraceKind,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Outcome of the attempt.
    pub result: StepResult,
    /// When the attempt began.
    pub started_at: DateTime<Utc>,
    /// How long the attempt took.
    pub duration: Duration,
}

impl PartialEq for StepExecutionTrace {
    fn eq(&self, other: &Self) -> bool {
        self.step_name == other.step_name
            && self.kind == other.kind
            && self.attempt == other.attempt
            && self.result.outcome == other.result.outcome
            && self.result.metadata == other.result.metadata
            && self.started_at == other.started_at
            && self.duration == other.duration
    }
}

impl StepExecutionTrace {
    /// Returns `true` for a successful `Step` attempt.
    pub fn is_completed_step(&self) -> bool {
        self.kind == TraceKind::Step && self.result.is_success()
    }
}

/// Terminal classification of one execution.
#[derive(Debug, Clone)]
pub enum WorkflowOutcome {
    /// Every node completed.
    Completed,
    /// A node failed, the deadline passed or the execution was cancelled.
    Failed {
        /// Failure description.
        message: String,
        /// The typed error, if known.
        error: Option<Arc<WorkflowError>>,
    },
    /// Execution paused waiting for a signal.
    Suspended(Suspension),
}

/// Result of executing a workflow definition against a context.
#[derive(Debug, Clone)]
pub struct WorkflowResult<C> {
    /// How the execution ended.
    pub outcome: WorkflowOutcome,
    /// The context after the execution.
    pub context: C,
    /// Attempts recorded during the execution.
    pub execution_trace: Vec<StepExecutionTrace>,
    /// Steps compensated after a failure, in the order compensation ran.
    pub compensated: Vec<StepName>,
    /// Compensations that failed.
    pub compensation_failures: Vec<CompensationFailure>,
}

impl<C> WorkflowResult<C> {
    /// A completed result.
    pub fn completed(context: C, execution_trace: Vec<StepExecutionTrace>) -> Self {
        Self::with_outcome(WorkflowOutcome::Completed, context, execution_trace)
    }

    /// A failed result.
    pub fn failed(
        error: WorkflowError,
        context: C,
        execution_trace: Vec<StepExecutionTrace>,
    ) -> Self {
        Self::with_outcome(
            WorkflowOutcome::Failed {
                message: error.to_string(),
                error: Some(Arc::new(error)),
            },
            context,
            execution_trace,
        )
    }

    /// A suspended result.
    pub fn suspended(
        suspension: Suspension,
        context: C,
        execution_trace: Vec<StepExecutionTrace>,
    ) -> Self {
        Self::with_outcome(
            WorkflowOutcome::Suspended(suspension),
            context,
            execution_trace,
        )
    }

    /// Builds a result from any outcome.
    pub fn with_outcome(
        outcome: WorkflowOutcome,
        context: C,
        execution_trace: Vec<StepExecutionTrace>,
    ) -> Self {
        Self {
            outcome,
            context,
            execution_trace,
            compensated: Vec::new(),
            compensation_failures: Vec::new(),
        }
    }

    /// Returns `true` if every node completed.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, WorkflowOutcome::Completed)
    }

    /// Returns `true` if the execution is waiting for a signal.
    pub fn is_suspended(&self) -> bool {
        matches!(self.outcome, WorkflowOutcome::Suspended(_))
    }

    /// Returns `true` if the execution failed.
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, WorkflowOutcome::Failed { .. })
    }

    /// Name of the awaited signal when suspended.
    pub fn suspended_signal_name(&self) -> Option<&str> {
        match &self.outcome {
            WorkflowOutcome::Suspended(suspension) => Some(&suspension.signal_name),
            _ => None,
        }
    }

    /// Failure description when failed.
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            WorkflowOutcome::Failed { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Typed error when failed.
    pub fn error(&self) -> Option<&WorkflowError> {
        match &self.outcome {
            WorkflowOutcome::Failed { error, .. } => error.as_deref(),
            _ => None,
        }
    }

    /// Number of trace entries produced by `Step` attempts.
    pub fn step_attempts(&self) -> usize {
        self.execution_trace
            .iter()
            .filter(|entry| entry.kind == TraceKind::Step)
            .count()
    }

    /// Converts the context, keeping everything else.
    pub fn map_context<D>(self, f: impl FnOnce(C) -> D) -> WorkflowResult<D> {
        WorkflowResult {
            outcome: self.outcome,
            context: f(self.context),
            execution_trace: self.execution_trace,
            compensated: self.compensated,
            compensation_failures: self.compensation_failures,
        }
    }
}
