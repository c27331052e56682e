//! Core traits and types for the sagaflow workflow engine.
//!
//! This crate holds the value types and the step contract without any
//! executor. Library authors depend on it to implement custom steps,
//! repositories and notifiers.
//!
//! # Core Types
//!
//! - [`Step`] - The core trait for workflow steps, with optional compensation
//! - [`StepResult`] - Outcome of one attempt: success, failure or suspension
//! - [`StepContext`] - Shared access to the workflow context from a step
//! - [`RetryPolicy`] - Attempt limit, backoff and error classification
//! - [`WorkflowDefinition`] - Immutable graph of [`Node`]s
//! - [`WorkflowResult`] - Outcome of a whole execution, with its trace
//! - [`WorkflowInstanceState`] - The persisted record of one instance
//! - [`WorkflowError`] - Error types for workflow execution
//!
//! # Ports
//!
//! - [`WorkflowStateRepository`] - Durable key-value store for instance state
//! - [`WorkflowNotificationService`] - Completion and error callbacks

mod context;
mod definition;
mod error;
mod ports;
mod result;
mod retry;
mod state;
mod step;

pub use context::{StepContext, WorkflowContext};
pub use definition::{Node, Predicate, WaitNode, WorkflowDefinition, WorkflowDefinitionBuilder};
pub use error::{BoxError, CompensationFailure, WorkflowError};
pub use ports::{WorkflowNotificationService, WorkflowStateRepository};
pub use result::{StepExecutionTrace, TraceKind, WorkflowOutcome, WorkflowResult};
pub use retry::{DelayStrategy, RetryPolicy, RetryPolicyError};
pub use state::{
    signal_metadata_key, signal_timeout_metadata_key, DefinitionDescriptor,
    StoredWorkflowState, WorkflowInstanceId, WorkflowInstanceState, WorkflowStateInfo,
    WorkflowStatus, CANCELLATION_REASON_KEY, CANCELLED_AT_KEY, COMPENSATION_FAILURES_KEY,
    FAILURE_REASON_KEY, LAST_ERROR_KEY,
};
pub use step::{
    Replay, Step, StepConfig, StepName, StepOutcome, StepResult, Suspension, SuspensionKind,
};

/// Defines a unit struct usable as a step, with a `NAME` constant.
///
/// ```
/// sagaflow_core::define_step!(ChargeCard);
///
/// assert_eq!(ChargeCard::NAME, "ChargeCard");
/// ```
#[macro_export]
macro_rules! define_step {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl $name {
            /// Step name as a compile-time constant
            #[allow(dead_code)]
            pub const NAME: &'static str = stringify!($name);
        }

        impl Default for $name {
            fn default() -> Self {
                Self
            }
        }
    };
}
