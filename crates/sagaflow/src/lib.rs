//! A durable workflow engine for Rust.
//!
//! Workflows are immutable graphs of steps, waits and delays. The
//! [`WorkflowEngine`] walks a graph against a context in memory; the
//! [`PersistentWorkflowEngine`] adds persisted instances that suspend on
//! signals, resume after a restart and compensate completed steps when a
//! later one fails.
//!
//! # Example
//!
//! ```rust
//! use sagaflow::prelude::*;
//! use async_trait::async_trait;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Order {
//!     reserved: bool,
//!     shipped: bool,
//! }
//!
//! impl WorkflowContext for Order {}
//!
//! define_step!(Reserve);
//! define_step!(Ship);
//!
//! #[async_trait]
//! impl Step<Order> for Reserve {
//!     async fn execute(&self, ctx: &StepContext<Order>) -> Result<StepResult, BoxError> {
//!         ctx.lock().await.reserved = true;
//!         Ok(StepResult::success())
//!     }
//! }
//!
//! #[async_trait]
//! impl Step<Order> for Ship {
//!     async fn execute(&self, ctx: &StepContext<Order>) -> Result<StepResult, BoxError> {
//!         ctx.lock().await.shipped = true;
//!         Ok(StepResult::success())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let registry = Arc::new(DefinitionRegistry::new());
//! let definition = registry.register(
//!     WorkflowDefinition::builder("order")
//!         .graph(Node::sequence([
//!             Node::step(Reserve),
//!             Node::wait_for_signal("paid", None),
//!             Node::step(Ship),
//!         ]))
//!         .build()
//!         .expect("valid workflow"),
//! );
//!
//! let engine = PersistentWorkflowEngine::builder(Arc::new(InMemoryWorkflowStateRepository::new()))
//!     .registry(registry)
//!     .build();
//!
//! let (id, result) = engine
//!     .start_persistent_workflow(definition, Order::default())
//!     .await
//!     .expect("started");
//! assert_eq!(result.suspended_signal_name(), Some("paid"));
//! assert!(engine.signal_workflow(&id, "paid", serde_json::json!(true)).await);
//! # });
//! ```

pub mod config;
mod coordinator;
mod engine;
pub mod logging;
mod memory;
mod notification;
mod persistent;
mod registry;
mod signal;

// Re-export core types
pub use sagaflow_core::*;

pub use config::{ConfigError, EngineConfig, LogConfig, LogFormat};
pub use coordinator::WorkflowStateCoordinator;
pub use engine::{ExecutionOptions, WorkflowEngine};
pub use memory::InMemoryWorkflowStateRepository;
pub use notification::{NoopNotificationService, TracingNotificationService};
pub use persistent::{PersistentWorkflowEngine, PersistentWorkflowEngineBuilder};
pub use registry::DefinitionRegistry;
pub use signal::{Delivery, ResumeCallback, SignalHandler};
pub use tokio_util::sync::CancellationToken;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        define_step, BoxError, CancellationToken, DefinitionRegistry, DelayStrategy,
        EngineConfig, ExecutionOptions, InMemoryWorkflowStateRepository, Node,
        PersistentWorkflowEngine, Replay, RetryPolicy, Step, StepConfig, StepContext, StepName,
        StepResult, Suspension, WorkflowContext, WorkflowDefinition, WorkflowEngine,
        WorkflowError, WorkflowInstanceId, WorkflowResult, WorkflowStatus,
    };
}
