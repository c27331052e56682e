//! Workflow context handed to steps.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::state::WorkflowInstanceId;

/// User-defined data a workflow runs against.
///
/// The context is persisted between suspensions, so it must round-trip
/// through serde. [`context_type`](Self::context_type) names the type when
/// looking definitions back up after a restart; the default uses
/// [`std::any::type_name`], which is stable for one build. Override it if
/// persisted instances must survive renames or compiler upgrades.
///
/// # Examples
///
/// ```
/// use sagaflow_core::WorkflowContext;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct OrderContext {
///     order_id: String,
///     charged: bool,
/// }
///
/// impl WorkflowContext for OrderContext {
///     fn context_type() -> &'static str {
///         "order-context/v1"
///     }
/// }
///
/// assert_eq!(OrderContext::context_type(), "order-context/v1");
/// ```
pub trait WorkflowContext: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable identity of the context type.
    fn context_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl WorkflowContext for Value {
    fn context_type() -> &'static str {
        "json"
    }
}

/// What a step sees while it runs.
///
/// Clones share the same underlying context, so parallel branches observe
/// each other's writes. Hold the guard returned by [`lock`](Self::lock)
/// only for short critical sections.
pub struct StepContext<C> {
    data: Arc<Mutex<C>>,
    signals: Arc<HashMap<String, Value>>,
    instance_id: Option<WorkflowInstanceId>,
    cancellation: CancellationToken,
    attempt: u32,
}

impl<C> Clone for StepContext<C> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            signals: Arc::clone(&self.signals),
            instance_id: self.instance_id.clone(),
            cancellation: self.cancellation.clone(),
            attempt: self.attempt,
        }
    }
}

impl<C> fmt::Debug for StepContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("instance_id", &self.instance_id)
            .field("signals", &self.signals.keys().collect::<Vec<_>>())
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

impl<C> StepContext<C> {
    /// Creates a context for one execution.
    pub fn new(
        data: C,
        signals: HashMap<String, Value>,
        instance_id: Option<WorkflowInstanceId>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
            signals: Arc::new(signals),
            instance_id,
            cancellation,
            attempt: 1,
        }
    }

    /// Creates a standalone context, mainly for exercising a step directly.
    pub fn detached(data: C) -> Self {
        Self::new(data, HashMap::new(), None, CancellationToken::new())
    }

    /// Locks the shared context.
    pub async fn lock(&self) -> MutexGuard<'_, C> {
        self.data.lock().await
    }

    /// Payload of a delivered signal, if it has arrived.
    pub fn signal_payload(&self, signal_name: &str) -> Option<&Value> {
        self.signals.get(signal_name)
    }

    /// All delivered signal payloads keyed by signal name.
    pub fn signals(&self) -> &HashMap<String, Value> {
        &self.signals
    }

    /// The persistent instance this execution belongs to, if any.
    pub fn instance_id(&self) -> Option<&WorkflowInstanceId> {
        self.instance_id.as_ref()
    }

    /// Token cancelled when the caller cancels or the workflow deadline passes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The current attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Copy of this context for a specific attempt.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        let mut ctx = self.clone();
        ctx.attempt = attempt;
        ctx
    }

    /// Copy of this context observing a different cancellation token.
    pub fn with_cancellation(&self, cancellation: CancellationToken) -> Self {
        let mut ctx = self.clone();
        ctx.cancellation = cancellation;
        ctx
    }
}

impl<C: Clone> StepContext<C> {
    /// Clones the current context value out of the lock.
    pub async fn snapshot(&self) -> C {
        self.data.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_clones_share_data() {
        let ctx = StepContext::detached(0u32);
        let other = ctx.for_attempt(2);

        *other.lock().await += 5;

        assert_eq!(ctx.snapshot().await, 5);
        assert_eq!(ctx.attempt(), 1);
        assert_eq!(other.attempt(), 2);
    }

    #[test]
    fn test_signal_lookup() {
        let mut signals = HashMap::new();
        signals.insert("ok".to_string(), json!(true));
        let ctx = StepContext::new((), signals, None, CancellationToken::new());

        assert_eq!(ctx.signal_payload("ok"), Some(&json!(true)));
        assert_eq!(ctx.signal_payload("missing"), None);
    }

    #[test]
    fn test_json_context_type() {
        assert_eq!(<Value as WorkflowContext>::context_type(), "json");
    }
}
