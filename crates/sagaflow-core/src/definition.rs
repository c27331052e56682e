//! Declarative workflow graphs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::state::DefinitionDescriptor;
use crate::step::{Step, StepName, SuspensionKind};

/// Predicate deciding which branch of a conditional runs.
pub type Predicate<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

/// A node waiting for an external signal or approval.
pub struct WaitNode<C>
where
    C: Send + 'static,
{
    /// Awaited signal name.
    pub signal_name: String,
    /// How long the instance may wait.
    pub timeout: Option<Duration>,
    /// Signal or approval.
    pub kind: SuspensionKind,
    /// Step run on the resumed pass to consume the payload.
    pub consumer: Option<Arc<dyn Step<C>>>,
}

/// One node of a workflow graph.
///
/// Graphs are trees of owned nodes, so they are acyclic by construction
/// and the root node is the single entry point.
pub enum Node<C>
where
    C: Send + 'static,
{
    /// Execute one step, with its timeout and retry policy.
    Step(Arc<dyn Step<C>>),
    /// Run children in order; the first failure or suspension stops the sequence.
    Sequence(Vec<Node<C>>),
    /// Evaluate the predicate once and run exactly one branch.
    Conditional {
        /// Branch selector.
        predicate: Predicate<C>,
        /// Runs when the predicate holds.
        then_branch: Box<Node<C>>,
        /// Runs otherwise.
        else_branch: Box<Node<C>>,
    },
    /// Run all branches concurrently and wait for every one of them.
    Parallel(Vec<Node<C>>),
    /// Cancellable pause.
    Delay(Duration),
    /// Suspend until a signal or approval is delivered.
    Wait(WaitNode<C>),
}

impl<C> Node<C>
where
    C: Send + 'static,
{
    /// A step node.
    pub fn step<S: Step<C> + 'static>(step: S) -> Self {
        Node::Step(Arc::new(step))
    }

    /// A sequence node.
    pub fn sequence(children: impl IntoIterator<Item = Node<C>>) -> Self {
        Node::Sequence(children.into_iter().collect())
    }

    /// A parallel node.
    pub fn parallel(branches: impl IntoIterator<Item = Node<C>>) -> Self {
        Node::Parallel(branches.into_iter().collect())
    }

    /// A conditional with both branches.
    pub fn if_else(
        predicate: impl Fn(&C) -> bool + Send + Sync + 'static,
        then_branch: Node<C>,
        else_branch: Node<C>,
    ) -> Self {
        Node::Conditional {
            predicate: Arc::new(predicate),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        }
    }

    /// A conditional whose else branch does nothing.
    pub fn when(predicate: impl Fn(&C) -> bool + Send + Sync + 'static, then_branch: Node<C>) -> Self {
        Self::if_else(predicate, then_branch, Node::Sequence(Vec::new()))
    }

    /// A delay node.
    pub fn delay(duration: Duration) -> Self {
        Node::Delay(duration)
    }

    /// Suspend until `signal_name` is delivered.
    pub fn wait_for_signal(signal_name: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self::wait(signal_name, timeout, SuspensionKind::Signal)
    }

    /// Suspend until an approval decision named `signal_name` is delivered.
    pub fn wait_for_approval(signal_name: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self::wait(signal_name, timeout, SuspensionKind::Approval)
    }

    /// Attaches a step that consumes the payload on the resumed pass. The
    /// payload is available through
    /// [`StepContext::signal_payload`](crate::StepContext::signal_payload).
    ///
    /// Only wait nodes take a consumer; any other node is returned unchanged.
    pub fn then_consume<S: Step<C> + 'static>(self, consumer: S) -> Self {
        match self {
            Node::Wait(mut wait) => {
                wait.consumer = Some(Arc::new(consumer));
                Node::Wait(wait)
            }
            other => other,
        }
    }

    fn wait(signal_name: impl Into<String>, timeout: Option<Duration>, kind: SuspensionKind) -> Self {
        Node::Wait(WaitNode {
            signal_name: signal_name.into(),
            timeout,
            kind,
            consumer: None,
        })
    }

    fn visit_steps(&self, visit: &mut dyn FnMut(&Arc<dyn Step<C>>)) {
        match self {
            Node::Step(step) => visit(step),
            Node::Sequence(children) | Node::Parallel(children) => {
                children.iter().for_each(|child| child.visit_steps(visit))
            }
            Node::Conditional {
                then_branch,
                else_branch,
                ..
            } => {
                then_branch.visit_steps(visit);
                else_branch.visit_steps(visit);
            }
            Node::Delay(_) => {}
            Node::Wait(wait) => {
                if let Some(consumer) = &wait.consumer {
                    visit(consumer);
                }
            }
        }
    }

    fn validate(&self, signals: &mut HashSet<String>) -> Result<(), WorkflowError> {
        match self {
            Node::Step(_) | Node::Delay(_) => Ok(()),
            Node::Sequence(children) => children.iter().try_for_each(|c| c.validate(signals)),
            Node::Parallel(branches) => {
                if branches.is_empty() {
                    return Err(WorkflowError::Configuration(
                        "Parallel node must have at least one branch".to_string(),
                    ));
                }
                branches.iter().try_for_each(|b| b.validate(signals))
            }
            Node::Conditional {
                then_branch,
                else_branch,
                ..
            } => {
                then_branch.validate(signals)?;
                else_branch.validate(signals)
            }
            Node::Wait(wait) => {
                if wait.signal_name.trim().is_empty() {
                    return Err(WorkflowError::Configuration(
                        "Signal name must not be empty".to_string(),
                    ));
                }
                if !signals.insert(wait.signal_name.clone()) {
                    return Err(WorkflowError::Configuration(format!(
                        "Signal '{}' is awaited more than once",
                        wait.signal_name
                    )));
                }
                Ok(())
            }
        }
    }
}

impl<C> fmt::Debug for Node<C>
where
    C: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Step(step) => f.debug_tuple("Step").field(&step.name()).finish(),
            Node::Sequence(children) => f.debug_tuple("Sequence").field(children).finish(),
            Node::Conditional {
                then_branch,
                else_branch,
                ..
            } => f
                .debug_struct("Conditional")
                .field("then_branch", then_branch)
                .field("else_branch", else_branch)
                .finish(),
            Node::Parallel(branches) => f.debug_tuple("Parallel").field(branches).finish(),
            Node::Delay(duration) => f.debug_tuple("Delay").field(duration).finish(),
            Node::Wait(wait) => f
                .debug_struct("Wait")
                .field("signal_name", &wait.signal_name)
                .field("timeout", &wait.timeout)
                .field("kind", &wait.kind)
                .field("consumer", &wait.consumer.as_ref().map(|s| s.name()))
                .finish(),
        }
    }
}

/// An immutable workflow graph, built once per workflow type.
pub struct WorkflowDefinition<C>
where
    C: Send + 'static,
{
    workflow_id: String,
    display_name: String,
    version: u32,
    timeout: Option<Duration>,
    graph: Node<C>,
    steps: HashMap<StepName, Arc<dyn Step<C>>>,
}

impl<C> fmt::Debug for WorkflowDefinition<C>
where
    C: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("workflow_id", &self.workflow_id)
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .field("graph", &self.graph)
            .finish()
    }
}

impl<C> WorkflowDefinition<C>
where
    C: Send + 'static,
{
    /// Creates a new definition builder.
    pub fn builder(workflow_id: impl Into<String>) -> WorkflowDefinitionBuilder<C> {
        WorkflowDefinitionBuilder::new(workflow_id)
    }

    /// Stable workflow identity.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Human readable name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Definition version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Workflow-level deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The root node.
    pub fn graph(&self) -> &Node<C> {
        &self.graph
    }

    /// Looks a step up by name.
    pub fn step(&self, name: &str) -> Option<&Arc<dyn Step<C>>> {
        self.steps.get(name)
    }

    /// Returns an iterator over all step names.
    pub fn step_names(&self) -> impl Iterator<Item = &StepName> {
        self.steps.keys()
    }
}

impl<C: WorkflowContext> WorkflowDefinition<C> {
    /// Registry lookup key for instances of this definition.
    pub fn descriptor(&self) -> DefinitionDescriptor {
        DefinitionDescriptor {
            workflow_id: self.workflow_id.clone(),
            version: self.version,
            context_type: C::context_type().to_string(),
        }
    }
}

/// Builder for [`WorkflowDefinition`].
///
/// # Examples
///
/// ```
/// use sagaflow_core::{define_step, BoxError, Node, Step, StepContext, StepResult, WorkflowDefinition};
/// use async_trait::async_trait;
///
/// define_step!(Reserve);
///
/// #[async_trait]
/// impl Step<u32> for Reserve {
///     async fn execute(&self, _ctx: &StepContext<u32>) -> Result<StepResult, BoxError> {
///         Ok(StepResult::success())
///     }
/// }
///
/// let definition = WorkflowDefinition::builder("reservation")
///     .display_name("Reservation")
///     .graph(Node::sequence([
///         Node::step(Reserve),
///         Node::wait_for_signal("confirmed", None),
///     ]))
///     .build()
///     .expect("valid workflow");
///
/// assert!(definition.step("Reserve").is_some());
/// ```
pub struct WorkflowDefinitionBuilder<C>
where
    C: Send + 'static,
{
    workflow_id: String,
    display_name: Option<String>,
    version: u32,
    timeout: Option<Duration>,
    graph: Option<Node<C>>,
}

impl<C> WorkflowDefinitionBuilder<C>
where
    C: Send + 'static,
{
    /// Creates an empty builder.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            display_name: None,
            version: 1,
            timeout: None,
            graph: None,
        }
    }

    /// Sets the display name. Defaults to the workflow id.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the version. Defaults to 1.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Sets the workflow-level deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the root node.
    pub fn graph(mut self, graph: Node<C>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Validates and freezes the definition.
    pub fn build(self) -> Result<WorkflowDefinition<C>, WorkflowError> {
        if self.workflow_id.trim().is_empty() {
            return Err(WorkflowError::Configuration(
                "Workflow id must not be empty".to_string(),
            ));
        }
        let graph = self.graph.ok_or_else(|| {
            WorkflowError::Configuration("Workflow graph must be specified".to_string())
        })?;

        graph.validate(&mut HashSet::new())?;

        let mut steps = HashMap::new();
        let mut duplicate = None;
        graph.visit_steps(&mut |step| {
            let name = step.name();
            if steps.insert(name.clone(), Arc::clone(step)).is_some() && duplicate.is_none() {
                duplicate = Some(name);
            }
        });
        if let Some(name) = duplicate {
            return Err(WorkflowError::Configuration(format!(
                "Step '{name}' appears more than once"
            )));
        }

        Ok(WorkflowDefinition {
            display_name: self.display_name.unwrap_or_else(|| self.workflow_id.clone()),
            workflow_id: self.workflow_id,
            version: self.version,
            timeout: self.timeout,
            graph,
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StepContext;
    use crate::error::BoxError;
    use crate::step::StepResult;
    use crate::define_step;
    use async_trait::async_trait;

    define_step!(First);
    define_step!(Second);

    impl crate::context::WorkflowContext for u32 {}

    #[async_trait]
    impl Step<u32> for First {
        async fn execute(&self, _ctx: &StepContext<u32>) -> Result<StepResult, BoxError> {
            Ok(StepResult::success())
        }
    }

    #[async_trait]
    impl Step<u32> for Second {
        async fn execute(&self, _ctx: &StepContext<u32>) -> Result<StepResult, BoxError> {
            Ok(StepResult::success())
        }
    }

    #[test]
    fn test_builder_defaults() {
        let definition = WorkflowDefinition::builder("flow")
            .graph(Node::sequence([Node::step(First), Node::step(Second)]))
            .build()
            .expect("valid workflow");

        assert_eq!(definition.display_name(), "flow");
        assert_eq!(definition.version(), 1);
        assert_eq!(definition.step_names().count(), 2);
        assert_eq!(definition.descriptor().context_type, std::any::type_name::<u32>());
    }

    #[test]
    fn test_builder_requires_graph() {
        let result = WorkflowDefinition::<u32>::builder("flow").build();
        assert!(matches!(
            result,
            Err(WorkflowError::Configuration(msg)) if msg == "Workflow graph must be specified"
        ));
    }

    #[test]
    fn test_duplicate_steps_rejected() {
        let result = WorkflowDefinition::builder("flow")
            .graph(Node::parallel([Node::step(First), Node::step(First)]))
            .build();
        assert!(matches!(result, Err(WorkflowError::Configuration(msg)) if msg.contains("First")));
    }

    #[test]
    fn test_signal_validation() {
        let duplicate = WorkflowDefinition::<u32>::builder("flow")
            .graph(Node::sequence([
                Node::wait_for_signal("ok", None),
                Node::wait_for_approval("ok", None),
            ]))
            .build();
        assert!(duplicate.is_err());

        let empty = WorkflowDefinition::<u32>::builder("flow")
            .graph(Node::wait_for_signal(" ", None))
            .build();
        assert!(empty.is_err());

        let no_branches = WorkflowDefinition::<u32>::builder("flow")
            .graph(Node::parallel([]))
            .build();
        assert!(no_branches.is_err());
    }

    #[test]
    fn test_consumer_steps_are_indexed() {
        let definition = WorkflowDefinition::builder("flow")
            .graph(Node::when(
                |value: &u32| *value > 3,
                Node::wait_for_signal("payment", None).then_consume(Second),
            ))
            .build()
            .expect("valid workflow");
        assert!(definition.step("Second").is_some());
    }
}
