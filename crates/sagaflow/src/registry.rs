//! Lookup of workflow definitions by workflow and context identity.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

use sagaflow_core::{
    DefinitionDescriptor, WorkflowContext, WorkflowDefinition, WorkflowError, WorkflowInstanceId,
    WorkflowResult,
};

use crate::persistent::PersistentWorkflowEngine;

pub(crate) type ResumeFn = fn(
    PersistentWorkflowEngine,
    WorkflowInstanceId,
) -> BoxFuture<'static, Result<WorkflowResult<Value>, WorkflowError>>;

type Key = (String, String);

struct Registration {
    definition: Arc<dyn Any + Send + Sync>,
    resume: ResumeFn,
    version: u32,
}

/// Definitions known to this process, keyed by `(workflow_id, context_type)`.
///
/// Populated by the host at startup. Persisted instances only record the
/// key, so registering the same definitions after a restart is enough to
/// resume them.
#[derive(Default)]
pub struct DefinitionRegistry {
    entries: RwLock<HashMap<Key, Registration>>,
}

impl std::fmt::Debug for DefinitionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("DefinitionRegistry")
            .field("definitions", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DefinitionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition, replacing any earlier one with the same key.
    pub fn register<C: WorkflowContext>(
        &self,
        definition: WorkflowDefinition<C>,
    ) -> Arc<WorkflowDefinition<C>> {
        let definition = Arc::new(definition);
        self.register_shared(Arc::clone(&definition));
        definition
    }

    /// Registers an already shared definition.
    pub fn register_shared<C: WorkflowContext>(&self, definition: Arc<WorkflowDefinition<C>>) {
        let descriptor = definition.descriptor();
        info!(definition = %descriptor, "Registering workflow definition");
        let registration = Registration {
            definition,
            resume: resume_typed::<C>,
            version: descriptor.version,
        };
        self.write()
            .insert(key(&descriptor.workflow_id, &descriptor.context_type), registration);
    }

    /// The definition registered for `workflow_id` with context `C`.
    pub fn get<C: WorkflowContext>(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition<C>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let registration = entries.get(&key(workflow_id, C::context_type()))?;
        Arc::clone(&registration.definition)
            .downcast::<WorkflowDefinition<C>>()
            .ok()
    }

    /// Returns `true` if a definition matches the descriptor's workflow and context.
    pub fn contains(&self, descriptor: &DefinitionDescriptor) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key(&descriptor.workflow_id, &descriptor.context_type))
    }

    /// Version of the registered definition for the descriptor.
    pub fn registered_version(&self, descriptor: &DefinitionDescriptor) -> Option<u32> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(&descriptor.workflow_id, &descriptor.context_type))
            .map(|registration| registration.version)
    }

    /// Number of registered definitions.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn resume_entry(&self, descriptor: &DefinitionDescriptor) -> Option<ResumeFn> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(&descriptor.workflow_id, &descriptor.context_type))
            .map(|registration| registration.resume)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Key, Registration>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key(workflow_id: &str, context_type: &str) -> Key {
    (workflow_id.to_string(), context_type.to_string())
}

fn resume_typed<C: WorkflowContext>(
    engine: PersistentWorkflowEngine,
    instance_id: WorkflowInstanceId,
) -> BoxFuture<'static, Result<WorkflowResult<Value>, WorkflowError>> {
    async move {
        let result = engine.resume_workflow::<C>(&instance_id).await?;
        let context = serde_json::to_value(&result.context)?;
        Ok(result.map_context(|_| context))
    }
    .boxed()
}
