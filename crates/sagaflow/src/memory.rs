//! In-memory state repository.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use sagaflow_core::{StoredWorkflowState, WorkflowError, WorkflowInstanceId, WorkflowStateRepository};

/// Repository keeping each instance as a JSON document in memory.
///
/// Records are serialized on write, so [`raw`](Self::raw) returns exactly
/// the bytes a durable backend would have stored.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStateRepository {
    records: RwLock<HashMap<WorkflowInstanceId, String>>,
}

impl InMemoryWorkflowStateRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored JSON document of an instance.
    pub async fn raw(&self, instance_id: &WorkflowInstanceId) -> Option<String> {
        self.records.read().await.get(instance_id).cloned()
    }

    /// Number of stored instances.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns `true` if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl WorkflowStateRepository for InMemoryWorkflowStateRepository {
    async fn save_workflow_state(&self, state: &StoredWorkflowState) -> Result<(), WorkflowError> {
        let document = serde_json::to_string(state)?;
        let mut records = self.records.write().await;
        if records.contains_key(&state.workflow_instance_id) {
            return Err(WorkflowError::Repository(format!(
                "Workflow instance already exists: {}",
                state.workflow_instance_id
            )));
        }
        records.insert(state.workflow_instance_id.clone(), document);
        Ok(())
    }

    async fn get_workflow_state(
        &self,
        instance_id: &WorkflowInstanceId,
    ) -> Result<Option<StoredWorkflowState>, WorkflowError> {
        let records = self.records.read().await;
        records
            .get(instance_id)
            .map(|document| serde_json::from_str(document))
            .transpose()
            .map_err(WorkflowError::from)
    }

    async fn update_workflow_state(
        &self,
        state: &StoredWorkflowState,
    ) -> Result<(), WorkflowError> {
        let document = serde_json::to_string(state)?;
        let mut records = self.records.write().await;
        match records.get_mut(&state.workflow_instance_id) {
            Some(existing) => {
                *existing = document;
                Ok(())
            }
            None => Err(WorkflowError::InstanceNotFound(
                state.workflow_instance_id.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::{DefinitionDescriptor, WorkflowInstanceState, WorkflowStatus};
    use serde_json::json;

    fn state(id: &str) -> StoredWorkflowState {
        WorkflowInstanceState::new(
            id.into(),
            "orders",
            "Orders",
            DefinitionDescriptor {
                workflow_id: "orders".into(),
                version: 1,
                context_type: "json".into(),
            },
            json!({"value": 1}),
        )
    }

    #[tokio::test]
    async fn test_save_get_update() {
        let repository = InMemoryWorkflowStateRepository::new();
        let mut record = state("a");
        repository.save_workflow_state(&record).await.expect("saved");

        let loaded = repository
            .get_workflow_state(&record.workflow_instance_id)
            .await
            .expect("readable")
            .expect("present");
        assert_eq!(loaded, record);

        record.status = WorkflowStatus::Completed;
        repository.update_workflow_state(&record).await.expect("updated");
        let raw = repository.raw(&record.workflow_instance_id).await.expect("present");
        assert!(raw.contains("\"completed\""));
        assert_eq!(repository.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_save_and_missing_update() {
        let repository = InMemoryWorkflowStateRepository::new();
        let record = state("b");
        repository.save_workflow_state(&record).await.expect("saved");
        assert!(matches!(
            repository.save_workflow_state(&record).await,
            Err(WorkflowError::Repository(_))
        ));
        assert!(matches!(
            repository.update_workflow_state(&state("c")).await,
            Err(WorkflowError::InstanceNotFound(_))
        ));
        assert!(repository
            .get_workflow_state(&"d".into())
            .await
            .expect("readable")
            .is_none());
    }
}
