use async_trait::async_trait;
use sagaflow::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

define_step!(Step1);
define_step!(Step2);

#[async_trait]
impl Step<Vec<String>> for Step1 {
    async fn execute(&self, ctx: &StepContext<Vec<String>>) -> Result<StepResult, BoxError> {
        ctx.lock().await.push("step1".to_string());
        Ok(StepResult::success())
    }
}

#[async_trait]
impl Step<Vec<String>> for Step2 {
    async fn execute(&self, ctx: &StepContext<Vec<String>>) -> Result<StepResult, BoxError> {
        ctx.lock().await.push("step2".to_string());
        Ok(StepResult::success())
    }
}

#[tokio::test]
async fn test_complete_workflow() {
    let definition = WorkflowDefinition::builder("complete")
        .graph(Node::sequence([Node::step(Step1), Node::step(Step2)]))
        .build()
        .expect("valid workflow");

    let result = WorkflowEngine::new()
        .execute(
            &definition,
            Vec::new(),
            ExecutionOptions::new(),
            CancellationToken::new(),
        )
        .await;

    assert!(result.is_success());
    assert_eq!(result.context, vec!["step1", "step2"]);
    let names: Vec<&str> = result
        .execution_trace
        .iter()
        .map(|entry| entry.step_name.as_str())
        .collect();
    assert_eq!(names, vec![Step1::NAME, Step2::NAME]);
}

#[test]
fn test_definition_validation() {
    let missing_graph = WorkflowDefinition::<Vec<String>>::builder("empty").build();
    assert!(matches!(
        missing_graph,
        Err(WorkflowError::Configuration(message)) if message == "Workflow graph must be specified"
    ));

    let duplicate = WorkflowDefinition::builder("duplicate")
        .graph(Node::sequence([Node::step(Step1), Node::step(Step1)]))
        .build();
    assert!(matches!(
        duplicate,
        Err(WorkflowError::Configuration(message)) if message.contains("'Step1' appears more than once")
    ));

    let empty_parallel = WorkflowDefinition::<Vec<String>>::builder("fan-out")
        .graph(Node::parallel([]))
        .build();
    assert!(matches!(empty_parallel, Err(WorkflowError::Configuration(_))));

    let blank_signal = WorkflowDefinition::<Vec<String>>::builder("blank")
        .graph(Node::wait_for_signal("  ", None))
        .build();
    assert!(matches!(blank_signal, Err(WorkflowError::Configuration(_))));

    let definition = WorkflowDefinition::builder("ok")
        .display_name("Two steps")
        .version(3)
        .graph(Node::sequence([Node::step(Step1), Node::step(Step2)]))
        .build()
        .expect("valid workflow");
    assert_eq!(definition.version(), 3);
    assert_eq!(definition.display_name(), "Two steps");
    assert!(definition.step("Step2").is_some());
    assert!(definition.step("Step3").is_none());
}

struct SlowStep;

#[async_trait]
impl Step<Vec<String>> for SlowStep {
    async fn execute(&self, _ctx: &StepContext<Vec<String>>) -> Result<StepResult, BoxError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(StepResult::success())
    }

    fn name(&self) -> StepName {
        StepName::new("SlowStep")
    }
}

#[tokio::test]
async fn test_configured_default_step_timeout() {
    let config = EngineConfig {
        default_step_timeout_ms: 50,
        ..EngineConfig::default()
    };
    let definition = WorkflowDefinition::builder("slow")
        .graph(Node::step(SlowStep))
        .build()
        .expect("valid workflow");

    let result = WorkflowEngine::from_config(&config)
        .execute(
            &definition,
            Vec::new(),
            ExecutionOptions::new(),
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(
        result.error(),
        Some(WorkflowError::StepTimeout { step_name, timeout })
            if step_name == &"SlowStep" && *timeout == Duration::from_millis(50)
    ));
}

struct FlakyStep {
    attempts: Arc<AtomicU32>,
    fail_until: u32,
}

#[async_trait]
impl Step<Value> for FlakyStep {
    async fn execute(&self, ctx: &StepContext<Value>) -> Result<StepResult, BoxError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_until {
            return Err(format!("Attempt {} failed", attempt + 1).into());
        }
        ctx.lock().await["success"] = json!(true);
        Ok(StepResult::success())
    }

    fn name(&self) -> StepName {
        StepName::new("FlakyStep")
    }

    fn config(&self) -> StepConfig {
        StepConfig {
            retry_policy: RetryPolicy::fixed(3, Duration::from_millis(10)),
            ..StepConfig::default()
        }
    }
}

/// Copies the approval payload into the context.
struct RecordPayment;

#[async_trait]
impl Step<Value> for RecordPayment {
    async fn execute(&self, ctx: &StepContext<Value>) -> Result<StepResult, BoxError> {
        let payload = ctx.signal_payload("payment").cloned().unwrap_or(Value::Null);
        ctx.lock().await["payment"] = payload;
        Ok(StepResult::success())
    }

    fn name(&self) -> StepName {
        StepName::new("RecordPayment")
    }
}

#[tokio::test]
async fn test_json_context_survives_persistence() {
    let attempts = Arc::new(AtomicU32::new(0));
    let engine = PersistentWorkflowEngine::builder(Arc::new(InMemoryWorkflowStateRepository::new()))
        .config(EngineConfig {
            resume_on_signal: false,
            ..EngineConfig::default()
        })
        .build();
    let definition = engine.registry().register(
        WorkflowDefinition::builder("json-order")
            .graph(Node::sequence([
                Node::step(FlakyStep {
                    attempts: Arc::clone(&attempts),
                    fail_until: 2,
                }),
                Node::wait_for_signal("payment", None).then_consume(RecordPayment),
            ]))
            .build()
            .expect("valid workflow"),
    );

    let (id, first) = engine
        .start_persistent_workflow(definition, json!({"order": 7}))
        .await
        .expect("started");
    assert_eq!(first.suspended_signal_name(), Some("payment"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let retries = first
        .execution_trace
        .iter()
        .filter(|entry| entry.step_name == "FlakyStep")
        .count();
    assert_eq!(retries, 3);

    assert!(engine.signal_workflow(&id, "payment", json!({"amount": 120})).await);
    let resumed = engine.resume(&id).await.expect("resumed");

    assert!(resumed.is_success());
    assert_eq!(
        resumed.context,
        json!({"order": 7, "success": true, "payment": {"amount": 120}})
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let info = engine
        .get_workflow_state_info(&id)
        .await
        .expect("readable")
        .expect("present");
    assert_eq!(info.status, WorkflowStatus::Completed);
}
