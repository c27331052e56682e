//! Order saga with a manager approval.
//!
//! Demonstrates:
//! - Steps with compensation
//! - Suspending on an approval and resuming when it arrives
//! - Rolling back completed steps after a rejection
//!
//! Run with `SAGAFLOW_LOGGING__LEVEL=debug` for per-attempt logs.

use async_trait::async_trait;
use sagaflow::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Order {
    id: String,
    amount_cents: u64,
    reserved: bool,
    charge_id: Option<String>,
    shipped: bool,
}

impl WorkflowContext for Order {
    fn context_type() -> &'static str {
        "order/v1"
    }
}

define_step!(ReserveInventory);
define_step!(ChargePayment);
define_step!(ShipOrder);

#[async_trait]
impl Step<Order> for ReserveInventory {
    async fn execute(&self, ctx: &StepContext<Order>) -> Result<StepResult, BoxError> {
        let mut order = ctx.lock().await;
        println!("Reserving stock for {}", order.id);
        order.reserved = true;
        Ok(StepResult::success())
    }

    async fn compensate(&self, ctx: &StepContext<Order>) -> Result<(), BoxError> {
        let mut order = ctx.lock().await;
        println!("Releasing stock for {}", order.id);
        order.reserved = false;
        Ok(())
    }
}

#[async_trait]
impl Step<Order> for ChargePayment {
    async fn execute(&self, ctx: &StepContext<Order>) -> Result<StepResult, BoxError> {
        let mut order = ctx.lock().await;
        if order.amount_cents == 0 {
            return Ok(StepResult::permanent_failure("nothing to charge"));
        }
        let charge_id = format!("ch_{}", order.id);
        println!("Charging {} cents as {}", order.amount_cents, charge_id);
        order.charge_id = Some(charge_id);
        Ok(StepResult::success())
    }

    fn config(&self) -> StepConfig {
        StepConfig {
            timeout: Some(Duration::from_secs(5)),
            retry_policy: RetryPolicy::exponential(3, Duration::from_millis(100)),
            ..StepConfig::default()
        }
    }

    async fn compensate(&self, ctx: &StepContext<Order>) -> Result<(), BoxError> {
        let mut order = ctx.lock().await;
        if let Some(charge_id) = order.charge_id.take() {
            println!("Refunding {charge_id}");
        }
        Ok(())
    }
}

#[async_trait]
impl Step<Order> for ShipOrder {
    async fn execute(&self, ctx: &StepContext<Order>) -> Result<StepResult, BoxError> {
        let mut order = ctx.lock().await;
        println!("Shipping {}", order.id);
        order.shipped = true;
        Ok(StepResult::success())
    }
}

async fn wait_until_finished(
    engine: &PersistentWorkflowEngine,
    id: &WorkflowInstanceId,
) -> Result<WorkflowStatus, WorkflowError> {
    loop {
        let info = engine
            .get_workflow_state_info(id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(id.clone()))?;
        if info.status.is_terminal() {
            return Ok(info.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::load()?;
    sagaflow::logging::init(&config.logging)?;

    let engine = PersistentWorkflowEngine::builder(Arc::new(InMemoryWorkflowStateRepository::new()))
        .config(config)
        .build();
    let definition = engine.registry().register(
        WorkflowDefinition::builder("order-saga")
            .display_name("Order saga")
            .timeout(Duration::from_secs(60))
            .graph(Node::sequence([
                Node::step(ReserveInventory),
                Node::step(ChargePayment),
                Node::wait_for_approval("manager", Some(Duration::from_secs(3600))),
                Node::step(ShipOrder),
            ]))
            .build()?,
    );

    for (order_id, decision) in [
        ("A-100", json!(true)),
        ("A-101", json!({"approved": false, "comment": "fraud check"})),
    ] {
        let order = Order {
            id: order_id.to_string(),
            amount_cents: 4_200,
            ..Order::default()
        };
        let (id, first) = engine
            .start_persistent_workflow(Arc::clone(&definition), order)
            .await?;
        println!(
            "{order_id}: waiting for {:?}",
            first.suspended_signal_name().unwrap_or_default()
        );

        if !engine.signal_workflow(&id, "manager", decision).await {
            eprintln!("{order_id}: approval was not accepted");
            continue;
        }
        let status = wait_until_finished(&engine, &id).await?;
        let state = engine.get_workflow_state::<Order>(&id).await?;
        println!("{order_id}: {status}, final context {:?}", state.map(|s| s.context));
    }

    Ok(())
}
