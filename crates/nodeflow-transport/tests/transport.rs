//! Runs through both transports

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Notify;

use nodeflow_engine::{ErrorCode, ExecutionOutcome, ExecutorRegistry, NodeDefinition, NodeState, Orchestrator};
use nodeflow_transport::{ExecutionTransport, InProcessTransport, TransportRequest, WorkerTransport};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Orchestrator with `echo`, `var` and a `gate` type that holds until its run is cancelled
fn orchestrator() -> (Arc<Orchestrator>, Arc<Notify>) {
    let started = Arc::new(Notify::new());
    let mut registry = ExecutorRegistry::new();
    registry.register_sync("echo", |ctx| Ok(ctx.input.clone()));
    registry.register_sync("var", |ctx| Ok(ctx.get_variable("greeting").cloned().unwrap_or(Value::Null)));
    let signal = Arc::clone(&started);
    registry.register_callback("gate", move |ctx| {
        let signal = Arc::clone(&signal);
        async move {
            signal.notify_one();
            ctx.cancellation().cancelled().await;
            Ok(json!("released"))
        }
    });
    (Arc::new(Orchestrator::new(registry)), started)
}

fn gated_group() -> NodeDefinition {
    NodeDefinition::composite("g")
        .with_child(NodeDefinition::new("gate", "gate"))
        .with_child(NodeDefinition::new("after", "echo"))
        .connect("gate", "after")
}

async fn cancel_mid_run(transport: &dyn ExecutionTransport, started: &Notify) {
    let request = TransportRequest::new(Value::Null).with_execution_id("run-1");
    let group = gated_group();

    let (result, cancelled) = tokio::join!(transport.execute(&group, request), async {
        started.notified().await;
        transport.cancel("run-1").await
    });

    assert!(cancelled);
    assert_eq!(result.outcome, ExecutionOutcome::Cancelled);
    assert!(!result.success);
    assert!(result.error.is_none());
    assert_eq!(result.node_state("gate"), Some(NodeState::Completed));
    assert_eq!(result.node_state("after"), Some(NodeState::Skipped));
    assert!(!transport.cancel("run-1").await);
}

#[tokio::test]
async fn in_process_cancel_skips_remaining_nodes() {
    init_logging();
    let (orchestrator, started) = orchestrator();
    let transport = InProcessTransport::new(orchestrator);
    cancel_mid_run(&transport, &started).await;
    assert_eq!(transport.active_runs(), 0);
}

#[tokio::test]
async fn worker_cancel_skips_remaining_nodes() {
    init_logging();
    let (orchestrator, started) = orchestrator();
    let transport = WorkerTransport::spawn(orchestrator);
    cancel_mid_run(&transport, &started).await;
}

#[tokio::test]
async fn worker_carries_variables_across_the_boundary() {
    let (orchestrator, _) = orchestrator();
    let transport = WorkerTransport::spawn(orchestrator);

    let request = TransportRequest::new(Value::Null).with_variable("greeting", json!("hello"));
    let result = transport.execute(&NodeDefinition::new("v", "var"), request).await;

    assert!(result.success);
    assert_eq!(result.output, json!("hello"));
    assert!(result.context.unwrap().execution_id.starts_with("exec-"));
}

#[tokio::test]
async fn dead_worker_is_unhealthy_until_restarted() {
    init_logging();
    let (orchestrator, _) = orchestrator();
    let transport = WorkerTransport::spawn(orchestrator);
    let node = NodeDefinition::new("n", "echo");

    transport.shutdown();
    assert!(!transport.health().await.healthy);

    let result = transport.execute(&node, TransportRequest::new(json!(1))).await;
    assert!(!result.success);
    let error = result.error.unwrap();
    assert_eq!(error.node_id, "n");
    assert_eq!(error.code, Some(ErrorCode::Internal));
    assert!(transport.health().await.last_error.is_some());

    transport.restart().await.unwrap();
    let health = transport.health().await;
    assert!(health.healthy);
    assert_eq!(health.restarts, 1);
    assert!(health.last_error.is_none());

    let result = transport.execute(&node, TransportRequest::new(json!(2))).await;
    assert!(result.success);
    assert_eq!(result.output, json!(2));
}

#[tokio::test]
async fn restart_fails_active_worker_runs() {
    let (orchestrator, started) = orchestrator();
    let transport = WorkerTransport::spawn(orchestrator);
    let group = gated_group();

    let (result, restarted) = tokio::join!(transport.execute(&group, TransportRequest::new(Value::Null)), async {
        started.notified().await;
        transport.restart().await
    });

    assert!(restarted.is_ok());
    assert!(!result.success);
    assert_eq!(result.error.unwrap().code, Some(ErrorCode::Internal));
    assert_eq!(transport.health().await.active_runs, 0);
}
