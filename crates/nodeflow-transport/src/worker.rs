//! Transport that runs the engine in a separate worker task
//!
//! Requests and results cross the boundary as JSON strings, the same
//! payloads a process boundary would carry. The worker can be shut down
//! and restarted without touching the caller; a dead worker reports
//! unhealthy and every execution against it fails with a structured error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nodeflow_engine::context::new_execution_id;
use nodeflow_engine::{ErrorCode, ExecutionError, ExecutionResult, NodeDefinition, Orchestrator};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::transport::{ExecutionTransport, TransportHealth, TransportRequest};

const CHANNEL_CAPACITY: usize = 64;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);

/// Payload of an execute message
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerRequest {
    node: NodeDefinition,
    request: TransportRequest,
}

enum WorkerMessage {
    Execute {
        execution_id: String,
        payload: String,
        reply: oneshot::Sender<String>,
    },
    Cancel {
        execution_id: String,
        reply: oneshot::Sender<bool>,
    },
    Ping {
        reply: oneshot::Sender<usize>,
    },
}

struct WorkerHandle {
    sender: mpsc::Sender<WorkerMessage>,
    task: JoinHandle<()>,
}

/// Runs executions on a dedicated worker task
///
/// Must be created inside a tokio runtime.
pub struct WorkerTransport {
    orchestrator: Arc<Orchestrator>,
    handle: Mutex<WorkerHandle>,
    completed: Arc<AtomicU64>,
    restarts: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl WorkerTransport {
    pub fn spawn(orchestrator: Arc<Orchestrator>) -> Self {
        let completed = Arc::new(AtomicU64::new(0));
        let handle = spawn_worker(Arc::clone(&orchestrator), Arc::clone(&completed));
        Self {
            orchestrator,
            handle: Mutex::new(handle),
            completed,
            restarts: AtomicU32::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Stop the worker; active runs are dropped
    pub fn shutdown(&self) {
        log::info!("Shutting down execution worker");
        self.handle.lock().task.abort();
    }

    fn sender(&self) -> mpsc::Sender<WorkerMessage> {
        self.handle.lock().sender.clone()
    }

    fn record_error(&self, error: &TransportError) {
        log::warn!("Worker transport error: {}", error);
        *self.last_error.lock() = Some(error.to_string());
    }

    async fn round_trip(&self, node: &NodeDefinition, request: TransportRequest) -> Result<ExecutionResult, TransportError> {
        let execution_id = request.execution_id.clone().unwrap_or_else(new_execution_id);
        let request = TransportRequest {
            execution_id: Some(execution_id.clone()),
            ..request
        };
        let payload = serde_json::to_string(&WorkerRequest {
            node: node.clone(),
            request,
        })?;

        let (reply, response) = oneshot::channel();
        self.sender()
            .send(WorkerMessage::Execute {
                execution_id,
                payload,
                reply,
            })
            .await
            .map_err(|_| TransportError::WorkerUnavailable)?;

        let json = response
            .await
            .map_err(|_| TransportError::WorkerDropped(node.id.clone()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl Drop for WorkerTransport {
    fn drop(&mut self) {
        self.handle.get_mut().task.abort();
    }
}

#[async_trait]
impl ExecutionTransport for WorkerTransport {
    fn name(&self) -> &str {
        "worker"
    }

    async fn execute(&self, node: &NodeDefinition, request: TransportRequest) -> ExecutionResult {
        match self.round_trip(node, request).await {
            Ok(result) => result,
            Err(err) => {
                self.record_error(&err);
                ExecutionResult::from_error(err.to_execution_error(&node.id))
            }
        }
    }

    async fn cancel(&self, execution_id: &str) -> bool {
        let (reply, response) = oneshot::channel();
        let message = WorkerMessage::Cancel {
            execution_id: execution_id.to_string(),
            reply,
        };
        if self.sender().send(message).await.is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    async fn health(&self) -> TransportHealth {
        let (reply, response) = oneshot::channel();
        let sent = self.sender().send(WorkerMessage::Ping { reply }).await.is_ok();
        let active_runs = if sent {
            tokio::time::timeout(HEALTH_TIMEOUT, response).await.ok().and_then(Result::ok)
        } else {
            None
        };

        TransportHealth {
            healthy: active_runs.is_some(),
            transport: self.name().to_string(),
            active_runs: active_runs.unwrap_or(0),
            completed_runs: self.completed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            checked_at: Utc::now(),
        }
    }

    async fn restart(&self) -> Result<(), TransportError> {
        let fresh = spawn_worker(Arc::clone(&self.orchestrator), Arc::clone(&self.completed));
        let old = std::mem::replace(&mut *self.handle.lock(), fresh);
        old.task.abort();

        let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_error.lock() = None;
        log::info!("Execution worker restarted ({} restarts)", restarts);

        if self.health().await.healthy {
            Ok(())
        } else {
            Err(TransportError::RestartFailed("worker did not answer after restart".into()))
        }
    }
}

fn spawn_worker(orchestrator: Arc<Orchestrator>, completed: Arc<AtomicU64>) -> WorkerHandle {
    let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
    let task = tokio::spawn(worker_loop(orchestrator, receiver, completed));
    WorkerHandle { sender, task }
}

/// Owns every run it starts; dropping the loop aborts them all
async fn worker_loop(
    orchestrator: Arc<Orchestrator>,
    mut receiver: mpsc::Receiver<WorkerMessage>,
    completed: Arc<AtomicU64>,
) {
    let mut runs: JoinSet<String> = JoinSet::new();
    let mut active: HashMap<String, CancellationToken> = HashMap::new();
    log::debug!("Execution worker started");

    loop {
        tokio::select! {
            message = receiver.recv() => {
                let Some(message) = message else { break };
                match message {
                    WorkerMessage::Execute { execution_id, payload, reply } => {
                        let token = CancellationToken::new();
                        active.insert(execution_id.clone(), token.clone());
                        let orchestrator = Arc::clone(&orchestrator);
                        runs.spawn(async move {
                            let response = run_payload(&orchestrator, &payload, token).await;
                            // Caller may have given up waiting
                            let _ = reply.send(response);
                            execution_id
                        });
                    }
                    WorkerMessage::Cancel { execution_id, reply } => {
                        let found = active.get(&execution_id).map(CancellationToken::cancel).is_some();
                        let _ = reply.send(found);
                    }
                    WorkerMessage::Ping { reply } => {
                        let _ = reply.send(active.len());
                    }
                }
            }
            Some(finished) = runs.join_next(), if !runs.is_empty() => {
                match finished {
                    Ok(execution_id) => {
                        active.remove(&execution_id);
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => log::error!("Worker run panicked: {}", e),
                }
            }
        }
    }

    log::debug!("Execution worker stopped");
}

/// Decode, execute and encode one run; never fails
async fn run_payload(orchestrator: &Orchestrator, payload: &str, token: CancellationToken) -> String {
    let result = match serde_json::from_str::<WorkerRequest>(payload) {
        Ok(WorkerRequest { node, request }) => {
            let execution_id = request.execution_id.clone().unwrap_or_else(new_execution_id);
            let (input, options) = request.into_run(execution_id, token);
            orchestrator.execute_with(&node, input, options).await
        }
        Err(e) => {
            let mut error = ExecutionError::new("", format!("Malformed worker request: {}", e));
            error.code = Some(ErrorCode::Internal);
            ExecutionResult::from_error(error)
        }
    };

    serde_json::to_string(&result).unwrap_or_else(|e| {
        log::error!("Failed to encode execution result: {}", e);
        let mut error = ExecutionError::new("", format!("Failed to encode result: {}", e));
        error.code = Some(ErrorCode::Internal);
        // A bare failure result always encodes
        serde_json::to_string(&ExecutionResult::from_error(error)).unwrap_or_default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_engine::ExecutorRegistry;
    use serde_json::json;

    fn orchestrator() -> Arc<Orchestrator> {
        let mut registry = ExecutorRegistry::new();
        registry.register_sync("echo", |ctx| Ok(ctx.input.clone()));
        Arc::new(Orchestrator::new(registry))
    }

    #[tokio::test]
    async fn test_malformed_payload_is_a_failure_result() {
        let json = run_payload(&orchestrator(), "{broken", CancellationToken::new()).await;
        let result: ExecutionResult = serde_json::from_str(&json).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, Some(ErrorCode::Internal));
    }

    #[tokio::test]
    async fn test_health_reports_idle_worker() {
        let transport = WorkerTransport::spawn(orchestrator());
        let health = transport.health().await;
        assert!(health.healthy);
        assert_eq!(health.active_runs, 0);
        assert_eq!(health.transport, "worker");
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let transport = WorkerTransport::spawn(orchestrator());
        let result = transport
            .execute(&NodeDefinition::new("n", "echo"), TransportRequest::new(json!({"k": [1, 2]})))
            .await;
        assert!(result.success);
        assert_eq!(result.output, json!({"k": [1, 2]}));
    }
}
