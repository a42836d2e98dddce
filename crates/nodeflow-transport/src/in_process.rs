//! Transport that calls the orchestrator directly

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nodeflow_engine::context::new_execution_id;
use nodeflow_engine::{ExecutionResult, NodeDefinition, Orchestrator};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::transport::{ExecutionTransport, TransportHealth, TransportRequest};

/// Runs executions on the caller's task
pub struct InProcessTransport {
    orchestrator: Arc<Orchestrator>,
    active: Mutex<HashMap<String, CancellationToken>>,
    completed: AtomicU64,
    restarts: AtomicU32,
}

impl InProcessTransport {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            active: Mutex::new(HashMap::new()),
            completed: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
        }
    }

    pub fn active_runs(&self) -> usize {
        self.active.lock().len()
    }
}

/// Unregisters a run however its `execute` future ends
struct ActiveRun<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    execution_id: &'a str,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(self.execution_id);
    }
}

#[async_trait]
impl ExecutionTransport for InProcessTransport {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn execute(&self, node: &NodeDefinition, request: TransportRequest) -> ExecutionResult {
        let execution_id = request.execution_id.clone().unwrap_or_else(new_execution_id);
        let token = CancellationToken::new();
        self.active.lock().insert(execution_id.clone(), token.clone());
        let _active = ActiveRun {
            active: &self.active,
            execution_id: &execution_id,
        };

        let (input, options) = request.into_run(execution_id.clone(), token);
        let result = self.orchestrator.execute_with(node, input, options).await;

        self.completed.fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn cancel(&self, execution_id: &str) -> bool {
        match self.active.lock().get(execution_id) {
            Some(token) => {
                log::debug!("Cancelling in-process run {}", execution_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn health(&self) -> TransportHealth {
        TransportHealth {
            healthy: true,
            transport: self.name().to_string(),
            active_runs: self.active_runs(),
            completed_runs: self.completed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            last_error: None,
            checked_at: Utc::now(),
        }
    }

    async fn restart(&self) -> Result<(), TransportError> {
        let active: Vec<CancellationToken> = self.active.lock().drain().map(|(_, t)| t).collect();
        if !active.is_empty() {
            log::info!("Restart cancels {} in-process runs", active.len());
        }
        for token in active {
            token.cancel();
        }
        self.restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
