//! Execution orchestrator
//!
//! Runs a node definition tree. Atomic nodes are validated, invoked with a
//! timeout and retried with a flat delay. Composite nodes are analyzed into
//! topological batches and their children run batch by batch, sequentially
//! or concurrently, with their own [`ExecutionGraphStore`]. Nested
//! composites recurse and forward their progress to the parent store.
//!
//! A child failure halts the composite: members of the current batch that
//! are already running settle, nothing else starts, and every node still
//! pending is marked skipped.
//!
//! The top-level [`Orchestrator::execute`] never fails; every error ends up
//! in the returned [`ExecutionResult`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::analyzer::{analyze_with_weights, ExecutionPlan, WeightTable};
use crate::config::EngineConfig;
use crate::context::{
    build_child_execution_context, build_child_node_input, ContextSnapshot, ExecutionContext, ProgressReporter,
};
use crate::debug::{DebugAction, DebugController, DebugPlan, NoopDebugController};
use crate::error::{EngineError, ErrorCode, ExecutionError, Result};
use crate::events::{EventSink, ExecutionEvent, NullEventSink};
use crate::registry::{ExecutorRegistry, NodeExecutor};
use crate::store::{ExecutionGraphNode, ExecutionGraphState, ExecutionGraphStore, NodeState};
use crate::types::{NodeDefinition, NodeId};
use crate::validation::validate_executor;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    Failed,
    /// Stopped by its cancellation token; neither success nor error
    Cancelled,
}

/// Final report of a top-level run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub outcome: ExecutionOutcome,
    pub output: Value,
    /// Every node that started, descendants before their composite
    pub executed_node_ids: Vec<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSnapshot>,
    /// Final graph state when the executed node was a composite
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<ExecutionGraphState>,
}

impl ExecutionResult {
    /// Failed result for a run that never reached the engine
    pub fn from_error(error: ExecutionError) -> Self {
        Self {
            success: false,
            outcome: ExecutionOutcome::Failed,
            output: Value::Null,
            executed_node_ids: Vec::new(),
            error: Some(error),
            duration_ms: 0,
            context: None,
            graph: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == ExecutionOutcome::Cancelled
    }

    /// Final record of a node anywhere in the executed tree
    pub fn node(&self, node_id: &str) -> Option<&ExecutionGraphNode> {
        self.graph.as_ref().and_then(|g| g.find_node(node_id))
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.node(node_id).map(|n| n.state)
    }
}

/// Per-call options for [`Orchestrator::execute_with`]
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub execution_id: Option<String>,
    pub variables: HashMap<String, Value>,
    pub cancellation: Option<CancellationToken>,
    /// Overrides [`EngineConfig::debug`]
    pub debug: Option<bool>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }
}

/// Builder for [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    registry: Option<ExecutorRegistry>,
    events: Option<Arc<dyn EventSink>>,
    debug: Option<Arc<dyn DebugController>>,
    config: Option<EngineConfig>,
}

impl OrchestratorBuilder {
    pub fn registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Install a debug controller; this also turns debug mode on
    pub fn debug_controller(mut self, controller: Arc<dyn DebugController>) -> Self {
        self.debug = Some(controller);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Orchestrator {
        let mut config = self.config.unwrap_or_default();
        if let Err(e) = config.validate() {
            log::warn!("Engine config is invalid, running anyway: {}", e);
        }
        if self.debug.is_some() {
            config.debug = true;
        }
        let weights = config.weight_table();

        Orchestrator {
            registry: self.registry,
            events: self.events.unwrap_or_else(|| Arc::new(NullEventSink)),
            debug: self.debug.unwrap_or_else(|| Arc::new(NoopDebugController)),
            config,
            weights,
        }
    }
}

/// Drives runs of node definition trees
///
/// One orchestrator can serve many runs, concurrently if wanted. Each run
/// owns its stores; the orchestrator itself holds only immutable state.
pub struct Orchestrator {
    registry: Option<ExecutorRegistry>,
    events: Arc<dyn EventSink>,
    debug: Arc<dyn DebugController>,
    config: EngineConfig,
    weights: WeightTable,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Orchestrator with a registry and everything else defaulted
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self::builder().registry(registry).build()
    }

    pub fn registry(&self) -> Option<&ExecutorRegistry> {
        self.registry.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a node tree with default options
    pub async fn execute(&self, node: &NodeDefinition, input: Value) -> ExecutionResult {
        self.execute_with(node, input, RunOptions::default()).await
    }

    /// Execute a node tree
    pub async fn execute_with(&self, node: &NodeDefinition, input: Value, options: RunOptions) -> ExecutionResult {
        let started = Instant::now();

        let mut root = ExecutionContext::root(node.id.clone(), input)
            .with_variables(options.variables)
            .with_cancellation(options.cancellation.unwrap_or_default())
            .with_debug(options.debug.unwrap_or(self.config.debug))
            .with_slow_mo(self.config.slow_mo());
        if let Some(id) = options.execution_id {
            root = root.with_execution_id(id);
        }
        if !node.is_composite() {
            let reporter = self.atomic_reporter(&node.id, &root.execution_id);
            root = root.with_progress_reporter(reporter);
        }
        let ctx = Arc::new(root);

        let debug_plan = if ctx.debug {
            self.debug.plan(&node.atomic_ids())
        } else {
            DebugPlan::default()
        };

        log::info!(
            "Executing '{}' ({} nodes) as {}",
            node.id,
            node.tree_size(),
            ctx.execution_id
        );

        let run = if node.is_composite() {
            self.run_composite(node, Arc::clone(&ctx), &debug_plan).await
        } else {
            self.run_root_atomic(node, &ctx, &debug_plan).await
        };

        let result = run.into_result(ctx.snapshot(), elapsed_ms(started));
        match result.outcome {
            ExecutionOutcome::Completed => log::info!("'{}' completed in {}ms", node.id, result.duration_ms),
            ExecutionOutcome::Cancelled => log::info!("'{}' cancelled after {}ms", node.id, result.duration_ms),
            ExecutionOutcome::Failed => log::warn!(
                "'{}' failed after {}ms: {}",
                node.id,
                result.duration_ms,
                result.error.as_ref().map(ToString::to_string).unwrap_or_default()
            ),
        }
        result
    }

    async fn run_root_atomic(&self, node: &NodeDefinition, ctx: &ExecutionContext, debug_plan: &DebugPlan) -> NodeRun {
        if ctx.is_cancelled() {
            self.emit_cancel(&node.id, &ctx.execution_id, false);
            return NodeRun::cancelled(&node.id, Vec::new(), None);
        }

        let action = debug_plan.action_for(&node.id);
        self.emit_start(&node.id, &ctx.execution_id, false);
        let started = Instant::now();
        let executed = vec![node.id.clone()];

        match self.run_atomic(node, ctx, action).await {
            Ok(output) => {
                self.emit_complete(&node.id, &ctx.execution_id, elapsed_ms(started), false);
                NodeRun::completed(output, executed, None)
            }
            Err(EngineError::Cancelled) => {
                self.emit_cancel(&node.id, &ctx.execution_id, false);
                NodeRun::cancelled(&node.id, executed, None)
            }
            Err(err) => {
                self.emit_error(&node.id, &ctx.execution_id, &err.to_string(), false);
                NodeRun::failed(ExecutionError::from_engine(&node.id, &err), executed, None)
            }
        }
    }

    /// Validate, then invoke with timeout and retries
    async fn run_atomic(&self, node: &NodeDefinition, ctx: &ExecutionContext, action: DebugAction) -> Result<Value> {
        let executor = validate_executor(self.registry.as_ref(), node)?;
        let policy = node.retry.unwrap_or_else(|| self.config.default_retry());
        let timeout = node
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.default_timeout());

        if let Some(delay) = ctx.slow_mo {
            tokio::time::sleep(delay).await;
        }

        let mut attempt = 0;
        loop {
            match self.invoke_once(node, executor.as_ref(), ctx, action, timeout).await {
                Ok(output) => return Ok(output),
                Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "Node '{}' failed (attempt {}/{}): {}; retrying in {}ms",
                        node.id,
                        attempt,
                        policy.max_retries + 1,
                        err,
                        policy.retry_delay_ms
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(policy.retry_delay()) => {}
                        _ = ctx.cancellation().cancelled() => {
                            log::debug!("Abandoning retries of '{}', run cancelled", node.id);
                            return Err(EngineError::Cancelled);
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn invoke_once(
        &self,
        node: &NodeDefinition,
        executor: &dyn NodeExecutor,
        ctx: &ExecutionContext,
        action: DebugAction,
        timeout: Duration,
    ) -> Result<Value> {
        let invocation = async {
            if let Some(delay) = action.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some((category, delay)) = action.fail {
                tokio::time::sleep(delay).await;
                return Err(EngineError::DebugSimulated {
                    node_id: node.id.clone(),
                    category,
                });
            }
            executor.execute(ctx).await
        };

        match tokio::time::timeout(timeout, invocation).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                node_id: node.id.clone(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    fn run_composite<'a>(
        &'a self,
        node: &'a NodeDefinition,
        ctx: Arc<ExecutionContext>,
        debug_plan: &'a DebugPlan,
    ) -> BoxFuture<'a, NodeRun> {
        async move {
            let started = Instant::now();
            let execution_id = ctx.execution_id.clone();
            self.emit_start(&node.id, &execution_id, true);

            let plan = match unique_children(node)
                .and_then(|()| analyze_with_weights(&node.children, &node.edges, &self.weights))
            {
                Ok(plan) => plan,
                Err(err) => {
                    log::error!("Composite '{}' cannot run: {}", node.id, err);
                    self.emit_error(&node.id, &execution_id, &err.to_string(), true);
                    return NodeRun::failed(ExecutionError::from_engine(&node.id, &err), Vec::new(), None);
                }
            };

            let run = Arc::new(CompositeRun::new(node, &plan, Arc::clone(&ctx), Arc::clone(&self.events)));
            run.mutate(|store| {
                store.start_execution();
                true
            });

            let mut outputs: HashMap<NodeId, Value> = HashMap::new();
            let mut executed = Vec::new();
            let mut failure: Option<ExecutionError> = None;
            let mut cancelled = false;
            let mut last_completed: Option<NodeId> = None;

            for (index, batch) in plan.execution_order.iter().enumerate() {
                if ctx.is_cancelled() {
                    cancelled = true;
                    break;
                }
                log::debug!("'{}' batch {}: {:?}", node.id, index, batch);

                let members: Vec<&NodeDefinition> = batch.iter().filter_map(|id| node.find_child(id)).collect();
                let settled = if node.parallel {
                    self.run_batch_parallel(&run, node, &members, &outputs, debug_plan).await
                } else {
                    self.run_batch_sequential(&run, node, &members, &outputs, debug_plan).await
                };

                for child in settled {
                    executed.extend(child.executed);
                    cancelled |= child.cancelled;
                    match child.result {
                        Ok(output) => {
                            outputs.insert(child.node_id.clone(), output);
                            last_completed = Some(child.node_id);
                        }
                        Err(err) if !child.cancelled && failure.is_none() => failure = Some(err),
                        Err(_) => {}
                    }
                }

                if failure.is_some() || cancelled {
                    break;
                }
            }

            let mut skipped = Vec::new();
            run.mutate(|store| {
                skipped = store.skip_pending();
                !skipped.is_empty()
            });
            if !skipped.is_empty() {
                log::debug!("'{}' skipped {:?}", node.id, skipped);
                if ctx.is_cancelled() {
                    cancelled = true;
                }
            }
            run.mutate(|store| {
                store.complete_execution();
                true
            });

            let graph = run.snapshot();
            executed.push(node.id.clone());
            let duration = elapsed_ms(started);

            if cancelled {
                self.emit_cancel(&node.id, &execution_id, true);
                return NodeRun::cancelled(&node.id, executed, Some(graph)).with_failure(failure);
            }
            if let Some(err) = failure {
                self.emit_error(&node.id, &execution_id, &err.message, true);
                return NodeRun::failed(err, executed, Some(graph));
            }

            self.emit_complete(&node.id, &execution_id, duration, true);
            let output = composite_output(node, &plan, &outputs, last_completed.as_deref(), &ctx.input);
            NodeRun::completed(output, executed, Some(graph))
        }
        .boxed()
    }

    /// Members in declared order; stops at the first failure or cancellation
    async fn run_batch_sequential(
        &self,
        run: &Arc<CompositeRun>,
        node: &NodeDefinition,
        members: &[&NodeDefinition],
        outputs: &HashMap<NodeId, Value>,
        debug_plan: &DebugPlan,
    ) -> Vec<ChildRun> {
        let mut settled = Vec::with_capacity(members.len());
        for child in members {
            if run.ctx.is_cancelled() {
                break;
            }
            let input = build_child_node_input(&child.id, &node.edges, outputs, &run.ctx.input);
            let child_run = self.run_child(run, child, input, debug_plan).await;
            let halt = child_run.result.is_err();
            settled.push(child_run);
            if halt {
                log::debug!("Halting '{}' after failure of '{}'", node.id, child.id);
                break;
            }
        }
        settled
    }

    /// Members awaited together, optionally capped by `max_concurrency`
    ///
    /// A member that hasn't started when a sibling fails never starts.
    async fn run_batch_parallel(
        &self,
        run: &Arc<CompositeRun>,
        node: &NodeDefinition,
        members: &[&NodeDefinition],
        outputs: &HashMap<NodeId, Value>,
        debug_plan: &DebugPlan,
    ) -> Vec<ChildRun> {
        let limit = node.max_concurrency.filter(|n| *n > 0).map(Semaphore::new);
        let halted = AtomicBool::new(false);

        let pending = members.iter().map(|child| {
            let limit = limit.as_ref();
            let halted = &halted;
            async move {
                let _permit = match limit {
                    Some(semaphore) => semaphore.acquire().await.ok(),
                    None => None,
                };
                if halted.load(Ordering::SeqCst) || run.ctx.is_cancelled() {
                    return None;
                }
                let input = build_child_node_input(&child.id, &node.edges, outputs, &run.ctx.input);
                let child_run = self.run_child(run, child, input, debug_plan).await;
                if child_run.result.is_err() {
                    halted.store(true, Ordering::SeqCst);
                }
                Some(child_run)
            }
        });

        join_all(pending).await.into_iter().flatten().collect()
    }

    async fn run_child(
        &self,
        run: &Arc<CompositeRun>,
        child: &NodeDefinition,
        input: Value,
        debug_plan: &DebugPlan,
    ) -> ChildRun {
        let child_ctx = build_child_execution_context(child, &run.ctx, input);
        let execution_id = child_ctx.execution_id.clone();
        let child_ctx =
            child_ctx.with_progress_reporter(run.child_reporter(&child.id, &execution_id, child.is_composite()));

        if child.is_composite() {
            run.mutate(|store| store.start_node(&child.id));
            let nested = self.run_composite(child, Arc::new(child_ctx), debug_plan).await;
            if let Some(graph) = nested.graph {
                run.attach_nested(&child.id, graph);
            }
            if nested.cancelled {
                run.mutate(|store| store.cancel_node(&child.id));
            } else {
                match &nested.result {
                    Ok(_) => run.mutate(|store| store.complete_node(&child.id)),
                    Err(err) => run.mutate(|store| store.error_node(&child.id, err.message.clone())),
                };
            }
            return ChildRun {
                node_id: child.id.clone(),
                result: nested.result,
                executed: nested.executed,
                cancelled: nested.cancelled,
            };
        }

        self.emit_start(&child.id, &execution_id, false);
        run.mutate(|store| store.start_node(&child.id));
        let started = Instant::now();
        let executed = vec![child.id.clone()];

        match self.run_atomic(child, &child_ctx, debug_plan.action_for(&child.id)).await {
            Ok(output) => {
                log::debug!("Node '{}' completed in {}ms", child.id, elapsed_ms(started));
                run.mutate(|store| store.complete_node(&child.id));
                self.emit_complete(&child.id, &execution_id, elapsed_ms(started), false);
                ChildRun {
                    node_id: child.id.clone(),
                    result: Ok(output),
                    executed,
                    cancelled: false,
                }
            }
            Err(EngineError::Cancelled) => {
                run.mutate(|store| store.cancel_node(&child.id));
                self.emit_cancel(&child.id, &execution_id, false);
                ChildRun {
                    node_id: child.id.clone(),
                    result: Err(ExecutionError::from_engine(&child.id, &EngineError::Cancelled)),
                    executed,
                    cancelled: true,
                }
            }
            Err(err) => {
                log::error!("Node '{}' failed: {}", child.id, err);
                run.mutate(|store| store.error_node(&child.id, err.to_string()));
                self.emit_error(&child.id, &execution_id, &err.to_string(), false);
                ChildRun {
                    node_id: child.id.clone(),
                    result: Err(ExecutionError::from_engine(&child.id, &err)),
                    executed,
                    cancelled: false,
                }
            }
        }
    }

    fn atomic_reporter(&self, node_id: &str, execution_id: &str) -> ProgressReporter {
        let events = Arc::clone(&self.events);
        let node_id = node_id.to_string();
        let execution_id = execution_id.to_string();
        ProgressReporter::new(move |progress, message| {
            let _ = events.send(ExecutionEvent::progress(
                &node_id,
                &execution_id,
                percent(progress),
                message,
                false,
            ));
        })
    }

    fn emit_start(&self, node_id: &str, execution_id: &str, composite: bool) {
        let _ = self.events.send(ExecutionEvent::ExecuteStart {
            node_id: node_id.to_string(),
            execution_id: execution_id.to_string(),
            composite,
        });
    }

    fn emit_complete(&self, node_id: &str, execution_id: &str, duration_ms: u64, composite: bool) {
        let _ = self.events.send(ExecutionEvent::Complete {
            node_id: node_id.to_string(),
            execution_id: execution_id.to_string(),
            duration_ms,
            composite,
        });
    }

    fn emit_error(&self, node_id: &str, execution_id: &str, error: &str, composite: bool) {
        let _ = self.events.send(ExecutionEvent::Error {
            node_id: node_id.to_string(),
            execution_id: execution_id.to_string(),
            error: error.to_string(),
            composite,
        });
    }

    fn emit_cancel(&self, node_id: &str, execution_id: &str, composite: bool) {
        let _ = self.events.send(ExecutionEvent::Cancel {
            node_id: node_id.to_string(),
            execution_id: execution_id.to_string(),
            composite,
        });
    }
}

/// State shared by one composite run and the progress reporters of its children
struct CompositeRun {
    node_id: NodeId,
    execution_id: String,
    ctx: Arc<ExecutionContext>,
    store: Mutex<ExecutionGraphStore>,
    events: Arc<dyn EventSink>,
}

impl CompositeRun {
    fn new(
        node: &NodeDefinition,
        plan: &ExecutionPlan,
        ctx: Arc<ExecutionContext>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            node_id: node.id.clone(),
            execution_id: ctx.execution_id.clone(),
            store: Mutex::new(ExecutionGraphStore::new(plan, &node.children, Some(node.id.as_str()))),
            ctx,
            events,
        }
    }

    /// Apply a store mutation and publish progress if it took effect
    fn mutate(&self, f: impl FnOnce(&mut ExecutionGraphStore) -> bool) -> bool {
        let changed = {
            let mut store = self.store.lock();
            f(&mut *store)
        };
        if changed {
            self.publish();
        }
        changed
    }

    /// Emit this composite's progress and forward it to the parent run
    fn publish(&self) {
        let progress = self.store.lock().progress();
        let _ = self.events.send(ExecutionEvent::progress(
            &self.node_id,
            &self.execution_id,
            progress,
            None,
            true,
        ));
        self.ctx.report_progress(f64::from(progress), None);
    }

    fn attach_nested(&self, node_id: &str, graph: ExecutionGraphState) {
        self.store.lock().attach_nested(node_id, graph);
    }

    fn snapshot(&self) -> ExecutionGraphState {
        self.store.lock().snapshot()
    }

    fn child_reporter(self: &Arc<Self>, child_id: &str, execution_id: &str, composite: bool) -> ProgressReporter {
        let run = Arc::clone(self);
        let child_id = child_id.to_string();
        let execution_id = execution_id.to_string();
        ProgressReporter::new(move |progress, message| {
            let recorded = {
                let mut store = run.store.lock();
                if !store.update_node_progress(&child_id, progress, message.clone()) {
                    return;
                }
                store.node(&child_id).map_or(progress, |n| n.progress)
            };
            // Nested composites report their own progress events
            if !composite {
                let _ = run.events.send(ExecutionEvent::progress(
                    &child_id,
                    &execution_id,
                    percent(recorded),
                    message,
                    false,
                ));
            }
            run.publish();
        })
    }
}

/// Outcome of one node (atomic or composite) inside the engine
struct NodeRun {
    result: std::result::Result<Value, ExecutionError>,
    executed: Vec<NodeId>,
    graph: Option<ExecutionGraphState>,
    cancelled: bool,
}

impl NodeRun {
    fn completed(output: Value, executed: Vec<NodeId>, graph: Option<ExecutionGraphState>) -> Self {
        Self {
            result: Ok(output),
            executed,
            graph,
            cancelled: false,
        }
    }

    fn failed(error: ExecutionError, executed: Vec<NodeId>, graph: Option<ExecutionGraphState>) -> Self {
        Self {
            result: Err(error),
            executed,
            graph,
            cancelled: false,
        }
    }

    fn cancelled(node_id: &str, executed: Vec<NodeId>, graph: Option<ExecutionGraphState>) -> Self {
        Self {
            result: Err(ExecutionError::from_engine(node_id, &EngineError::Cancelled)),
            executed,
            graph,
            cancelled: true,
        }
    }

    /// Keep a failure that happened before the cancellation
    fn with_failure(mut self, failure: Option<ExecutionError>) -> Self {
        if let Some(err) = failure {
            self.result = Err(err);
        }
        self
    }

    fn into_result(self, context: ContextSnapshot, duration_ms: u64) -> ExecutionResult {
        let outcome = match (&self.result, self.cancelled) {
            (_, true) => ExecutionOutcome::Cancelled,
            (Ok(_), false) => ExecutionOutcome::Completed,
            (Err(_), false) => ExecutionOutcome::Failed,
        };
        let (output, error) = match self.result {
            Ok(output) => (output, None),
            Err(err) if err.code == Some(ErrorCode::Cancelled) => (Value::Null, None),
            Err(err) => (Value::Null, Some(err)),
        };

        ExecutionResult {
            success: outcome == ExecutionOutcome::Completed,
            outcome,
            output,
            executed_node_ids: self.executed,
            error,
            duration_ms,
            context: Some(context),
            graph: self.graph,
        }
    }
}

/// Settled child of a composite batch
struct ChildRun {
    node_id: NodeId,
    result: std::result::Result<Value, ExecutionError>,
    executed: Vec<NodeId>,
    cancelled: bool,
}

/// Explicit output node, else the critical path terminal, else the last
/// child that completed. An empty composite passes its input through.
fn composite_output(
    node: &NodeDefinition,
    plan: &ExecutionPlan,
    outputs: &HashMap<NodeId, Value>,
    last_completed: Option<&str>,
    input: &Value,
) -> Value {
    if node.children.is_empty() {
        return input.clone();
    }
    if let Some(id) = &node.output_node {
        return outputs.get(id).cloned().unwrap_or(Value::Null);
    }
    plan.critical_path
        .last()
        .and_then(|id| outputs.get(id))
        .or_else(|| last_completed.and_then(|id| outputs.get(id)))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Children of one composite must have distinct ids
fn unique_children(node: &NodeDefinition) -> Result<()> {
    let mut seen = HashSet::new();
    match node.children.iter().find(|c| !seen.insert(c.id.as_str())) {
        Some(duplicate) => Err(EngineError::DuplicateNodeId {
            parent_id: node.id.clone(),
            node_id: duplicate.id.clone(),
        }),
        None => Ok(()),
    }
}

fn percent(progress: f64) -> u8 {
    if progress.is_nan() {
        0
    } else {
        progress.clamp(0.0, 100.0).round() as u8
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
