//! Nodeflow Engine - batch-scheduled workflow execution
//!
//! This crate executes declarative node trees. Atomic nodes map to
//! executors looked up by type in an [`ExecutorRegistry`]; composite nodes
//! contain child nodes and data edges and are run batch by batch in
//! dependency order. It supports:
//!
//! - Topological batching with sequential or concurrent batch members
//! - Weighted progress across nested composites
//! - Per-node timeouts and flat-delay retries
//! - Run-scoped cancellation
//! - Deterministic fault injection for tests
//!
//! # Architecture
//!
//! - [`analyzer`]: pure graph analysis (batches, weights, critical path)
//! - [`ExecutionGraphStore`]: per-composite run state with cached progress
//! - [`Orchestrator`]: drives runs and emits [`ExecutionEvent`]s to an
//!   explicit [`EventSink`]
//!
//! # Example
//!
//! ```ignore
//! use nodeflow_engine::{ExecutorRegistry, NodeDefinition, Orchestrator};
//! use serde_json::json;
//!
//! let mut registry = ExecutorRegistry::new();
//! registry.register_sync("double", |ctx| {
//!     // Wired inputs arrive under their handle, unwired ones as-is
//!     let n = ctx.input.get("input").unwrap_or(&ctx.input).as_i64().unwrap_or(0);
//!     Ok(json!(n * 2))
//! });
//!
//! let pipeline = NodeDefinition::composite("pipeline")
//!     .with_child(NodeDefinition::new("first", "double"))
//!     .with_child(NodeDefinition::new("second", "double"))
//!     .connect("first", "second");
//!
//! let result = Orchestrator::new(registry).execute(&pipeline, json!(3)).await;
//! assert!(result.success);
//! ```

pub mod analyzer;
pub mod config;
pub mod context;
pub mod debug;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod store;
pub mod types;
pub mod validation;

// Re-export key types
pub use analyzer::{analyze_execution_graph, parallel_branches, topological_sort, ExecutionPlan, WeightTable};
pub use config::EngineConfig;
pub use context::{build_child_execution_context, build_child_node_input, ContextSnapshot, ExecutionContext};
pub use debug::{DebugConfig, DebugController, ErrorCategory, NoopDebugController};
pub use error::{EngineError, ErrorCode, ExecutionError, Result};
pub use events::{BroadcastEventSink, EventSink, ExecutionEvent, NullEventSink, VecEventSink};
pub use orchestrator::{ExecutionOutcome, ExecutionResult, Orchestrator, OrchestratorBuilder, RunOptions};
pub use progress::calculate_progress;
pub use registry::{ExecutorRegistry, NodeExecutor};
pub use store::{ExecutionGraphNode, ExecutionGraphState, ExecutionGraphStore, NodeState};
pub use types::{GraphEdge, NodeDefinition, NodeId, RetryPolicy, COMPOSITE_NODE_TYPE};
pub use validation::{validate_executor, validate_node_tree, ValidationError};
