//! Executor registry: node type -> executable logic
//!
//! The registry is the engine's only view of node behavior. Each entry is a
//! [`NodeExecutor`] that handles exactly one node type. The orchestrator
//! receives the registry once at construction.
//!
//! # Usage
//!
//! ```ignore
//! use nodeflow_engine::{ExecutorRegistry, Orchestrator};
//!
//! let mut registry = ExecutorRegistry::new();
//! registry.register_callback("echo", |ctx| async move { Ok(ctx.input.clone()) });
//!
//! let orchestrator = Orchestrator::builder().registry(registry).build();
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::Result;

/// Per-node-type executor
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Execute one invocation of this node type
    ///
    /// The node input is `context.input`. Long-running executors may report
    /// progress through `context.report_progress` and should watch
    /// `context.cancellation()` if they can stop early.
    async fn execute(&self, context: &ExecutionContext) -> Result<Value>;
}

type BoxedCallback =
    Box<dyn Fn(ExecutionContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Async callback-based NodeExecutor
///
/// Wraps an async closure. The closure receives its own copy of the
/// context, which is cheap because parent links and variables are shared.
pub struct CallbackNodeExecutor {
    callback: BoxedCallback,
}

impl CallbackNodeExecutor {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            callback: Box::new(move |ctx| Box::pin(callback(ctx))),
        }
    }
}

#[async_trait]
impl NodeExecutor for CallbackNodeExecutor {
    async fn execute(&self, context: &ExecutionContext) -> Result<Value> {
        (self.callback)(context.clone()).await
    }
}

/// Synchronous callback-based NodeExecutor
///
/// Wraps a synchronous closure for simpler embedding scenarios.
pub struct SyncCallbackNodeExecutor {
    callback: Box<dyn Fn(&ExecutionContext) -> Result<Value> + Send + Sync>,
}

impl SyncCallbackNodeExecutor {
    pub fn new(callback: impl Fn(&ExecutionContext) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl NodeExecutor for SyncCallbackNodeExecutor {
    async fn execute(&self, context: &ExecutionContext) -> Result<Value> {
        (self.callback)(context)
    }
}

/// Registry of executors keyed by node type
///
/// # Composability
///
/// Registries can be composed by merging:
/// ```ignore
/// let mut registry = ExecutorRegistry::new();
/// // Register built-in executors...
/// registry.merge(plugin_registry); // Add plugin executors
/// ```
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a node type, replacing any previous one
    pub fn register(&mut self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        let node_type = node_type.into();
        if self.executors.insert(node_type.clone(), executor).is_some() {
            log::debug!("Replaced executor for node type '{}'", node_type);
        }
    }

    /// Register an async closure for a node type
    pub fn register_callback<F, Fut>(&mut self, node_type: impl Into<String>, callback: F)
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(node_type, Arc::new(CallbackNodeExecutor::new(callback)));
    }

    /// Register a synchronous closure for a node type
    pub fn register_sync(
        &mut self,
        node_type: impl Into<String>,
        callback: impl Fn(&ExecutionContext) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.register(node_type, Arc::new(SyncCallbackNodeExecutor::new(callback)));
    }

    /// Get the executor for a node type
    pub fn get_executor(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    /// Check if a node type is registered
    pub fn has_node_type(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    /// List all registered node types, sorted
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Merge another registry into this one
    ///
    /// Entries from `other` override entries in `self` if they share the same node type.
    pub fn merge(&mut self, other: ExecutorRegistry) {
        self.executors.extend(other.executors);
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use serde_json::json;

    #[tokio::test]
    async fn test_sync_callback_executor() {
        let executor = SyncCallbackNodeExecutor::new(|ctx| Ok(json!({"node": ctx.node_id})));

        let ctx = ExecutionContext::root("test-1", json!(null));
        let result = executor.execute(&ctx).await.unwrap();
        assert_eq!(result["node"], "test-1");
    }

    #[tokio::test]
    async fn test_register_with_callback() {
        let mut registry = ExecutorRegistry::new();
        registry.register_callback("echo", |ctx| async move { Ok(ctx.input) });

        assert!(registry.has_node_type("echo"));
        let executor = registry.get_executor("echo").unwrap();

        let ctx = ExecutionContext::root("echo-1", json!({"value": "hello"}));
        let result = executor.execute(&ctx).await.unwrap();
        assert_eq!(result["value"], "hello");
    }

    #[test]
    fn test_unknown_type_has_no_executor() {
        let registry = ExecutorRegistry::new();
        assert!(registry.get_executor("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_merge_registries() {
        let mut registry1 = ExecutorRegistry::new();
        registry1.register_sync("node-a", |_| Ok(json!(1)));

        let mut registry2 = ExecutorRegistry::new();
        registry2.register_sync("node-b", |_| Ok(json!(2)));
        registry2.register_sync("node-c", |_| Ok(json!(3)));

        registry1.merge(registry2);
        assert_eq!(registry1.len(), 3);
        assert_eq!(registry1.node_types(), vec!["node-a", "node-b", "node-c"]);
    }

    #[tokio::test]
    async fn test_merge_override() {
        let mut registry1 = ExecutorRegistry::new();
        registry1.register_sync("node-a", |_| Ok(json!("original")));

        let mut registry2 = ExecutorRegistry::new();
        registry2.register_sync("node-a", |_| Ok(json!("override")));

        registry1.merge(registry2);
        let ctx = ExecutionContext::root("a", json!(null));
        let out = registry1.get_executor("node-a").unwrap().execute(&ctx).await.unwrap();
        assert_eq!(out, json!("override"));
    }
}
