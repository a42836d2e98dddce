//! Execution contexts and child input resolution
//!
//! Every node invocation gets a fresh [`ExecutionContext`] with its own
//! execution id. Child contexts point at their parent through an `Arc`, so
//! building one is O(1) regardless of nesting depth and a child can never
//! mutate its parent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::types::{GraphEdge, NodeDefinition, NodeId};

/// Callback through which an executor reports its own progress
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<dyn Fn(f64, Option<String>) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(report: impl Fn(f64, Option<String>) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(report) }
    }

    pub fn report(&self, progress: f64, message: Option<String>) {
        (self.inner)(progress, message)
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressReporter")
    }
}

/// Context handed to a single node invocation
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub node_id: NodeId,
    /// Unique per node invocation
    pub execution_id: String,
    /// Execution id of the top-level call that started this run
    pub run_id: String,
    /// Shared read-only variables
    pub variables: Arc<HashMap<String, Value>>,
    pub input: Value,
    pub parent: Option<Arc<ExecutionContext>>,
    pub debug: bool,
    /// Artificial delay inserted before each node invocation
    pub slow_mo: Option<Duration>,
    cancellation: CancellationToken,
    progress: Option<ProgressReporter>,
}

impl ExecutionContext {
    /// Create the context for a top-level invocation
    pub fn root(node_id: impl Into<String>, input: Value) -> Self {
        let execution_id = new_execution_id();
        Self {
            node_id: node_id.into(),
            run_id: execution_id.clone(),
            execution_id,
            variables: Arc::new(HashMap::new()),
            input,
            parent: None,
            debug: false,
            slow_mo: None,
            cancellation: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self.run_id = self.execution_id.clone();
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = Arc::new(variables);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_slow_mo(mut self, slow_mo: Option<Duration>) -> Self {
        self.slow_mo = slow_mo.filter(|d| !d.is_zero());
        self
    }

    pub fn with_progress_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Run-scoped cancellation token
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Report progress (0-100) for this node; ignored when nobody listens
    pub fn report_progress(&self, progress: f64, message: Option<String>) {
        if let Some(reporter) = &self.progress {
            reporter.report(progress, message);
        }
    }

    /// Number of ancestors
    pub fn depth(&self) -> usize {
        self.ancestors().count()
    }

    /// Parent, grandparent, ... up to the root
    pub fn ancestors(&self) -> impl Iterator<Item = &ExecutionContext> {
        std::iter::successors(self.parent.as_deref(), |ctx| ctx.parent.as_deref())
    }

    /// Serializable view for results and transports
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            node_id: self.node_id.clone(),
            execution_id: self.execution_id.clone(),
            run_id: self.run_id.clone(),
            parent_execution_id: self.parent.as_ref().map(|p| p.execution_id.clone()),
            depth: self.depth(),
            variables: (*self.variables).clone(),
            input: self.input.clone(),
        }
    }
}

/// Serializable copy of an [`ExecutionContext`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub node_id: NodeId,
    pub execution_id: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    pub depth: usize,
    pub variables: HashMap<String, Value>,
    pub input: Value,
}

/// Fresh execution id for one invocation
pub fn new_execution_id() -> String {
    format!("exec-{}", uuid::Uuid::new_v4())
}

/// Context for a child node invocation
///
/// Variables, debug, slow-mo and cancellation are inherited unchanged; the
/// parent is referenced, not copied; the execution id is new.
pub fn build_child_execution_context(
    child: &NodeDefinition,
    parent: &Arc<ExecutionContext>,
    input: Value,
) -> ExecutionContext {
    ExecutionContext {
        node_id: child.id.clone(),
        execution_id: new_execution_id(),
        run_id: parent.run_id.clone(),
        variables: Arc::clone(&parent.variables),
        input,
        parent: Some(Arc::clone(parent)),
        debug: parent.debug,
        slow_mo: parent.slow_mo,
        cancellation: parent.cancellation.clone(),
        progress: None,
    }
}

/// Resolve a child's input from its incoming edges
///
/// Each edge whose source already produced output contributes that whole
/// output under the edge's target handle (or `"input"`). If no edge
/// contributes, the parent input is passed through unchanged.
pub fn build_child_node_input(
    child_id: &str,
    edges: &[GraphEdge],
    node_outputs: &HashMap<NodeId, Value>,
    parent_input: &Value,
) -> Value {
    let mut input = Map::new();
    for edge in edges.iter().filter(|e| e.target == child_id) {
        if let Some(output) = node_outputs.get(&edge.source) {
            input.insert(edge.input_key().to_string(), output.clone());
        }
    }

    if input.is_empty() {
        parent_input.clone()
    } else {
        Value::Object(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_child_context_inherits_and_links_parent() {
        let mut vars = HashMap::new();
        vars.insert("region".to_string(), json!("eu"));
        let token = CancellationToken::new();
        let root = Arc::new(
            ExecutionContext::root("root", json!({"seed": 1}))
                .with_variables(vars)
                .with_debug(true)
                .with_slow_mo(Some(Duration::from_millis(5)))
                .with_cancellation(token.clone()),
        );

        let child_def = NodeDefinition::new("child", "transform");
        let child = build_child_execution_context(&child_def, &root, json!("payload"));

        assert_eq!(child.node_id, "child");
        assert_ne!(child.execution_id, root.execution_id);
        assert_eq!(child.run_id, root.run_id);
        assert_eq!(child.get_variable("region"), Some(&json!("eu")));
        assert!(Arc::ptr_eq(&child.variables, &root.variables));
        assert!(Arc::ptr_eq(child.parent.as_ref().unwrap(), &root));
        assert!(child.debug);
        assert_eq!(child.slow_mo, Some(Duration::from_millis(5)));
        assert_eq!(child.input, json!("payload"));

        token.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_depth_and_ancestors() {
        let root = Arc::new(ExecutionContext::root("root", Value::Null));
        let mid = Arc::new(build_child_execution_context(
            &NodeDefinition::composite("mid"),
            &root,
            Value::Null,
        ));
        let leaf = build_child_execution_context(&NodeDefinition::new("leaf", "x"), &mid, Value::Null);

        assert_eq!(root.depth(), 0);
        assert_eq!(leaf.depth(), 2);
        let chain: Vec<&str> = leaf.ancestors().map(|c| c.node_id.as_str()).collect();
        assert_eq!(chain, vec!["mid", "root"]);

        let snapshot = leaf.snapshot();
        assert_eq!(snapshot.parent_execution_id.as_deref(), Some(mid.execution_id.as_str()));
        assert_eq!(snapshot.depth, 2);
    }

    #[test]
    fn test_edge_output_keyed_by_handle() {
        let edges = vec![GraphEdge::new("e1", "a", "b").with_target_handle("data")];
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!({"x": 1}));

        let input = build_child_node_input("b", &edges, &outputs, &json!({"parent": true}));
        assert_eq!(input, json!({"data": {"x": 1}}));
    }

    #[test]
    fn test_default_handle_and_multiple_edges() {
        let edges = vec![
            GraphEdge::new("e1", "a", "c"),
            GraphEdge::new("e2", "b", "c").with_target_handle("extra"),
        ];
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!(1));
        outputs.insert("b".to_string(), json!(2));

        let input = build_child_node_input("c", &edges, &outputs, &Value::Null);
        assert_eq!(input, json!({"input": 1, "extra": 2}));
    }

    #[test]
    fn test_missing_source_output_falls_back_to_parent_input() {
        let edges = vec![GraphEdge::new("e1", "a", "b")];
        let outputs = HashMap::new();
        let parent_input = json!({"passthrough": [1, 2, 3]});

        let input = build_child_node_input("b", &edges, &outputs, &parent_input);
        assert_eq!(input, parent_input);
    }

    #[test]
    fn test_progress_reporter_forwards() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx = ExecutionContext::root("n", Value::Null)
            .with_progress_reporter(ProgressReporter::new(move |p, _| sink.lock().push(p)));

        ctx.report_progress(40.0, None);
        assert_eq!(*seen.lock(), vec![40.0]);

        // No reporter: silently ignored
        ExecutionContext::root("m", Value::Null).report_progress(10.0, None);
    }
}
