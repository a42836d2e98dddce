//! Fault injection for deterministic testing
//!
//! A [`DebugController`] is consulted right before a real executor would be
//! invoked. It can make a node fail with a simulated error or run longer
//! than it would. It never touches scheduling or progress.

use std::collections::HashMap;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Category reported by a simulated failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Validation,
    Runtime,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Runtime => "runtime",
        };
        f.write_str(name)
    }
}

/// Which node a simulation applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugTarget {
    /// The node with this id
    Node(NodeId),
    /// One atomic node picked at random per composite run
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedError {
    pub target: DebugTarget,
    pub category: ErrorCategory,
    /// Delay before the failure is reported
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedDelay {
    pub target: DebugTarget,
    pub delay_ms: u64,
}

/// Simulations for a single run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebugConfig {
    pub simulate_error: Option<SimulatedError>,
    pub simulate_long_running: Option<SimulatedDelay>,
}

impl DebugConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_node(mut self, node_id: impl Into<String>, category: ErrorCategory, delay_ms: u64) -> Self {
        self.simulate_error = Some(SimulatedError {
            target: DebugTarget::Node(node_id.into()),
            category,
            delay_ms,
        });
        self
    }

    pub fn fail_random(mut self, category: ErrorCategory, delay_ms: u64) -> Self {
        self.simulate_error = Some(SimulatedError {
            target: DebugTarget::Random,
            category,
            delay_ms,
        });
        self
    }

    pub fn slow_node(mut self, node_id: impl Into<String>, delay_ms: u64) -> Self {
        self.simulate_long_running = Some(SimulatedDelay {
            target: DebugTarget::Node(node_id.into()),
            delay_ms,
        });
        self
    }

    pub fn slow_random(mut self, delay_ms: u64) -> Self {
        self.simulate_long_running = Some(SimulatedDelay {
            target: DebugTarget::Random,
            delay_ms,
        });
        self
    }

    pub fn is_active(&self) -> bool {
        self.simulate_error.is_some() || self.simulate_long_running.is_some()
    }
}

/// What to do instead of (or before) invoking a node's executor
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DebugAction {
    /// Extra time the invocation takes
    pub delay: Option<Duration>,
    /// Fail with this category after `delay` and the error's own delay
    pub fail: Option<(ErrorCategory, Duration)>,
}

impl DebugAction {
    pub fn is_noop(&self) -> bool {
        self.delay.is_none() && self.fail.is_none()
    }
}

/// Actions resolved for the atomic children of one composite run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugPlan {
    actions: HashMap<NodeId, DebugAction>,
}

impl DebugPlan {
    pub fn action_for(&self, node_id: &str) -> DebugAction {
        self.actions.get(node_id).copied().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Source of simulated behavior
///
/// `plan` is called once per top-level run with the ids of every atomic
/// node in the tree, so a random target picks one node for the whole run.
pub trait DebugController: Send + Sync {
    fn plan(&self, node_ids: &[NodeId]) -> DebugPlan;
}

/// Controller that never simulates anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDebugController;

impl DebugController for NoopDebugController {
    fn plan(&self, _node_ids: &[NodeId]) -> DebugPlan {
        DebugPlan::default()
    }
}

impl DebugController for DebugConfig {
    fn plan(&self, node_ids: &[NodeId]) -> DebugPlan {
        let mut plan = DebugPlan::default();
        if node_ids.is_empty() {
            return plan;
        }

        if let Some(slow) = &self.simulate_long_running {
            if let Some(id) = resolve_target(&slow.target, node_ids) {
                log::debug!("Debug: node '{}' will take an extra {}ms", id, slow.delay_ms);
                plan.actions.entry(id).or_default().delay = Some(Duration::from_millis(slow.delay_ms));
            }
        }

        if let Some(error) = &self.simulate_error {
            if let Some(id) = resolve_target(&error.target, node_ids) {
                log::debug!("Debug: node '{}' will fail with a {} error", id, error.category);
                plan.actions.entry(id).or_default().fail =
                    Some((error.category, Duration::from_millis(error.delay_ms)));
            }
        }

        plan
    }
}

fn resolve_target(target: &DebugTarget, node_ids: &[NodeId]) -> Option<NodeId> {
    match target {
        DebugTarget::Node(id) => node_ids.iter().find(|n| *n == id).cloned(),
        DebugTarget::Random => node_ids.choose(&mut rand::thread_rng()).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<NodeId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_noop_is_inert() {
        let plan = NoopDebugController.plan(&ids(&["a", "b"]));
        assert!(plan.is_empty());
        assert!(plan.action_for("a").is_noop());
    }

    #[test]
    fn test_named_targets() {
        let config = DebugConfig::new()
            .fail_node("b", ErrorCategory::Network, 5)
            .slow_node("a", 100);
        let plan = config.plan(&ids(&["a", "b", "c"]));

        assert_eq!(plan.action_for("a").delay, Some(Duration::from_millis(100)));
        assert_eq!(
            plan.action_for("b").fail,
            Some((ErrorCategory::Network, Duration::from_millis(5)))
        );
        assert!(plan.action_for("c").is_noop());
    }

    #[test]
    fn test_named_target_outside_run_is_ignored() {
        let config = DebugConfig::new().fail_node("elsewhere", ErrorCategory::Runtime, 0);
        assert!(config.plan(&ids(&["a"])).is_empty());
    }

    #[test]
    fn test_random_target_picks_exactly_one_member() {
        let candidates = ids(&["a", "b", "c", "d"]);
        let config = DebugConfig::new().fail_random(ErrorCategory::Validation, 0);
        for _ in 0..20 {
            let plan = config.plan(&candidates);
            let failing: Vec<&NodeId> = candidates
                .iter()
                .filter(|id| plan.action_for(id).fail.is_some())
                .collect();
            assert_eq!(failing.len(), 1);
        }
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Timeout.to_string(), "timeout");
        let json = serde_json::to_value(DebugConfig::new().slow_random(10)).unwrap();
        assert_eq!(json["simulateLongRunning"]["target"], "random");
    }
}
