//! Weighted progress calculation
//!
//! Progress is a pure function of a node-state snapshot. The store calls
//! [`calculate_progress`] after every mutation and caches the result.

use crate::store::{ExecutionGraphState, NodeState};

/// Overall progress as an integer percentage in `0..=100`
///
/// Completed and skipped nodes count their full weight, executing nodes
/// count `weight * progress / 100`, pending and failed nodes count nothing.
pub fn calculate_progress(state: &ExecutionGraphState) -> u8 {
    if state.nodes.is_empty() || state.total_weight <= 0.0 {
        return 0;
    }

    let earned: f64 = state
        .nodes
        .values()
        .map(|node| match node.state {
            NodeState::Completed | NodeState::Skipped => node.weight,
            NodeState::Executing => node.weight * (node.progress.clamp(0.0, 100.0) / 100.0),
            NodeState::Pending | NodeState::Error => 0.0,
        })
        .sum();

    let percent = (earned / state.total_weight * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}
