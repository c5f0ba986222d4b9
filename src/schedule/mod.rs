mod policy_chen;
mod policy_custom;
mod policy_dummy;
mod policy_gt;

use crate::graph::{topology, Graph};
use crate::types::{NodeId, ValueId};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of a checkpointing schedule. Node and value ids refer to the
/// forward graph the schedule was planned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    /// Run (or re-run) the node's forward computation.
    ComputeForward { node: NodeId },
    /// Emit the node's backward computation.
    ComputeBackward { node: NodeId },
    /// The value's materialization is no longer available.
    ForgetForward { value: ValueId },
    /// Reserved; accepted and ignored.
    ForgetBackward { value: ValueId },
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Order::ComputeForward { node } => write!(f, "ComputeForward(#{})", node.0),
            Order::ComputeBackward { node } => write!(f, "ComputeBackward(#{})", node.0),
            Order::ForgetForward { value } => write!(f, "ForgetForward(%{})", value.0),
            Order::ForgetBackward { value } => write!(f, "ForgetBackward(%{})", value.0),
        }
    }
}

/// Plans a schedule for `graph` under the named policy. Recognized names:
/// `dummy`, `dummy2`, `chen`, `gt`, and `custom_<schedule text>`.
pub fn compute_order(graph: &Graph, policy: &str) -> Result<Vec<Order>> {
    match policy {
        "dummy" => policy_dummy::dummy(graph),
        "dummy2" => policy_dummy::dummy2(graph),
        "chen" => policy_chen::chen(graph),
        "gt" => policy_gt::gt(graph),
        _ if policy.starts_with("custom_") => {
            policy_custom::custom(graph, &policy["custom_".len()..])
        }
        _ => bail!("unknown computation-order policy: {}", policy),
    }
}

/// All graph nodes in a dependency-respecting order.
pub(crate) fn forward_topo(graph: &Graph) -> Result<Vec<NodeId>> {
    let nodes: Vec<NodeId> = graph.node_ids().collect();
    Ok(topology::topological_sort(
        graph,
        &nodes,
        graph.inputs(),
        false,
    )?)
}
