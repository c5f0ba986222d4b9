use crate::graph::Graph;
use crate::schedule::{forward_topo, Order};
use crate::types::NodeId;
use anyhow::Result;
use tracing::debug;

/// The no-checkpointing baseline: every forward once, then every backward in
/// reverse order. Nothing is forgotten or recomputed.
pub(crate) fn dummy(graph: &Graph) -> Result<Vec<Order>> {
    let sorted = forward_topo(graph)?;
    let mut orders: Vec<Order> = sorted
        .iter()
        .map(|&node| Order::ComputeForward { node })
        .collect();
    orders.extend(
        sorted
            .iter()
            .rev()
            .map(|&node| Order::ComputeBackward { node }),
    );
    Ok(orders)
}

/// Maximum-recompute stress schedule: run the whole forward pass, forget
/// every intermediate, recompute everything, then run the backwards.
pub(crate) fn dummy2(graph: &Graph) -> Result<Vec<Order>> {
    let sorted = forward_topo(graph)?;
    let mut orders: Vec<Order> = sorted
        .iter()
        .map(|&node| Order::ComputeForward { node })
        .collect();

    // A node is forgettable only when none of its outputs is a graph output;
    // recomputation replaces all outputs of a node at once.
    let forgettable: Vec<NodeId> = sorted
        .iter()
        .copied()
        .filter(|&n| {
            graph
                .node(n)
                .outputs()
                .iter()
                .all(|&v| !graph.value(v).is_output())
        })
        .collect();
    debug!(
        total = sorted.len(),
        forgettable = forgettable.len(),
        "planned full-recompute schedule"
    );

    for &n in &forgettable {
        for &v in graph.node(n).outputs() {
            orders.push(Order::ForgetForward { value: v });
        }
    }
    orders.extend(
        forgettable
            .iter()
            .map(|&node| Order::ComputeForward { node }),
    );
    orders.extend(
        sorted
            .iter()
            .rev()
            .map(|&node| Order::ComputeBackward { node }),
    );
    Ok(orders)
}
