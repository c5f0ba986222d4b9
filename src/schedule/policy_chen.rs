use crate::graph::Graph;
use crate::schedule::{forward_topo, Order};
use crate::types::{NodeId, ValueId};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Square-root-of-n segment checkpointing: the linearized forward pass is cut
/// into ~sqrt(n) segments; segment-local activations are dropped after their
/// last forward use and recomputed right before the segment's backward sweep.
pub(crate) fn chen(graph: &Graph) -> Result<Vec<Order>> {
    let sorted = forward_topo(graph)?;
    if sorted.is_empty() {
        return Ok(Vec::new());
    }
    let seg_len = (sorted.len() as f64).sqrt().ceil().max(1.0) as usize;
    let seg_of_pos: Vec<usize> = (0..sorted.len()).map(|i| i / seg_len).collect();
    segmented_schedule(graph, &sorted, &seg_of_pos)
}

/// Shared core of the segment-based policies: given a segment index per
/// topological position, plans forgets, recomputes, and backward sweeps.
///
/// A node is forgettable only when all of its outputs are segment-local
/// (every user sits in the producer's segment) and none is a graph output;
/// this guarantees each segment can be rematerialized from kept values alone.
pub(crate) fn segmented_schedule(
    graph: &Graph,
    sorted: &[NodeId],
    seg_of_pos: &[usize],
) -> Result<Vec<Order>> {
    let pos_of: BTreeMap<NodeId, usize> = sorted.iter().enumerate().map(|(i, &n)| (n, i)).collect();
    let seg_of = |n: NodeId| seg_of_pos[pos_of[&n]];
    let num_segs = seg_of_pos.iter().copied().max().unwrap_or(0) + 1;

    let mut forgettable: BTreeSet<NodeId> = BTreeSet::new();
    for &n in sorted {
        let local = graph.node(n).outputs().iter().all(|&v| {
            !graph.value(v).is_output()
                && graph
                    .value_users(v)
                    .iter()
                    .all(|&u| seg_of(u) == seg_of(n))
        });
        if local {
            forgettable.insert(n);
        }
    }
    debug!(
        segments = num_segs,
        forgettable = forgettable.len(),
        "planned segment checkpointing"
    );

    // Forget each droppable value right after its last forward use.
    let mut forget_at: BTreeMap<usize, Vec<ValueId>> = BTreeMap::new();
    for &n in &forgettable {
        for &v in graph.node(n).outputs() {
            let last = graph
                .value_users(v)
                .iter()
                .map(|u| pos_of[u])
                .max()
                .unwrap_or(pos_of[&n]);
            forget_at.entry(last).or_default().push(v);
        }
    }

    let mut orders = Vec::new();
    for (i, &n) in sorted.iter().enumerate() {
        orders.push(Order::ComputeForward { node: n });
        if let Some(values) = forget_at.get(&i) {
            for &v in values {
                orders.push(Order::ForgetForward { value: v });
            }
        }
    }

    // Backward sweeps, last segment first: rematerialize the segment's
    // dropped interior, then emit its backwards in reverse order.
    for seg in (0..num_segs).rev() {
        let seg_nodes: Vec<NodeId> = sorted
            .iter()
            .enumerate()
            .filter(|(i, _)| seg_of_pos[*i] == seg)
            .map(|(_, &n)| n)
            .collect();
        for &n in &seg_nodes {
            if forgettable.contains(&n) {
                orders.push(Order::ComputeForward { node: n });
            }
        }
        for &n in seg_nodes.iter().rev() {
            orders.push(Order::ComputeBackward { node: n });
        }
    }
    Ok(orders)
}
