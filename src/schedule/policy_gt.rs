use crate::graph::Graph;
use crate::schedule::policy_chen::segmented_schedule;
use crate::schedule::{forward_topo, Order};
use anyhow::{bail, Result};
use tracing::debug;

/// Memory-budgeted segment checkpointing: segment boundaries are placed by
/// accumulated activation bytes rather than node count, so a few huge
/// activations do not end up checkpointed in one segment with dozens of tiny
/// ones. Requires every activation size to be resolved.
pub(crate) fn gt(graph: &Graph) -> Result<Vec<Order>> {
    let sorted = forward_topo(graph)?;
    if sorted.is_empty() {
        return Ok(Vec::new());
    }

    let mut bytes = Vec::with_capacity(sorted.len());
    for &n in &sorted {
        let mut b = 0usize;
        for &v in graph.node(n).outputs() {
            match graph.value(v).ty().nbytes() {
                Some(nb) => b += nb,
                None => bail!(
                    "activation '{}' has an unresolved byte size",
                    graph.value(v).name()
                ),
            }
        }
        bytes.push(b);
    }

    let total: usize = bytes.iter().sum();
    let largest = bytes.iter().copied().max().unwrap_or(0);
    // Segment budget ~ sqrt(total * largest), floored at the largest single
    // activation so every node fits in some segment.
    let budget = (((total as f64) * (largest as f64)).sqrt() as usize).max(largest.max(1));
    debug!(total, largest, budget, "derived segment byte budget");

    let mut seg_of_pos = Vec::with_capacity(sorted.len());
    let mut seg = 0usize;
    let mut acc = 0usize;
    for &b in &bytes {
        if acc > 0 && acc + b > budget {
            seg += 1;
            acc = 0;
        }
        seg_of_pos.push(seg);
        acc += b;
    }
    segmented_schedule(graph, &sorted, &seg_of_pos)
}
