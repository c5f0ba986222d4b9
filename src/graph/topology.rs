use crate::errors::{RgError, RgResult};
use crate::graph::Graph;
use crate::types::{NodeId, ValueId};
use std::collections::BTreeSet;

/// Splits the values touched by `nodes` into (inputs, outputs, temps):
/// inputs are consumed but not produced inside the set, outputs are produced
/// but never consumed inside it, temps are both produced and consumed.
pub fn classify_values(
    graph: &Graph,
    nodes: &[NodeId],
) -> (Vec<ValueId>, Vec<ValueId>, Vec<ValueId>) {
    let mut produced = BTreeSet::new();
    let mut consumed = BTreeSet::new();
    for &n in nodes {
        for &v in graph.node(n).outputs() {
            produced.insert(v);
        }
        for &v in graph.node(n).inputs() {
            consumed.insert(v);
        }
    }
    let inputs = consumed.difference(&produced).copied().collect();
    let outputs = produced.difference(&consumed).copied().collect();
    let temps = produced.intersection(&consumed).copied().collect();
    (inputs, outputs, temps)
}

/// Orders `nodes` so that every node comes after the producers of its inputs.
/// Values in `available` (and values produced outside the set) count as
/// already materialized. The sort is stable with respect to the given node
/// order among ready nodes.
pub fn topological_sort(
    graph: &Graph,
    nodes: &[NodeId],
    available: &[ValueId],
    allow_cycles: bool,
) -> RgResult<Vec<NodeId>> {
    let mut produced_by: Vec<(ValueId, NodeId)> = Vec::new();
    for &n in nodes {
        for &v in graph.node(n).outputs() {
            produced_by.push((v, n));
        }
    }
    let in_set_producer = |v: ValueId| produced_by.iter().find(|(pv, _)| *pv == v).map(|(_, n)| *n);

    let available: BTreeSet<ValueId> = available.iter().copied().collect();
    let mut emitted: BTreeSet<NodeId> = BTreeSet::new();
    let mut sorted = Vec::with_capacity(nodes.len());
    let mut remaining: Vec<NodeId> = nodes.to_vec();

    while !remaining.is_empty() {
        let mut progressed = false;
        let mut still_blocked = Vec::new();
        for &n in &remaining {
            let ready = graph.node(n).inputs().iter().all(|&v| {
                available.contains(&v)
                    || match in_set_producer(v) {
                        Some(p) => emitted.contains(&p),
                        None => true,
                    }
            });
            if ready {
                emitted.insert(n);
                sorted.push(n);
                progressed = true;
            } else {
                still_blocked.push(n);
            }
        }
        remaining = still_blocked;
        if !progressed {
            if allow_cycles {
                sorted.extend(remaining.iter().copied());
                break;
            }
            let names: Vec<String> = remaining
                .iter()
                .map(|&n| graph.node(n).op().name().to_string())
                .collect();
            return Err(RgError::Cycle {
                names: names.join(", "),
            });
        }
    }
    Ok(sorted)
}
