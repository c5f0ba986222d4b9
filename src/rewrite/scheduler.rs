use crate::errors::{RgError, RgResult};
use crate::rewrite::context::GraphPair;
use crate::types::{NodeRef, ValueRef};
use std::collections::BTreeMap;

/// Ordering offset for ordinary emissions. Leaves the range below it free for
/// retained-transport identities, which must run before everything else.
pub(crate) const MAIN_ORDER_OFFSET: i64 = 100_000_000;

/// Ordering offset for retained-transport identities in the backward graph.
pub(crate) const RETAIN_ORDER_OFFSET: i64 = 0;

/// Assigns execution ranks to emitted nodes and tracks, for every original
/// forward node, its freshest materialization (the "last forward").
pub(crate) struct Scheduler {
    scheduled: Vec<NodeRef>,
    last_forward: BTreeMap<NodeRef, NodeRef>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            scheduled: Vec::new(),
            last_forward: BTreeMap::new(),
        }
    }

    pub fn last_forward(&self, orig: NodeRef) -> Option<NodeRef> {
        self.last_forward.get(&orig).copied()
    }

    /// Appends `node` to the schedule, assigning `offset + position` as its
    /// execution rank, and records it as the last forward of `orig`. For
    /// main-line emissions the node's outputs are staged under the original
    /// node's output identities; an already-staged output means the schedule
    /// recomputed a value it never forgot.
    pub fn schedule(
        &mut self,
        graphs: &mut GraphPair<'_>,
        node: NodeRef,
        orig: NodeRef,
        offset: i64,
        staged: &mut BTreeMap<ValueRef, ValueRef>,
    ) -> RgResult<()> {
        self.scheduled.push(node);
        let order = offset + self.scheduled.len() as i64;
        graphs
            .graph_mut(node.graph)?
            .node_mut(node.node)
            .set_exec_order(order);
        self.last_forward.insert(orig, node);

        if offset >= MAIN_ORDER_OFFSET {
            let node_outs = graphs.graph(node.graph)?.node(node.node).outputs().to_vec();
            let orig_outs = graphs.graph(orig.graph)?.node(orig.node).outputs().to_vec();
            for (&out, &orig_out) in node_outs.iter().zip(orig_outs.iter()) {
                let key = ValueRef {
                    graph: orig.graph,
                    value: orig_out,
                };
                let entry = ValueRef {
                    graph: node.graph,
                    value: out,
                };
                if staged.contains_key(&key) {
                    let g = graphs.graph(orig.graph)?;
                    return Err(RgError::DuplicateStaging {
                        node: format!(
                            "{}({})",
                            g.node(orig.node).op().name(),
                            g.value(orig_out).name()
                        ),
                        value: g.value(orig_out).name().to_string(),
                    });
                }
                staged.insert(key, entry);
            }
        }
        Ok(())
    }
}
