use crate::graph::Graph;
use crate::schedule::Order;
use anyhow::{anyhow, bail, Result};

/// Parses a hand-written schedule. The text is a comma-separated token list;
/// nodes are addressed by the name of an output value they produce:
///
/// * `f:<value>`  - compute forward of the producer of `<value>`
/// * `b:<value>`  - compute backward of the producer of `<value>`
/// * `ff:<value>` - forget the forward materialization of `<value>`
/// * `fb:<value>` - forget backward (reserved)
pub(crate) fn custom(graph: &Graph, text: &str) -> Result<Vec<Order>> {
    let mut orders = Vec::new();
    for token in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (kind, name) = token
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed schedule token '{}'", token))?;
        let value = graph
            .find_value(name)
            .ok_or_else(|| anyhow!("no value named '{}' in the graph", name))?;
        match kind {
            "f" | "b" => {
                let node = graph
                    .producer(value)
                    .ok_or_else(|| anyhow!("value '{}' has no producing node", name))?;
                if kind == "f" {
                    orders.push(Order::ComputeForward { node });
                } else {
                    orders.push(Order::ComputeBackward { node });
                }
            }
            "ff" => orders.push(Order::ForgetForward { value }),
            "fb" => orders.push(Order::ForgetBackward { value }),
            other => bail!("unknown schedule token kind '{}'", other),
        }
    }
    Ok(orders)
}
