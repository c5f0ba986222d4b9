use ndarray::{ArrayD, IxDyn};
use retrograd::graph::builder::GraphBuilder;
use retrograd::{compute_order, Dtype, Graph, Order, TensorType, TrainingRewriter};
use std::collections::HashSet;

fn f32x(n: usize) -> TensorType {
    TensorType::new(Dtype::Float32, n)
}

/// x -> mul(w) -> relu chain -> sum, single graph.
fn chain_graph(depth: usize) -> Graph {
    let mut g = Graph::new("chain");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", f32x(8));
    let w = gb.param("w", ArrayD::from_elem(IxDyn(&[8]), 0.5));
    let mut h = gb.mul("h0", x, w);
    for i in 1..=depth {
        h = gb.relu(&format!("h{}", i), h);
    }
    let y = gb.reduce_sum("y", h);
    gb.output(y);
    g
}

fn assert_schedule_valid(g: &Graph) {
    let mut seen = HashSet::new();
    for n in g.node_ids() {
        let order = g.node(n).exec_order();
        assert!(order > 0, "node #{} left unscheduled:\n{:?}", n.0, g);
        assert!(seen.insert(order), "duplicate execution rank {}", order);
    }
    for n in g.node_ids() {
        for &v in g.node(n).inputs() {
            if let Some(p) = g.producer(v) {
                assert!(g.node(p).exec_order() < g.node(n).exec_order());
            }
        }
    }
}

fn has_recompute_values(g: &Graph) -> bool {
    g.value_ids()
        .any(|v| g.value(v).name().starts_with("Recompute"))
}

#[test]
fn dummy_policy_is_the_no_checkpoint_baseline() {
    let mut g = chain_graph(4);
    let orders = compute_order(&g, "dummy").unwrap();
    assert!(orders
        .iter()
        .all(|o| !matches!(o, Order::ForgetForward { .. })));

    assert!(TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &orders)
        .unwrap());
    assert_schedule_valid(&g);
    assert!(!has_recompute_values(&g));
    assert!(g.find_value("grad_out@w").is_some());
}

#[test]
fn dummy2_policy_recomputes_every_intermediate() {
    let mut g = chain_graph(4);
    let orders = compute_order(&g, "dummy2").unwrap();
    assert!(orders
        .iter()
        .any(|o| matches!(o, Order::ForgetForward { .. })));

    assert!(TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &orders)
        .unwrap());
    assert_schedule_valid(&g);
    assert!(has_recompute_values(&g));
    assert!(g.find_value("grad_out@w").is_some());
}

#[test]
fn chen_policy_checkpoints_segments() {
    let mut g = chain_graph(7);
    let orders = compute_order(&g, "chen").unwrap();
    assert!(orders
        .iter()
        .any(|o| matches!(o, Order::ForgetForward { .. })));

    assert!(TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &orders)
        .unwrap());
    assert_schedule_valid(&g);
    assert!(has_recompute_values(&g));
    assert!(g.find_value("grad_out@w").is_some());
}

#[test]
fn chen_policy_drives_a_two_phase_rewrite() {
    let mut fwd = chain_graph(7);
    let mut bwd = Graph::new("bwd");
    let orders = compute_order(&fwd, "chen").unwrap();
    assert!(TrainingRewriter::new()
        .rewrite_with_orders_two_phase(&mut fwd, &mut bwd, &orders)
        .unwrap());
    assert_schedule_valid(&fwd);
    assert_schedule_valid(&bwd);
    assert!(bwd.find_value("grad_in@y").is_some());
    assert!(bwd.find_value("grad_out@w").is_some());
}

#[test]
fn gt_policy_segments_by_activation_bytes() {
    let mut g = chain_graph(7);
    let orders = compute_order(&g, "gt").unwrap();
    assert!(TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &orders)
        .unwrap());
    assert_schedule_valid(&g);
    assert!(g.find_value("grad_out@w").is_some());
}

#[test]
fn custom_policy_parses_a_hand_written_schedule() {
    let mut g = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", f32x(1));
    let w = gb.param("w", ArrayD::from_elem(IxDyn(&[1]), 1.0));
    let y = gb.add("y", x, w);
    gb.output(y);

    let orders = compute_order(&g, "custom_f:y, b:y").unwrap();
    assert_eq!(orders.len(), 2);
    assert!(matches!(orders[0], Order::ComputeForward { .. }));
    assert!(matches!(orders[1], Order::ComputeBackward { .. }));

    assert!(TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &orders)
        .unwrap());
    assert!(g.find_value("grad_out@w").is_some());
}

#[test]
fn custom_policy_rejects_bad_tokens() {
    let g = chain_graph(2);
    assert!(compute_order(&g, "custom_banana").is_err());
    assert!(compute_order(&g, "custom_f:nope").is_err());
    assert!(compute_order(&g, "custom_zz:h1").is_err());
}

#[test]
fn unknown_policy_is_rejected() {
    let g = chain_graph(2);
    let err = compute_order(&g, "sublinear").unwrap_err();
    assert!(err.to_string().contains("unknown computation-order policy"));
}

#[test]
fn schedules_round_trip_through_json() {
    let g = chain_graph(3);
    let orders = compute_order(&g, "chen").unwrap();
    let json = serde_json::to_string(&orders).unwrap();
    let back: Vec<Order> = serde_json::from_str(&json).unwrap();
    assert_eq!(orders, back);
}
