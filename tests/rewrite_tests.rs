use ndarray::{ArrayD, IxDyn};
use retrograd::graph::builder::GraphBuilder;
use retrograd::{
    is_supported, Dtype, Graph, MissingParamGrad, NodeId, OpKind, Order, RewriteOptions,
    TensorType, TrainingRewriter, ValueId,
};
use std::collections::HashSet;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn ones(n: usize) -> ArrayD<f32> {
    ArrayD::from_elem(IxDyn(&[n]), 1.0)
}

fn f32x(n: usize) -> TensorType {
    TensorType::new(Dtype::Float32, n)
}

/// Every node scheduled with a strictly positive, unique rank, and ranks
/// respect the dataflow of the graph.
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
                assert!(
                    g.node(p).exec_order() < g.node(n).exec_order(),
                    "'{}' consumed before it is produced:\n{:?}",
                    g.value(v).name(),
                    g
                );
            }
        }
    }
}

fn assert_no_grads(g: &Graph) {
    for v in g.value_ids() {
        assert!(g.grad(v).is_none(), "leaked gradient on '{}'", g.value(v).name());
    }
}

fn cf(node: NodeId) -> Order {
    Order::ComputeForward { node }
}

fn cb(node: NodeId) -> Order {
    Order::ComputeBackward { node }
}

fn ff(value: ValueId) -> Order {
    Order::ForgetForward { value }
}

// --- single-graph mode ---

#[test]
fn trivial_single_graph_add() {
    init_logging();
    let mut g = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", f32x(1));
    let w = gb.param("w", ones(1));
    let y = gb.add("y", x, w);
    gb.output(y);

    let add = g.producer(y).unwrap();
    let rewriter = TrainingRewriter::new();
    assert!(rewriter.rewrite_with_orders(&mut g, &[cf(add), cb(add)]).unwrap());

    // Constant gradient seed on y, the add itself, and the param-grad output.
    assert_eq!(g.num_nodes(), 3);
    assert_schedule_valid(&g);
    assert_no_grads(&g);

    let grad_out = g.find_value("grad_out@w").expect("missing grad_out@w");
    assert!(g.value(grad_out).is_output());
    // With y = x + w the gradient of w is exactly the constant-one seed.
    let identity = g.producer(grad_out).unwrap();
    let seed = g.node(identity).inputs()[0];
    let seed_node = g.producer(seed).unwrap();
    assert!(matches!(g.node(seed_node).op(), OpKind::Constant { .. }));
}

#[test]
fn identity_and_negation_backward_chain() {
    init_logging();
    let mut g = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", f32x(2));
    let w = gb.param("w", ones(2));
    let neg_w = gb.neg("neg_w", w);
    let carried = gb.identity("neg_w_id", neg_w);
    let y = gb.add("y", x, carried);
    gb.output(y);

    let neg = g.producer(neg_w).unwrap();
    let id = g.producer(carried).unwrap();
    let add = g.producer(y).unwrap();
    let orders = [cf(neg), cf(id), cf(add), cb(add), cb(id), cb(neg)];
    assert!(TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &orders)
        .unwrap());
    assert_schedule_valid(&g);
    assert_no_grads(&g);

    // Identity passes the seed through untouched; the negation flips it, so
    // the exposed gradient of w is produced by a Neg node.
    let grad_out = g.find_value("grad_out@w").expect("missing grad_out@w");
    let expose = g.producer(grad_out).unwrap();
    let gw = g.node(expose).inputs()[0];
    let gw_producer = g.producer(gw).unwrap();
    assert!(matches!(g.node(gw_producer).op(), OpKind::Neg));
}

#[test]
fn single_graph_seed_requires_one_output() {
    let mut g = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", f32x(1));
    let a = gb.relu("a", x);
    let b = gb.sigmoid("b", x);
    gb.output(a);
    gb.output(b);
    let na = g.producer(a).unwrap();

    let err = TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &[cf(na)])
        .unwrap_err();
    assert!(err.to_string().contains("exactly one graph output"));
}

// --- two-phase mode ---

struct TwoPhase {
    fwd: Graph,
    bwd: Graph,
    matmul: NodeId,
    relu: NodeId,
    sum: NodeId,
    relu_out: ValueId,
}

/// h = relu(matmul(x, W)); y = sum(h)
fn two_phase_fixture() -> TwoPhase {
    let mut fwd = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut fwd);
    let x = gb.input("x", f32x(2));
    let w = gb.param("W", ones(4));
    let mm = gb.matmul("matmul_out", f32x(2), x, w);
    let relu_out = gb.relu("relu_out", mm);
    let y = gb.reduce_sum("y", relu_out);
    gb.output(y);

    let matmul = fwd.producer(mm).unwrap();
    let relu = fwd.producer(relu_out).unwrap();
    let sum = fwd.producer(y).unwrap();
    TwoPhase {
        fwd,
        bwd: Graph::new("bwd"),
        matmul,
        relu,
        sum,
        relu_out,
    }
}

#[test]
fn two_phase_without_recompute() {
    init_logging();
    let mut fx = two_phase_fixture();
    let orders = [
        cf(fx.matmul),
        cf(fx.relu),
        cf(fx.sum),
        cb(fx.sum),
        cb(fx.relu),
        cb(fx.matmul),
    ];
    let rewriter = TrainingRewriter::new();
    assert!(rewriter
        .rewrite_with_orders_two_phase(&mut fx.fwd, &mut fx.bwd, &orders)
        .unwrap());

    assert_schedule_valid(&fx.fwd);
    assert_schedule_valid(&fx.bwd);
    assert_no_grads(&fx.fwd);
    assert_no_grads(&fx.bwd);

    let grad_in = fx.bwd.find_value("grad_in@y").expect("missing grad_in@y");
    assert!(fx.bwd.value(grad_in).is_input());
    let grad_out = fx.bwd.find_value("grad_out@W").expect("missing grad_out@W");
    assert!(fx.bwd.value(grad_out).is_output());

    // Every retained forward output pairs with a backward input of the same
    // name, bridged by identities.
    for &v in fx.fwd.outputs() {
        let name = fx.fwd.value(v).name().to_string();
        if !name.starts_with("retained_") {
            continue;
        }
        let bwd_in = fx
            .bwd
            .find_value(&name)
            .unwrap_or_else(|| panic!("no backward input for {}", name));
        assert!(fx.bwd.value(bwd_in).is_input());
        assert!(matches!(
            fx.fwd.node(fx.fwd.producer(v).unwrap()).op(),
            OpKind::Identity
        ));
    }

    // No recomputation was asked for, so no Recompute values anywhere.
    assert!(fx
        .bwd
        .value_ids()
        .all(|v| !fx.bwd.value(v).name().starts_with("Recompute")));
}

#[test]
fn two_phase_with_relu_recompute() {
    init_logging();
    let mut fx = two_phase_fixture();
    let orders = [
        cf(fx.matmul),
        cf(fx.relu),
        cf(fx.sum),
        cb(fx.sum),
        ff(fx.relu_out),
        cf(fx.relu),
        cb(fx.relu),
        cb(fx.matmul),
    ];
    let rewriter = TrainingRewriter::new();
    assert!(rewriter
        .rewrite_with_orders_two_phase(&mut fx.fwd, &mut fx.bwd, &orders)
        .unwrap());

    assert_schedule_valid(&fx.fwd);
    assert_schedule_valid(&fx.bwd);

    // Exactly one forward relu and one recomputed clone.
    let fwd_relus = fx
        .fwd
        .node_ids()
        .filter(|&n| matches!(fx.fwd.node(n).op(), OpKind::Relu))
        .count();
    assert_eq!(fwd_relus, 1);
    let recomputed = fx
        .bwd
        .find_value("Recomputerelu_out")
        .expect("missing recomputed relu activation");
    let clone = fx.bwd.producer(recomputed).unwrap();
    assert!(matches!(fx.bwd.node(clone).op(), OpKind::Relu));

    // The clone consumes the retained matmul activation, transported through
    // the graph boundary.
    let clone_input = fx.bwd.node(clone).inputs()[0];
    assert_eq!(
        fx.bwd.value(clone_input).name(),
        "RetainedForRecompute_matmul_out"
    );
    let transport = fx.bwd.producer(clone_input).unwrap();
    assert!(matches!(fx.bwd.node(transport).op(), OpKind::Identity));
    let transport_in = fx.bwd.node(transport).inputs()[0];
    assert_eq!(fx.bwd.value(transport_in).name(), "retained_matmul_out");
    assert!(fx
        .fwd
        .find_value("retained_matmul_out")
        .map(|v| fx.fwd.value(v).is_output())
        .unwrap_or(false));

    // Retained transports execute before every main-line backward node.
    let is_transport = |n: NodeId| {
        matches!(fx.bwd.node(n).op(), OpKind::Identity)
            && fx.bwd.node(n).inputs().iter().any(|&v| {
                fx.bwd.value(v).is_input() && fx.bwd.value(v).name().starts_with("retained_")
            })
    };
    let max_transport = fx
        .bwd
        .node_ids()
        .filter(|&n| is_transport(n))
        .map(|n| fx.bwd.node(n).exec_order())
        .max()
        .expect("no retained transports in the backward graph");
    let min_other = fx
        .bwd
        .node_ids()
        .filter(|&n| !is_transport(n))
        .map(|n| fx.bwd.node(n).exec_order())
        .min()
        .unwrap();
    assert!(max_transport < min_other);

    assert!(fx.bwd.find_value("grad_out@W").is_some());
}

#[test]
fn backward_before_transition_is_rejected() {
    let mut fx = two_phase_fixture();
    let orders = [cf(fx.matmul), cb(fx.matmul)];
    let err = TrainingRewriter::new()
        .rewrite_with_orders_two_phase(&mut fx.fwd, &mut fx.bwd, &orders)
        .unwrap_err();
    assert!(err.to_string().contains("Phase violation"));
}

#[test]
fn backward_without_forward_is_rejected() {
    let mut g = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", f32x(1));
    let y = gb.relu("y", x);
    gb.output(y);
    let relu = g.producer(y).unwrap();

    let err = TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &[cb(relu)])
        .unwrap_err();
    assert!(err.to_string().contains("No forward computation"));
}

#[test]
fn forgetting_an_unstaged_value_is_rejected() {
    let mut g = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", f32x(1));
    let y = gb.relu("y", x);
    gb.output(y);
    let relu = g.producer(y).unwrap();

    let err = TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &[cf(relu), ff(y), ff(y)])
        .unwrap_err();
    assert!(err.to_string().contains("not staged"));
}

#[test]
fn recompute_without_forgetting_is_rejected() {
    let mut g = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", f32x(1));
    let y = gb.relu("y", x);
    gb.output(y);
    let relu = g.producer(y).unwrap();

    let err = TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &[cf(relu), cf(relu)])
        .unwrap_err();
    assert!(err.to_string().contains("without forgetting"));
}

// --- batch normalization ---

struct BnFixture {
    graph: Graph,
    bn: NodeId,
    sum: NodeId,
    bn_out: ValueId,
}

fn bn_fixture() -> BnFixture {
    let mut g = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", f32x(4));
    let scale = gb.param("scale", ones(1));
    let bias = gb.param("bias", ones(1));
    let mean = gb.param("mean", ones(1));
    let var = gb.param("var", ones(1));
    let bn_out = gb.batch_norm("bn_out", x, scale, bias, mean, var);
    let y = gb.reduce_sum("y", bn_out);
    gb.output(y);
    let bn = g.producer(bn_out).unwrap();
    let sum = g.producer(y).unwrap();
    BnFixture {
        graph: g,
        bn,
        sum,
        bn_out,
    }
}

#[test]
fn batch_norm_recompute_marks_original_node() {
    init_logging();
    let mut fx = bn_fixture();
    let orders = [
        cf(fx.bn),
        cf(fx.sum),
        cb(fx.sum),
        ff(fx.bn_out),
        cf(fx.bn),
        cb(fx.bn),
    ];
    assert!(TrainingRewriter::new()
        .rewrite_with_orders(&mut fx.graph, &orders)
        .unwrap());

    let g = &fx.graph;
    let bn_nodes: Vec<NodeId> = g
        .node_ids()
        .filter(|&n| matches!(g.node(n).op(), OpKind::BatchNormalization { .. }))
        .collect();
    assert_eq!(bn_nodes.len(), 2);
    assert!(g.node(fx.bn).in_recomputing());
    let clone = bn_nodes.into_iter().find(|&n| n != fx.bn).unwrap();
    assert!(!g.node(clone).in_recomputing());

    // Scale and bias got gradients; the running statistics are tolerated
    // without any.
    assert!(g.find_value("grad_out@scale").is_some());
    assert!(g.find_value("grad_out@bias").is_some());
    assert!(g.find_value("grad_out@mean").is_none());
    assert!(g.find_value("grad_out@var").is_none());
    assert_schedule_valid(g);
}

// --- missing parameter gradients ---

fn no_grad_param_fixture() -> (Graph, Vec<Order>) {
    let mut g = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", f32x(2));
    let w = gb.param("w", ones(2));
    let f = gb.floor("f", w);
    let y = gb.add("y", x, f);
    gb.output(y);
    let floor = g.producer(f).unwrap();
    let add = g.producer(y).unwrap();
    let orders = vec![cf(floor), cf(add), cb(add), cb(floor)];
    (g, orders)
}

#[test]
fn missing_param_gradient_warns_but_succeeds() {
    init_logging();
    let (mut g, orders) = no_grad_param_fixture();
    assert!(TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &orders)
        .unwrap());
    assert!(g.find_value("grad_out@w").is_none());
    assert_schedule_valid(&g);
}

#[test]
fn missing_param_gradient_fails_under_strict_options() {
    let (mut g, orders) = no_grad_param_fixture();
    let rewriter = TrainingRewriter::new().options(RewriteOptions {
        missing_param_grad: MissingParamGrad::Error,
    });
    let err = rewriter.rewrite_with_orders(&mut g, &orders).unwrap_err();
    assert!(err.to_string().contains("No gradient for parameter 'w'"));
}

// --- unsupported graphs ---

#[test]
fn unresolved_shapes_reject_the_rewrite_without_mutation() {
    let mut g = Graph::new("fwd");
    let mut gb = GraphBuilder::new(&mut g);
    let x = gb.input("x", TensorType::unresolved(Dtype::Float32));
    let y = gb.relu("y", x);
    gb.output(y);
    let relu = g.producer(y).unwrap();

    assert!(!is_supported(&g));
    let nodes_before = g.num_nodes();
    let values_before = g.num_values();
    let done = TrainingRewriter::new()
        .rewrite_with_orders(&mut g, &[cf(relu), cb(relu)])
        .unwrap();
    assert!(!done);
    assert_eq!(g.num_nodes(), nodes_before);
    assert_eq!(g.num_values(), values_before);
    assert!(g.node_ids().all(|n| g.node(n).exec_order() == 0));
}
