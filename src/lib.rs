pub mod errors;
pub mod gradients;
pub mod graph;
pub mod rewrite;
pub mod schedule;
pub mod types;

pub use errors::{RgError, RgResult};
pub use graph::{Graph, Node, OpKind, Value};
pub use rewrite::{is_supported, GradSession, MissingParamGrad, RewriteOptions, TrainingRewriter};
pub use schedule::{compute_order, Order};
pub use types::{Dtype, GraphId, NodeId, NodeRef, TensorType, ValueId, ValueRef};
