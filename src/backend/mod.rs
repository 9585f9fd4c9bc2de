//! Execution backend: typed graph IR, executors and inference contexts.

mod context;
mod element;
mod exec;
mod graph;
mod tensor;

pub use context::{CompiledGraph, ContextGuard, ContextPool, InferenceContext};
pub use element::ElementType;
pub use exec::{BackendError, Executor, ReferenceExecutor};
pub use graph::{
    broadcast_shapes, BinaryOp, CompareOp, Conv2dAttrs, Graph, GraphError, LogicalOp, Node,
    NodeId, NodeRef, Op, Pool2dAttrs, PoolKind, ReduceOp, TensorDesc, UnaryOp,
};
pub use tensor::HostTensor;
