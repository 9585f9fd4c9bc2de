//! Typed computation graph with build-time shape inference.
//!
//! Nodes are appended in topological order; every builder method checks its
//! operands and returns the inferred output descriptors. Constants live in a
//! single weights arena so a graph can be exported as a (graph, weights) blob
//! pair and imported again unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::element::ElementType;
use super::tensor::HostTensor;

pub type NodeId = usize;

/// One output port of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub node: NodeId,
    pub port: usize,
}

impl NodeRef {
    pub fn new(node: NodeId) -> Self {
        Self { node, port: 0 }
    }
}

/// Static element type and shape of a node output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub element_type: ElementType,
    pub shape: Vec<usize>,
}

impl TensorDesc {
    pub fn new(element_type: ElementType, shape: &[usize]) -> Self {
        Self {
            element_type,
            shape: shape.to_vec(),
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.element_type.size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Floor division for integer types.
    Div,
    Max,
    Min,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Abs,
    Exp,
    Log,
    Neg,
    Sin,
    Sqrt,
    Rsqrt,
    Floor,
    Tanh,
    Sigmoid,
    Relu,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
    Prod,
    Any,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolKind {
    Max,
    Average,
    L2,
}

/// Spatial attributes of an NCHW convolution. Pairs are (height, width).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dAttrs {
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub pads_begin: [usize; 2],
    pub pads_end: [usize; 2],
}

/// Spatial attributes of an NCHW pooling window. Padded cells never count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool2dAttrs {
    pub kind: PoolKind,
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub pads_begin: [usize; 2],
    pub pads_end: [usize; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Parameter { index: usize },
    Constant { offset: usize, len: usize },
    /// Element type change to the node's output type.
    Convert,
    Binary(BinaryOp),
    Compare(CompareOp),
    Logical(LogicalOp),
    Unary(UnaryOp),
    RoundHalfToEven,
    Clamp { min: f64, max: f64 },
    Select,
    Transpose { perm: Vec<usize> },
    /// Shape comes from the node's output descriptor.
    Reshape,
    Concat { axis: usize },
    Split { axis: usize, parts: usize },
    /// Output extent per axis comes from the output descriptor.
    Slice { starts: Vec<i64>, strides: Vec<i64> },
    Pad { begin: Vec<usize>, end: Vec<usize>, value: f64 },
    Tile { repeats: Vec<usize> },
    Gather { axis: usize },
    Reduce { op: ReduceOp, axes: Vec<usize>, keep_dims: bool },
    ArgReduce { max: bool, axis: usize },
    /// Largest `k` along the last axis: values, then INT32 indices.
    TopK { k: usize },
    MatMul { transpose_b: bool },
    Softmax { axis: usize },
    /// Mean-variance normalization, epsilon added inside the square root.
    Mvn { axes: Vec<usize>, epsilon: f64 },
    Convolution(Conv2dAttrs),
    GroupConvolution(Conv2dAttrs),
    Pool(Pool2dAttrs),
    DepthToSpace { block: usize },
    SpaceToDepth { block: usize },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Parameter { .. } => "Parameter",
            Op::Constant { .. } => "Constant",
            Op::Convert => "Convert",
            Op::Binary(_) => "Binary",
            Op::Compare(_) => "Compare",
            Op::Logical(_) => "Logical",
            Op::Unary(_) => "Unary",
            Op::RoundHalfToEven => "Round",
            Op::Clamp { .. } => "Clamp",
            Op::Select => "Select",
            Op::Transpose { .. } => "Transpose",
            Op::Reshape => "Reshape",
            Op::Concat { .. } => "Concat",
            Op::Split { .. } => "Split",
            Op::Slice { .. } => "Slice",
            Op::Pad { .. } => "Pad",
            Op::Tile { .. } => "Tile",
            Op::Gather { .. } => "Gather",
            Op::Reduce { .. } => "Reduce",
            Op::ArgReduce { .. } => "ArgReduce",
            Op::TopK { .. } => "TopK",
            Op::MatMul { .. } => "MatMul",
            Op::Softmax { .. } => "Softmax",
            Op::Mvn { .. } => "Mvn",
            Op::Convolution(_) => "Convolution",
            Op::GroupConvolution(_) => "GroupConvolution",
            Op::Pool(_) => "Pool",
            Op::DepthToSpace { .. } => "DepthToSpace",
            Op::SpaceToDepth { .. } => "SpaceToDepth",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<NodeRef>,
    pub outputs: Vec<TensorDesc>,
}

/// Errors raised while building, exporting or importing a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Unknown node reference {node}:{port}")]
    UnknownNode { node: NodeId, port: usize },

    #[error("{op}: {detail}")]
    InvalidNode { op: &'static str, detail: String },

    #[error("Graph blob is malformed: {0}")]
    Blob(String),
}

fn invalid(op: &'static str, detail: impl Into<String>) -> GraphError {
    GraphError::InvalidNode {
        op,
        detail: detail.into(),
    }
}

#[derive(Serialize, Deserialize)]
struct GraphBlob {
    nodes: Vec<Node>,
    parameters: Vec<NodeId>,
    results: Vec<NodeRef>,
    weights_len: usize,
}

/// A computation graph under construction or ready to execute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
    parameters: Vec<NodeId>,
    results: Vec<NodeRef>,
    weights: Vec<u8>,
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

fn conv_extent(input: usize, kernel: usize, stride: usize, dilation: usize, pads: usize) -> Option<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let effective = dilation * (kernel - 1) + 1;
    let padded = input + pads;
    if padded < effective {
        return None;
    }
    Some((padded - effective) / stride + 1)
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    pub fn results(&self) -> &[NodeRef] {
        &self.results
    }

    pub fn weights(&self) -> &[u8] {
        &self.weights
    }

    /// Descriptor of compiled-graph input `i`.
    pub fn parameter_desc(&self, i: usize) -> Option<&TensorDesc> {
        let id = *self.parameters.get(i)?;
        self.nodes.get(id).and_then(|n| n.outputs.first())
    }

    /// Descriptor of compiled-graph output `i`.
    pub fn result_desc(&self, i: usize) -> Option<&TensorDesc> {
        let r = *self.results.get(i)?;
        self.desc(r).ok()
    }

    pub fn desc(&self, r: NodeRef) -> Result<&TensorDesc, GraphError> {
        self.nodes
            .get(r.node)
            .and_then(|n| n.outputs.get(r.port))
            .ok_or(GraphError::UnknownNode {
                node: r.node,
                port: r.port,
            })
    }

    pub fn shape(&self, r: NodeRef) -> Result<Vec<usize>, GraphError> {
        Ok(self.desc(r)?.shape.clone())
    }

    pub fn element_type(&self, r: NodeRef) -> Result<ElementType, GraphError> {
        Ok(self.desc(r)?.element_type)
    }

    fn push(&mut self, op: Op, inputs: Vec<NodeRef>, outputs: Vec<TensorDesc>) -> NodeId {
        self.nodes.push(Node {
            op,
            inputs,
            outputs,
        });
        self.nodes.len() - 1
    }

    fn single(&mut self, op: Op, inputs: Vec<NodeRef>, output: TensorDesc) -> NodeRef {
        NodeRef::new(self.push(op, inputs, vec![output]))
    }

    /// Declare the next graph input.
    pub fn parameter(&mut self, desc: TensorDesc) -> NodeRef {
        let index = self.parameters.len();
        let id = self.push(Op::Parameter { index }, Vec::new(), vec![desc]);
        self.parameters.push(id);
        NodeRef::new(id)
    }

    /// Mark a node output as the next graph result.
    pub fn result(&mut self, r: NodeRef) -> Result<(), GraphError> {
        self.desc(r)?;
        self.results.push(r);
        Ok(())
    }

    pub fn constant(&mut self, tensor: &HostTensor) -> NodeRef {
        let offset = self.weights.len();
        self.weights.extend_from_slice(tensor.as_bytes());
        let desc = TensorDesc::new(tensor.element_type(), tensor.shape());
        self.single(
            Op::Constant {
                offset,
                len: tensor.byte_size(),
            },
            Vec::new(),
            desc,
        )
    }

    /// Rank-0 constant of the given type.
    pub fn scalar(&mut self, element_type: ElementType, value: f64) -> NodeRef {
        self.constant(&HostTensor::from_values(element_type, &[], &[value]))
    }

    pub fn constant_f32(&mut self, shape: &[usize], values: &[f32]) -> NodeRef {
        self.constant(&HostTensor::from_f32(shape, values))
    }

    pub fn constant_i32(&mut self, shape: &[usize], values: &[i32]) -> NodeRef {
        self.constant(&HostTensor::from_i32(shape, values))
    }

    pub fn convert(&mut self, x: NodeRef, to: ElementType) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?;
        if desc.element_type == to {
            return Ok(x);
        }
        let out = TensorDesc::new(to, &desc.shape);
        Ok(self.single(Op::Convert, vec![x], out))
    }

    fn broadcast_pair(
        &self,
        op: &'static str,
        a: NodeRef,
        b: NodeRef,
    ) -> Result<(ElementType, Vec<usize>), GraphError> {
        let da = self.desc(a)?;
        let db = self.desc(b)?;
        if da.element_type != db.element_type {
            return Err(invalid(
                op,
                format!("element types differ: {:?} vs {:?}", da.element_type, db.element_type),
            ));
        }
        let shape = broadcast_shapes(&da.shape, &db.shape).ok_or_else(|| {
            invalid(op, format!("shapes {:?} and {:?} do not broadcast", da.shape, db.shape))
        })?;
        Ok((da.element_type, shape))
    }

    pub fn binary(&mut self, op: BinaryOp, a: NodeRef, b: NodeRef) -> Result<NodeRef, GraphError> {
        let (ty, shape) = self.broadcast_pair("Binary", a, b)?;
        Ok(self.single(Op::Binary(op), vec![a, b], TensorDesc::new(ty, &shape)))
    }

    pub fn compare(&mut self, op: CompareOp, a: NodeRef, b: NodeRef) -> Result<NodeRef, GraphError> {
        let (_, shape) = self.broadcast_pair("Compare", a, b)?;
        let out = TensorDesc::new(ElementType::Boolean, &shape);
        Ok(self.single(Op::Compare(op), vec![a, b], out))
    }

    pub fn logical(&mut self, op: LogicalOp, a: NodeRef, b: NodeRef) -> Result<NodeRef, GraphError> {
        let (ty, shape) = self.broadcast_pair("Logical", a, b)?;
        if ty != ElementType::Boolean {
            return Err(invalid("Logical", "operands must be boolean"));
        }
        Ok(self.single(Op::Logical(op), vec![a, b], TensorDesc::new(ty, &shape)))
    }

    pub fn unary(&mut self, op: UnaryOp, x: NodeRef) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?.clone();
        if op == UnaryOp::Not && desc.element_type != ElementType::Boolean {
            return Err(invalid("Unary", "logical not needs a boolean operand"));
        }
        Ok(self.single(Op::Unary(op), vec![x], desc))
    }

    pub fn round_half_to_even(&mut self, x: NodeRef) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?.clone();
        Ok(self.single(Op::RoundHalfToEven, vec![x], desc))
    }

    pub fn clamp(&mut self, x: NodeRef, min: f64, max: f64) -> Result<NodeRef, GraphError> {
        if min > max {
            return Err(invalid("Clamp", format!("min {min} exceeds max {max}")));
        }
        let desc = self.desc(x)?.clone();
        Ok(self.single(Op::Clamp { min, max }, vec![x], desc))
    }

    pub fn select(&mut self, cond: NodeRef, a: NodeRef, b: NodeRef) -> Result<NodeRef, GraphError> {
        let dc = self.desc(cond)?;
        if dc.element_type != ElementType::Boolean {
            return Err(invalid("Select", "condition must be boolean"));
        }
        let cond_shape = dc.shape.clone();
        let (ty, shape) = self.broadcast_pair("Select", a, b)?;
        let shape = broadcast_shapes(&cond_shape, &shape)
            .ok_or_else(|| invalid("Select", "condition does not broadcast"))?;
        Ok(self.single(Op::Select, vec![cond, a, b], TensorDesc::new(ty, &shape)))
    }

    pub fn transpose(&mut self, x: NodeRef, perm: &[usize]) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?;
        let rank = desc.shape.len();
        let mut seen = vec![false; rank];
        if perm.len() != rank || perm.iter().any(|&p| p >= rank || std::mem::replace(&mut seen[p], true)) {
            return Err(invalid(
                "Transpose",
                format!("{perm:?} is not a permutation of rank {rank}"),
            ));
        }
        let shape: Vec<usize> = perm.iter().map(|&p| desc.shape[p]).collect();
        let out = TensorDesc::new(desc.element_type, &shape);
        Ok(self.single(Op::Transpose { perm: perm.to_vec() }, vec![x], out))
    }

    pub fn reshape(&mut self, x: NodeRef, shape: &[usize]) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?;
        if desc.element_count() != shape.iter().product::<usize>() {
            return Err(invalid(
                "Reshape",
                format!("cannot reshape {:?} into {:?}", desc.shape, shape),
            ));
        }
        if desc.shape == shape {
            return Ok(x);
        }
        let out = TensorDesc::new(desc.element_type, shape);
        Ok(self.single(Op::Reshape, vec![x], out))
    }

    pub fn concat(&mut self, inputs: &[NodeRef], axis: usize) -> Result<NodeRef, GraphError> {
        let first = inputs
            .first()
            .ok_or_else(|| invalid("Concat", "no inputs"))?;
        let base = self.desc(*first)?.clone();
        if axis >= base.shape.len() {
            return Err(invalid("Concat", format!("axis {axis} out of range")));
        }
        let mut shape = base.shape.clone();
        shape[axis] = 0;
        for &r in inputs {
            let d = self.desc(r)?;
            let compatible = d.element_type == base.element_type
                && d.shape.len() == base.shape.len()
                && d.shape.iter().zip(&base.shape).enumerate().all(|(i, (a, b))| i == axis || a == b);
            if !compatible {
                return Err(invalid(
                    "Concat",
                    format!("{:?} does not match {:?} off axis {axis}", d.shape, base.shape),
                ));
            }
            shape[axis] += d.shape[axis];
        }
        let out = TensorDesc::new(base.element_type, &shape);
        Ok(self.single(Op::Concat { axis }, inputs.to_vec(), out))
    }

    /// Split into `parts` equal slices along `axis`.
    pub fn split(&mut self, x: NodeRef, axis: usize, parts: usize) -> Result<Vec<NodeRef>, GraphError> {
        let desc = self.desc(x)?.clone();
        let extent = *desc
            .shape
            .get(axis)
            .ok_or_else(|| invalid("Split", format!("axis {axis} out of range")))?;
        if parts == 0 || extent % parts != 0 {
            return Err(invalid(
                "Split",
                format!("extent {extent} not divisible into {parts} parts"),
            ));
        }
        let mut shape = desc.shape.clone();
        shape[axis] = extent / parts;
        let outputs = vec![TensorDesc::new(desc.element_type, &shape); parts];
        let id = self.push(Op::Split { axis, parts }, vec![x], outputs);
        Ok((0..parts).map(|port| NodeRef { node: id, port }).collect())
    }

    /// Strided gather: output element `o` reads input `starts + o * strides` per axis.
    pub fn slice(
        &mut self,
        x: NodeRef,
        starts: &[i64],
        strides: &[i64],
        sizes: &[usize],
    ) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?;
        let rank = desc.shape.len();
        if starts.len() != rank || strides.len() != rank || sizes.len() != rank {
            return Err(invalid("Slice", "attribute ranks differ from input rank"));
        }
        for d in 0..rank {
            if sizes[d] == 0 {
                continue;
            }
            let last = starts[d] + (sizes[d] as i64 - 1) * strides[d];
            let dim = desc.shape[d] as i64;
            if starts[d] < 0 || starts[d] >= dim || last < 0 || last >= dim {
                return Err(invalid("Slice", format!("axis {d} reads outside 0..{dim}")));
            }
        }
        let out = TensorDesc::new(desc.element_type, sizes);
        let op = Op::Slice {
            starts: starts.to_vec(),
            strides: strides.to_vec(),
        };
        Ok(self.single(op, vec![x], out))
    }

    pub fn pad(
        &mut self,
        x: NodeRef,
        begin: &[usize],
        end: &[usize],
        value: f64,
    ) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?;
        if begin.len() != desc.shape.len() || end.len() != desc.shape.len() {
            return Err(invalid("Pad", "padding rank differs from input rank"));
        }
        let shape: Vec<usize> = (0..desc.shape.len())
            .map(|d| desc.shape[d] + begin[d] + end[d])
            .collect();
        let out = TensorDesc::new(desc.element_type, &shape);
        let op = Op::Pad {
            begin: begin.to_vec(),
            end: end.to_vec(),
            value,
        };
        Ok(self.single(op, vec![x], out))
    }

    pub fn tile(&mut self, x: NodeRef, repeats: &[usize]) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?;
        if repeats.len() != desc.shape.len() {
            return Err(invalid("Tile", "repeat count differs from input rank"));
        }
        let shape: Vec<usize> = desc.shape.iter().zip(repeats).map(|(d, r)| d * r).collect();
        let out = TensorDesc::new(desc.element_type, &shape);
        Ok(self.single(Op::Tile { repeats: repeats.to_vec() }, vec![x], out))
    }

    pub fn gather(&mut self, x: NodeRef, indices: NodeRef, axis: usize) -> Result<NodeRef, GraphError> {
        let data = self.desc(x)?.clone();
        let idx = self.desc(indices)?;
        if idx.element_type != ElementType::I32 {
            return Err(invalid("Gather", "indices must be int32"));
        }
        if axis >= data.shape.len() {
            return Err(invalid("Gather", format!("axis {axis} out of range")));
        }
        let mut shape = data.shape[..axis].to_vec();
        shape.extend_from_slice(&idx.shape);
        shape.extend_from_slice(&data.shape[axis + 1..]);
        let out = TensorDesc::new(data.element_type, &shape);
        Ok(self.single(Op::Gather { axis }, vec![x, indices], out))
    }

    pub fn reduce(
        &mut self,
        op: ReduceOp,
        x: NodeRef,
        axes: &[usize],
        keep_dims: bool,
    ) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?;
        let rank = desc.shape.len();
        let mut axes = axes.to_vec();
        axes.sort_unstable();
        axes.dedup();
        if axes.iter().any(|&a| a >= rank) {
            return Err(invalid("Reduce", format!("axes {axes:?} out of range for rank {rank}")));
        }
        let shape: Vec<usize> = (0..rank)
            .filter_map(|d| match (axes.contains(&d), keep_dims) {
                (false, _) => Some(desc.shape[d]),
                (true, true) => Some(1),
                (true, false) => None,
            })
            .collect();
        let out = TensorDesc::new(desc.element_type, &shape);
        Ok(self.single(
            Op::Reduce {
                op,
                axes,
                keep_dims,
            },
            vec![x],
            out,
        ))
    }

    pub fn arg_reduce(&mut self, x: NodeRef, axis: usize, max: bool) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?;
        if axis >= desc.shape.len() {
            return Err(invalid("ArgReduce", format!("axis {axis} out of range")));
        }
        let mut shape = desc.shape.clone();
        shape.remove(axis);
        let out = TensorDesc::new(ElementType::I32, &shape);
        Ok(self.single(Op::ArgReduce { max, axis }, vec![x], out))
    }

    /// Values and indices of the `k` largest entries along the last axis.
    /// Ties keep the lower index first.
    pub fn top_k(&mut self, x: NodeRef, k: usize) -> Result<(NodeRef, NodeRef), GraphError> {
        let desc = self.desc(x)?.clone();
        let Some(&last) = desc.shape.last() else {
            return Err(invalid("TopK", "input must have rank 1 or more"));
        };
        if k > last {
            return Err(invalid("TopK", format!("k {k} exceeds extent {last}")));
        }
        let mut shape = desc.shape.clone();
        if let Some(l) = shape.last_mut() {
            *l = k;
        }
        let outputs = vec![
            TensorDesc::new(desc.element_type, &shape),
            TensorDesc::new(ElementType::I32, &shape),
        ];
        let id = self.push(Op::TopK { k }, vec![x], outputs);
        Ok((NodeRef { node: id, port: 0 }, NodeRef { node: id, port: 1 }))
    }

    /// `[M, K] x [K, N]`, or `[M, K] x [N, K]^T` when `transpose_b`.
    pub fn matmul(&mut self, a: NodeRef, b: NodeRef, transpose_b: bool) -> Result<NodeRef, GraphError> {
        let da = self.desc(a)?;
        let db = self.desc(b)?;
        if da.shape.len() != 2 || db.shape.len() != 2 || da.element_type != db.element_type {
            return Err(invalid("MatMul", "operands must be rank-2 of one element type"));
        }
        let (k_b, n) = if transpose_b {
            (db.shape[1], db.shape[0])
        } else {
            (db.shape[0], db.shape[1])
        };
        if da.shape[1] != k_b {
            return Err(invalid(
                "MatMul",
                format!("inner dimensions differ: {:?} x {:?}", da.shape, db.shape),
            ));
        }
        let out = TensorDesc::new(da.element_type, &[da.shape[0], n]);
        Ok(self.single(Op::MatMul { transpose_b }, vec![a, b], out))
    }

    pub fn softmax(&mut self, x: NodeRef, axis: usize) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?.clone();
        if axis >= desc.shape.len() {
            return Err(invalid("Softmax", format!("axis {axis} out of range")));
        }
        Ok(self.single(Op::Softmax { axis }, vec![x], desc))
    }

    pub fn mvn(&mut self, x: NodeRef, axes: &[usize], epsilon: f64) -> Result<NodeRef, GraphError> {
        let desc = self.desc(x)?.clone();
        if axes.is_empty() || axes.iter().any(|&a| a >= desc.shape.len()) {
            return Err(invalid("Mvn", format!("axes {axes:?} out of range")));
        }
        let op = Op::Mvn {
            axes: axes.to_vec(),
            epsilon,
        };
        Ok(self.single(op, vec![x], desc))
    }

    /// NCHW input, OIHW filter.
    pub fn convolution(
        &mut self,
        x: NodeRef,
        filter: NodeRef,
        attrs: Conv2dAttrs,
    ) -> Result<NodeRef, GraphError> {
        let dx = self.desc(x)?.clone();
        let dw = self.desc(filter)?;
        if dx.shape.len() != 4 || dw.shape.len() != 4 {
            return Err(invalid("Convolution", "input and filter must be rank 4"));
        }
        if dx.shape[1] != dw.shape[1] {
            return Err(invalid(
                "Convolution",
                format!("input channels {} differ from filter {}", dx.shape[1], dw.shape[1]),
            ));
        }
        let out_c = dw.shape[0];
        let kernel = [dw.shape[2], dw.shape[3]];
        let shape = self.conv_shape("Convolution", &dx, out_c, kernel, &attrs)?;
        let out = TensorDesc::new(dx.element_type, &shape);
        Ok(self.single(Op::Convolution(attrs), vec![x, filter], out))
    }

    /// NCHW input, `[groups, out/groups, in/groups, kh, kw]` filter.
    pub fn group_convolution(
        &mut self,
        x: NodeRef,
        filter: NodeRef,
        attrs: Conv2dAttrs,
    ) -> Result<NodeRef, GraphError> {
        let dx = self.desc(x)?.clone();
        let dw = self.desc(filter)?;
        if dx.shape.len() != 4 || dw.shape.len() != 5 {
            return Err(invalid("GroupConvolution", "input rank 4 and filter rank 5 required"));
        }
        let groups = dw.shape[0];
        if groups * dw.shape[2] != dx.shape[1] {
            return Err(invalid(
                "GroupConvolution",
                format!("{} groups of {} do not cover {} channels", groups, dw.shape[2], dx.shape[1]),
            ));
        }
        let out_c = groups * dw.shape[1];
        let kernel = [dw.shape[3], dw.shape[4]];
        let shape = self.conv_shape("GroupConvolution", &dx, out_c, kernel, &attrs)?;
        let out = TensorDesc::new(dx.element_type, &shape);
        Ok(self.single(Op::GroupConvolution(attrs), vec![x, filter], out))
    }

    fn conv_shape(
        &self,
        op: &'static str,
        input: &TensorDesc,
        out_c: usize,
        kernel: [usize; 2],
        attrs: &Conv2dAttrs,
    ) -> Result<Vec<usize>, GraphError> {
        let mut shape = vec![input.shape[0], out_c, 0, 0];
        for i in 0..2 {
            shape[2 + i] = conv_extent(
                input.shape[2 + i],
                kernel[i],
                attrs.strides[i],
                attrs.dilations[i],
                attrs.pads_begin[i] + attrs.pads_end[i],
            )
            .ok_or_else(|| invalid(op, format!("window does not fit input {:?}", input.shape)))?;
        }
        Ok(shape)
    }

    pub fn pool(&mut self, x: NodeRef, attrs: Pool2dAttrs) -> Result<NodeRef, GraphError> {
        let dx = self.desc(x)?.clone();
        if dx.shape.len() != 4 {
            return Err(invalid("Pool", "input must be rank 4"));
        }
        let mut shape = dx.shape.clone();
        for i in 0..2 {
            shape[2 + i] = conv_extent(
                dx.shape[2 + i],
                attrs.kernel[i],
                attrs.strides[i],
                1,
                attrs.pads_begin[i] + attrs.pads_end[i],
            )
            .ok_or_else(|| invalid("Pool", format!("window does not fit input {:?}", dx.shape)))?;
        }
        let out = TensorDesc::new(dx.element_type, &shape);
        Ok(self.single(Op::Pool(attrs), vec![x], out))
    }

    pub fn depth_to_space(&mut self, x: NodeRef, block: usize) -> Result<NodeRef, GraphError> {
        let d = self.desc(x)?;
        let area = block * block;
        if d.shape.len() != 4 || block == 0 || d.shape[1] % area != 0 {
            return Err(invalid("DepthToSpace", format!("block {block} does not fit {:?}", d.shape)));
        }
        let shape = [d.shape[0], d.shape[1] / area, d.shape[2] * block, d.shape[3] * block];
        let out = TensorDesc::new(d.element_type, &shape);
        Ok(self.single(Op::DepthToSpace { block }, vec![x], out))
    }

    pub fn space_to_depth(&mut self, x: NodeRef, block: usize) -> Result<NodeRef, GraphError> {
        let d = self.desc(x)?;
        if d.shape.len() != 4 || block == 0 || d.shape[2] % block != 0 || d.shape[3] % block != 0 {
            return Err(invalid("SpaceToDepth", format!("block {block} does not fit {:?}", d.shape)));
        }
        let shape = [d.shape[0], d.shape[1] * block * block, d.shape[2] / block, d.shape[3] / block];
        let out = TensorDesc::new(d.element_type, &shape);
        Ok(self.single(Op::SpaceToDepth { block }, vec![x], out))
    }

    /// Export as a JSON graph blob and a raw weights blob.
    pub fn to_blobs(&self) -> Result<(Vec<u8>, Vec<u8>), GraphError> {
        let blob = GraphBlob {
            nodes: self.nodes.clone(),
            parameters: self.parameters.clone(),
            results: self.results.clone(),
            weights_len: self.weights.len(),
        };
        let graph = serde_json::to_vec(&blob).map_err(|e| GraphError::Blob(e.to_string()))?;
        Ok((graph, self.weights.clone()))
    }

    /// Rebuild a graph from blobs produced by [`Graph::to_blobs`].
    pub fn from_blobs(graph: &[u8], weights: &[u8]) -> Result<Self, GraphError> {
        let blob: GraphBlob =
            serde_json::from_slice(graph).map_err(|e| GraphError::Blob(e.to_string()))?;
        if blob.weights_len != weights.len() {
            return Err(GraphError::Blob(format!(
                "weights blob is {} bytes, graph expects {}",
                weights.len(),
                blob.weights_len
            )));
        }
        for (id, node) in blob.nodes.iter().enumerate() {
            if let Op::Constant { offset, len } = node.op {
                if offset + len > weights.len() {
                    return Err(GraphError::Blob(format!("constant {id} exceeds weights")));
                }
            }
            if node.inputs.iter().any(|r| r.node >= id) {
                return Err(GraphError::Blob(format!("node {id} is not in topological order")));
            }
        }
        Ok(Self {
            nodes: blob.nodes,
            parameters: blob.parameters,
            results: blob.results,
            weights: weights.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(stride: usize, pads: [usize; 2]) -> Conv2dAttrs {
        Conv2dAttrs {
            strides: [stride, stride],
            dilations: [1, 1],
            pads_begin: pads,
            pads_end: pads,
        }
    }

    #[test]
    fn test_broadcast_rules() {
        assert_eq!(broadcast_shapes(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shapes(&[1, 4, 1], &[3, 1, 5]), Some(vec![3, 4, 5]));
        assert_eq!(broadcast_shapes(&[2, 3], &[2]), None);
        assert_eq!(broadcast_shapes(&[], &[2]), Some(vec![2]));
    }

    #[test]
    fn test_binary_rejects_mixed_types() {
        let mut g = Graph::new();
        let a = g.parameter(TensorDesc::new(ElementType::F32, &[2]));
        let b = g.constant_i32(&[2], &[1, 2]);
        assert!(g.binary(BinaryOp::Add, a, b).is_err());
    }

    #[test]
    fn test_convolution_shape_inference() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[1, 3, 5, 5]));
        let w = g.constant_f32(&[4, 3, 3, 3], &[0.0; 108]);
        let y = g.convolution(x, w, attrs(1, [1, 1])).unwrap();
        assert_eq!(g.shape(y).unwrap(), vec![1, 4, 5, 5]);

        let y = g.convolution(x, w, attrs(2, [0, 0])).unwrap();
        assert_eq!(g.shape(y).unwrap(), vec![1, 4, 2, 2]);
    }

    #[test]
    fn test_group_convolution_checks_channels() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[1, 4, 3, 3]));
        let ok = g.constant_f32(&[2, 1, 2, 1, 1], &[0.0; 4]);
        let y = g.group_convolution(x, ok, attrs(1, [0, 0])).unwrap();
        assert_eq!(g.shape(y).unwrap(), vec![1, 2, 3, 3]);

        let bad = g.constant_f32(&[3, 1, 2, 1, 1], &[0.0; 6]);
        assert!(g.group_convolution(x, bad, attrs(1, [0, 0])).is_err());
    }

    #[test]
    fn test_split_produces_ports() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[2, 6]));
        let parts = g.split(x, 1, 3).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].port, 2);
        assert_eq!(g.shape(parts[1]).unwrap(), vec![2, 2]);
        assert!(g.split(x, 1, 4).is_err());
    }

    #[test]
    fn test_blob_round_trip_preserves_graph() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[2]));
        let c = g.constant_f32(&[2], &[1.0, 2.0]);
        let y = g.binary(BinaryOp::Mul, x, c).unwrap();
        g.result(y).unwrap();

        let (graph, weights) = g.to_blobs().unwrap();
        let back = Graph::from_blobs(&graph, &weights).unwrap();
        assert_eq!(back, g);
        assert!(Graph::from_blobs(&graph, &weights[..4]).is_err());
    }
}
