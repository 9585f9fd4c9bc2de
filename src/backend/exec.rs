//! Graph execution.
//!
//! [`ReferenceExecutor`] evaluates nodes in insertion order on wide `f64`
//! storage and narrows every node output to its declared element type, so
//! integer and half-precision results match what a typed kernel produces.

use thiserror::Error;

use super::graph::{
    BinaryOp, CompareOp, Conv2dAttrs, Graph, GraphError, LogicalOp, Node, NodeRef, Op, PoolKind,
    Pool2dAttrs, ReduceOp, TensorDesc, UnaryOp,
};
use super::tensor::HostTensor;

/// Errors raised by an executor or an inference context.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Expected {expected} inputs, got {actual}")]
    InputCount { expected: usize, actual: usize },

    #[error("Input {index} does not match {expected:?}")]
    InputMismatch { index: usize, expected: TensorDesc },

    #[error("Tensor {index} is not available")]
    TensorUnavailable { index: usize },

    #[error("Node {node} ({op}) failed: {detail}")]
    Kernel {
        node: usize,
        op: &'static str,
        detail: String,
    },

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Executor fault: {0}")]
    Fault(String),
}

/// Runs a compiled graph. Implementations must be shareable across contexts.
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, graph: &Graph, inputs: &[HostTensor]) -> Result<Vec<HostTensor>, BackendError>;
}

/// Portable CPU executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceExecutor;

impl ReferenceExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for ReferenceExecutor {
    fn name(&self) -> &str {
        "reference"
    }

    fn execute(&self, graph: &Graph, inputs: &[HostTensor]) -> Result<Vec<HostTensor>, BackendError> {
        let params = graph.parameters();
        if inputs.len() != params.len() {
            return Err(BackendError::InputCount {
                expected: params.len(),
                actual: inputs.len(),
            });
        }

        let mut values: Vec<Vec<Vec<f64>>> = Vec::with_capacity(graph.nodes().len());
        for (id, node) in graph.nodes().iter().enumerate() {
            let outputs = match &node.op {
                Op::Parameter { index } => {
                    let tensor = &inputs[*index];
                    let expected = &node.outputs[0];
                    if tensor.element_type() != expected.element_type || tensor.shape() != expected.shape {
                        return Err(BackendError::InputMismatch {
                            index: *index,
                            expected: expected.clone(),
                        });
                    }
                    vec![tensor.values()]
                }
                Op::Constant { offset, len } => {
                    let bytes = &graph.weights()[*offset..*offset + *len];
                    vec![node.outputs[0].element_type.decode(bytes)]
                }
                _ => {
                    let args: Vec<Arg<'_>> = node
                        .inputs
                        .iter()
                        .map(|r| arg(graph, &values, *r))
                        .collect::<Result<_, _>>()?;
                    let raw = evaluate(node, &args).map_err(|detail| BackendError::Kernel {
                        node: id,
                        op: node.op.name(),
                        detail,
                    })?;
                    raw.into_iter()
                        .zip(&node.outputs)
                        .map(|(data, desc)| data.into_iter().map(|v| desc.element_type.narrow(v)).collect())
                        .collect()
                }
            };
            values.push(outputs);
        }

        graph
            .results()
            .iter()
            .map(|r| {
                let desc = graph.desc(*r)?;
                let data = &values[r.node][r.port];
                Ok(HostTensor::from_values(desc.element_type, &desc.shape, data))
            })
            .collect()
    }
}

struct Arg<'a> {
    shape: &'a [usize],
    data: &'a [f64],
}

fn arg<'a>(graph: &'a Graph, values: &'a [Vec<Vec<f64>>], r: NodeRef) -> Result<Arg<'a>, BackendError> {
    let desc = graph.desc(r)?;
    let data = values
        .get(r.node)
        .and_then(|ports| ports.get(r.port))
        .ok_or(GraphError::UnknownNode {
            node: r.node,
            port: r.port,
        })?;
    Ok(Arg {
        shape: &desc.shape,
        data,
    })
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut s = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        s[d] = s[d + 1] * shape[d + 1];
    }
    s
}

/// Advance a row-major multi-index; returns false after the last element.
fn increment(idx: &mut [usize], shape: &[usize]) -> bool {
    for d in (0..shape.len()).rev() {
        idx[d] += 1;
        if idx[d] < shape[d] {
            return true;
        }
        idx[d] = 0;
    }
    false
}

/// For each output element, the offset of the broadcast source element.
fn broadcast_offsets(out_shape: &[usize], in_shape: &[usize]) -> Vec<usize> {
    let rank = out_shape.len();
    let lead = rank - in_shape.len();
    let in_strides = strides(in_shape);
    let mut eff = vec![0; rank];
    for d in lead..rank {
        if in_shape[d - lead] != 1 {
            eff[d] = in_strides[d - lead];
        }
    }
    let total: usize = out_shape.iter().product();
    let mut offsets = Vec::with_capacity(total);
    let mut idx = vec![0; rank];
    for _ in 0..total {
        offsets.push(idx.iter().zip(&eff).map(|(i, s)| i * s).sum());
        increment(&mut idx, out_shape);
    }
    offsets
}

fn zip_broadcast(
    out: &TensorDesc,
    a: &Arg<'_>,
    b: &Arg<'_>,
    f: impl Fn(f64, f64) -> Result<f64, String>,
) -> Result<Vec<f64>, String> {
    let oa = broadcast_offsets(&out.shape, a.shape);
    let ob = broadcast_offsets(&out.shape, b.shape);
    oa.iter()
        .zip(&ob)
        .map(|(&i, &j)| f(a.data[i], b.data[j]))
        .collect()
}

fn bool_value(v: bool) -> f64 {
    if v {
        1.0
    } else {
        0.0
    }
}

/// Split a shape around `axis` into (outer, extent, inner).
fn around(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    (outer, shape[axis], inner)
}

fn evaluate(node: &Node, args: &[Arg<'_>]) -> Result<Vec<Vec<f64>>, String> {
    let out = &node.outputs[0];
    let single = |data: Vec<f64>| -> Result<Vec<Vec<f64>>, String> { Ok(vec![data]) };
    match &node.op {
        Op::Parameter { .. } | Op::Constant { .. } => Err("source node evaluated as kernel".into()),
        Op::Convert | Op::Reshape => single(args[0].data.to_vec()),
        Op::Binary(op) => {
            let integral = !out.element_type.is_float();
            single(zip_broadcast(out, &args[0], &args[1], |a, b| binary(*op, a, b, integral))?)
        }
        Op::Compare(op) => single(zip_broadcast(out, &args[0], &args[1], |a, b| {
            Ok(bool_value(match op {
                CompareOp::Equal => a == b,
                CompareOp::NotEqual => a != b,
                CompareOp::Greater => a > b,
                CompareOp::GreaterEqual => a >= b,
                CompareOp::Less => a < b,
                CompareOp::LessEqual => a <= b,
            }))
        })?),
        Op::Logical(op) => single(zip_broadcast(out, &args[0], &args[1], |a, b| {
            Ok(bool_value(match op {
                LogicalOp::And => a != 0.0 && b != 0.0,
                LogicalOp::Or => a != 0.0 || b != 0.0,
            }))
        })?),
        Op::Unary(op) => single(args[0].data.iter().map(|&x| unary(*op, x)).collect()),
        Op::RoundHalfToEven => single(args[0].data.iter().map(|x| x.round_ties_even()).collect()),
        Op::Clamp { min, max } => single(args[0].data.iter().map(|x| x.clamp(*min, *max)).collect()),
        Op::Select => {
            let oc = broadcast_offsets(&out.shape, args[0].shape);
            let oa = broadcast_offsets(&out.shape, args[1].shape);
            let ob = broadcast_offsets(&out.shape, args[2].shape);
            single(
                (0..oc.len())
                    .map(|i| {
                        if args[0].data[oc[i]] != 0.0 {
                            args[1].data[oa[i]]
                        } else {
                            args[2].data[ob[i]]
                        }
                    })
                    .collect(),
            )
        }
        Op::Transpose { perm } => single(transpose(&args[0], perm, &out.shape)),
        Op::Concat { axis } => single(concat(args, *axis)),
        Op::Split { axis, parts } => Ok(split(&args[0], *axis, *parts)),
        Op::Slice { starts, strides } => single(slice(&args[0], starts, strides, &out.shape)),
        Op::Pad { begin, value, .. } => single(pad(&args[0], begin, *value, &out.shape)),
        Op::Tile { .. } => single(tile(&args[0], &out.shape)),
        Op::Gather { axis } => single(gather(&args[0], &args[1], *axis)?),
        Op::Reduce { op, axes, .. } => single(reduce(&args[0], *op, axes)),
        Op::ArgReduce { max, axis } => single(arg_reduce(&args[0], *max, *axis)),
        Op::TopK { k } => Ok(top_k(&args[0], *k)),
        Op::MatMul { transpose_b } => single(matmul(&args[0], &args[1], *transpose_b, &out.shape)),
        Op::Softmax { axis } => single(softmax(&args[0], *axis)),
        Op::Mvn { axes, epsilon } => single(mvn(&args[0], axes, *epsilon)),
        Op::Convolution(attrs) => {
            let w = args[1].shape;
            let filter = [1, w[0], w[1], w[2], w[3]];
            single(convolution(&args[0], args[1].data, &filter, attrs, &out.shape))
        }
        Op::GroupConvolution(attrs) => {
            let w = args[1].shape;
            let filter = [w[0], w[1], w[2], w[3], w[4]];
            single(convolution(&args[0], args[1].data, &filter, attrs, &out.shape))
        }
        Op::Pool(attrs) => single(pool(&args[0], attrs, &out.shape)),
        Op::DepthToSpace { block } => single(depth_to_space(&args[0], *block, &out.shape)),
        Op::SpaceToDepth { block } => single(space_to_depth(&args[0], *block, &out.shape)),
    }
}

fn binary(op: BinaryOp, a: f64, b: f64, integral: bool) -> Result<f64, String> {
    Ok(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if integral => {
            if b == 0.0 {
                return Err("integer division by zero".into());
            }
            (a / b).floor()
        }
        BinaryOp::Div => a / b,
        BinaryOp::Max => a.max(b),
        BinaryOp::Min => a.min(b),
        BinaryOp::Pow => a.powf(b),
    })
}

fn unary(op: UnaryOp, x: f64) -> f64 {
    match op {
        UnaryOp::Abs => x.abs(),
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Neg => -x,
        UnaryOp::Sin => x.sin(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Rsqrt => 1.0 / x.sqrt(),
        UnaryOp::Floor => x.floor(),
        UnaryOp::Tanh => x.tanh(),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        UnaryOp::Relu => x.max(0.0),
        UnaryOp::Not => bool_value(x == 0.0),
    }
}

fn transpose(x: &Arg<'_>, perm: &[usize], out_shape: &[usize]) -> Vec<f64> {
    let in_strides = strides(x.shape);
    let total: usize = out_shape.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut idx = vec![0; out_shape.len()];
    for _ in 0..total {
        let offset: usize = idx.iter().enumerate().map(|(i, o)| o * in_strides[perm[i]]).sum();
        out.push(x.data[offset]);
        increment(&mut idx, out_shape);
    }
    out
}

fn concat(args: &[Arg<'_>], axis: usize) -> Vec<f64> {
    let (outer, _, _) = around(args[0].shape, axis);
    let mut out = Vec::new();
    for o in 0..outer {
        for a in args {
            let (_, extent, inner) = around(a.shape, axis);
            let chunk = extent * inner;
            out.extend_from_slice(&a.data[o * chunk..(o + 1) * chunk]);
        }
    }
    out
}

fn split(x: &Arg<'_>, axis: usize, parts: usize) -> Vec<Vec<f64>> {
    let (outer, extent, inner) = around(x.shape, axis);
    let chunk = extent / parts * inner;
    let mut outs = vec![Vec::with_capacity(outer * chunk); parts];
    for o in 0..outer {
        for (p, part) in outs.iter_mut().enumerate() {
            let start = o * extent * inner + p * chunk;
            part.extend_from_slice(&x.data[start..start + chunk]);
        }
    }
    outs
}

fn slice(x: &Arg<'_>, starts: &[i64], steps: &[i64], out_shape: &[usize]) -> Vec<f64> {
    let in_strides = strides(x.shape);
    let total: usize = out_shape.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut idx = vec![0; out_shape.len()];
    for _ in 0..total {
        let offset: i64 = idx
            .iter()
            .enumerate()
            .map(|(d, &o)| (starts[d] + o as i64 * steps[d]) * in_strides[d] as i64)
            .sum();
        out.push(x.data[offset as usize]);
        increment(&mut idx, out_shape);
    }
    out
}

fn pad(x: &Arg<'_>, begin: &[usize], value: f64, out_shape: &[usize]) -> Vec<f64> {
    let out_strides = strides(out_shape);
    let mut out = vec![value; out_shape.iter().product()];
    let mut idx = vec![0; x.shape.len()];
    for &v in x.data {
        let offset: usize = idx
            .iter()
            .enumerate()
            .map(|(d, &i)| (i + begin[d]) * out_strides[d])
            .sum();
        out[offset] = v;
        increment(&mut idx, x.shape);
    }
    out
}

fn tile(x: &Arg<'_>, out_shape: &[usize]) -> Vec<f64> {
    let in_strides = strides(x.shape);
    let total: usize = out_shape.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut idx = vec![0; out_shape.len()];
    for _ in 0..total {
        let offset: usize = idx
            .iter()
            .enumerate()
            .map(|(d, &o)| (o % x.shape[d]) * in_strides[d])
            .sum();
        out.push(x.data[offset]);
        increment(&mut idx, out_shape);
    }
    out
}

fn gather(x: &Arg<'_>, indices: &Arg<'_>, axis: usize) -> Result<Vec<f64>, String> {
    let (outer, extent, inner) = around(x.shape, axis);
    let mut out = Vec::with_capacity(outer * indices.data.len() * inner);
    for o in 0..outer {
        for &raw in indices.data {
            let i = raw as i64;
            if i < 0 || i as usize >= extent {
                return Err(format!("index {i} outside 0..{extent}"));
            }
            let start = (o * extent + i as usize) * inner;
            out.extend_from_slice(&x.data[start..start + inner]);
        }
    }
    Ok(out)
}

/// Offsets into a keep-dims reduced tensor for every input element.
fn reduced_offsets(shape: &[usize], axes: &[usize]) -> (Vec<usize>, usize) {
    let kept: Vec<usize> = shape
        .iter()
        .enumerate()
        .map(|(d, &n)| if axes.contains(&d) { 1 } else { n })
        .collect();
    let kept_strides = strides(&kept);
    let total: usize = shape.iter().product();
    let mut offsets = Vec::with_capacity(total);
    let mut idx = vec![0; shape.len()];
    for _ in 0..total {
        let offset: usize = idx
            .iter()
            .enumerate()
            .map(|(d, &i)| if axes.contains(&d) { 0 } else { i * kept_strides[d] })
            .sum();
        offsets.push(offset);
        increment(&mut idx, shape);
    }
    (offsets, kept.iter().product())
}

fn reduce(x: &Arg<'_>, op: ReduceOp, axes: &[usize]) -> Vec<f64> {
    let (offsets, out_len) = reduced_offsets(x.shape, axes);
    let init = match op {
        ReduceOp::Sum | ReduceOp::Mean | ReduceOp::Any => 0.0,
        ReduceOp::Prod | ReduceOp::All => 1.0,
        ReduceOp::Max => f64::NEG_INFINITY,
        ReduceOp::Min => f64::INFINITY,
    };
    let mut out = vec![init; out_len];
    for (&v, &o) in x.data.iter().zip(&offsets) {
        out[o] = match op {
            ReduceOp::Sum | ReduceOp::Mean => out[o] + v,
            ReduceOp::Prod => out[o] * v,
            ReduceOp::Max => out[o].max(v),
            ReduceOp::Min => out[o].min(v),
            ReduceOp::Any => bool_value(out[o] != 0.0 || v != 0.0),
            ReduceOp::All => bool_value(out[o] != 0.0 && v != 0.0),
        };
    }
    if op == ReduceOp::Mean && out_len > 0 {
        let count = (x.data.len() / out_len) as f64;
        out.iter_mut().for_each(|v| *v /= count);
    }
    out
}

fn arg_reduce(x: &Arg<'_>, max: bool, axis: usize) -> Vec<f64> {
    let (outer, extent, inner) = around(x.shape, axis);
    let mut out = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| x.data[(o * extent + k) * inner + i];
            let mut best = 0;
            for k in 1..extent {
                let better = if max { at(k) > at(best) } else { at(k) < at(best) };
                if better {
                    best = k;
                }
            }
            out.push(best as f64);
        }
    }
    out
}

fn top_k(x: &Arg<'_>, k: usize) -> Vec<Vec<f64>> {
    let extent = x.shape.last().copied().unwrap_or(1);
    let rows = if extent == 0 { 0 } else { x.data.len() / extent };
    let mut values = Vec::with_capacity(rows * k);
    let mut indices = Vec::with_capacity(rows * k);
    for row in x.data.chunks(extent.max(1)).take(rows) {
        let mut order: Vec<usize> = (0..extent).collect();
        // Stable, so equal values keep ascending indices.
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
        for &i in order.iter().take(k) {
            values.push(row[i]);
            indices.push(i as f64);
        }
    }
    vec![values, indices]
}

fn matmul(a: &Arg<'_>, b: &Arg<'_>, transpose_b: bool, out_shape: &[usize]) -> Vec<f64> {
    let (m, n) = (out_shape[0], out_shape[1]);
    let k = a.shape[1];
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k)
                .map(|p| {
                    let bv = if transpose_b { b.data[j * k + p] } else { b.data[p * n + j] };
                    a.data[i * k + p] * bv
                })
                .sum();
        }
    }
    out
}

fn softmax(x: &Arg<'_>, axis: usize) -> Vec<f64> {
    let (outer, extent, inner) = around(x.shape, axis);
    let mut out = vec![0.0; x.data.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * extent + k) * inner + i;
            let peak = (0..extent).map(|k| x.data[at(k)]).fold(f64::NEG_INFINITY, f64::max);
            let sum: f64 = (0..extent).map(|k| (x.data[at(k)] - peak).exp()).sum();
            for k in 0..extent {
                out[at(k)] = (x.data[at(k)] - peak).exp() / sum;
            }
        }
    }
    out
}

fn mvn(x: &Arg<'_>, axes: &[usize], epsilon: f64) -> Vec<f64> {
    let (offsets, groups) = reduced_offsets(x.shape, axes);
    let count = (x.data.len() / groups.max(1)) as f64;
    let mut mean = vec![0.0; groups];
    for (&v, &o) in x.data.iter().zip(&offsets) {
        mean[o] += v / count;
    }
    let mut var = vec![0.0; groups];
    for (&v, &o) in x.data.iter().zip(&offsets) {
        var[o] += (v - mean[o]).powi(2) / count;
    }
    x.data
        .iter()
        .zip(&offsets)
        .map(|(&v, &o)| (v - mean[o]) / (var[o] + epsilon).sqrt())
        .collect()
}

/// Grouped NCHW convolution; `filter` is `[groups, out/groups, in/groups, kh, kw]`.
fn convolution(
    x: &Arg<'_>,
    w: &[f64],
    filter: &[usize; 5],
    attrs: &Conv2dAttrs,
    out_shape: &[usize],
) -> Vec<f64> {
    let [groups, og, cg, kh, kw] = *filter;
    let (n, c, h, wd) = (x.shape[0], x.shape[1], x.shape[2], x.shape[3]);
    let (oh, ow) = (out_shape[2], out_shape[3]);
    let mut out = vec![0.0; out_shape.iter().product()];
    for b in 0..n {
        for g in 0..groups {
            for oc in 0..og {
                let out_c = g * og + oc;
                for y in 0..oh {
                    for xo in 0..ow {
                        let mut acc = 0.0;
                        for ic in 0..cg {
                            let in_c = g * cg + ic;
                            for ky in 0..kh {
                                let iy = (y * attrs.strides[0] + ky * attrs.dilations[0]) as isize
                                    - attrs.pads_begin[0] as isize;
                                if iy < 0 || iy as usize >= h {
                                    continue;
                                }
                                for kx in 0..kw {
                                    let ix = (xo * attrs.strides[1] + kx * attrs.dilations[1]) as isize
                                        - attrs.pads_begin[1] as isize;
                                    if ix < 0 || ix as usize >= wd {
                                        continue;
                                    }
                                    let xv = x.data[((b * c + in_c) * h + iy as usize) * wd + ix as usize];
                                    let wv = w[(((g * og + oc) * cg + ic) * kh + ky) * kw + kx];
                                    acc += xv * wv;
                                }
                            }
                        }
                        out[((b * groups * og + out_c) * oh + y) * ow + xo] = acc;
                    }
                }
            }
        }
    }
    out
}

fn pool(x: &Arg<'_>, attrs: &Pool2dAttrs, out_shape: &[usize]) -> Vec<f64> {
    let (n, c, h, w) = (x.shape[0], x.shape[1], x.shape[2], x.shape[3]);
    let (oh, ow) = (out_shape[2], out_shape[3]);
    let mut out = Vec::with_capacity(n * c * oh * ow);
    for plane in 0..n * c {
        let base = plane * h * w;
        for y in 0..oh {
            for xo in 0..ow {
                let y0 = (y * attrs.strides[0]) as isize - attrs.pads_begin[0] as isize;
                let x0 = (xo * attrs.strides[1]) as isize - attrs.pads_begin[1] as isize;
                let mut acc = match attrs.kind {
                    PoolKind::Max => f64::NEG_INFINITY,
                    _ => 0.0,
                };
                let mut count = 0usize;
                for iy in y0.max(0)..(y0 + attrs.kernel[0] as isize).min(h as isize) {
                    for ix in x0.max(0)..(x0 + attrs.kernel[1] as isize).min(w as isize) {
                        let v = x.data[base + iy as usize * w + ix as usize];
                        acc = match attrs.kind {
                            PoolKind::Max => acc.max(v),
                            PoolKind::Average => acc + v,
                            PoolKind::L2 => acc + v * v,
                        };
                        count += 1;
                    }
                }
                out.push(match attrs.kind {
                    _ if count == 0 => 0.0,
                    PoolKind::Max => acc,
                    PoolKind::Average => acc / count as f64,
                    PoolKind::L2 => (acc / count as f64).sqrt(),
                });
            }
        }
    }
    out
}

fn depth_to_space(x: &Arg<'_>, block: usize, out_shape: &[usize]) -> Vec<f64> {
    let (c, h, w) = (x.shape[1], x.shape[2], x.shape[3]);
    let (oc, oh, ow) = (out_shape[1], out_shape[2], out_shape[3]);
    let mut out = vec![0.0; out_shape.iter().product()];
    for b in 0..out_shape[0] {
        for ch in 0..oc {
            for y in 0..oh {
                for xo in 0..ow {
                    let (iy, by) = (y / block, y % block);
                    let (ix, bx) = (xo / block, xo % block);
                    let in_c = (by * block + bx) * oc + ch;
                    out[((b * oc + ch) * oh + y) * ow + xo] = x.data[((b * c + in_c) * h + iy) * w + ix];
                }
            }
        }
    }
    out
}

fn space_to_depth(x: &Arg<'_>, block: usize, out_shape: &[usize]) -> Vec<f64> {
    let (c, h, w) = (x.shape[1], x.shape[2], x.shape[3]);
    let (oc, oh, ow) = (out_shape[1], out_shape[2], out_shape[3]);
    let mut out = vec![0.0; out_shape.iter().product()];
    for b in 0..out_shape[0] {
        for ch in 0..c {
            for y in 0..h {
                for xi in 0..w {
                    let (oy, by) = (y / block, y % block);
                    let (ox, bx) = (xi / block, xi % block);
                    let out_c = (by * block + bx) * c + ch;
                    out[((b * oc + out_c) * oh + oy) * ow + ox] = x.data[((b * c + ch) * h + y) * w + xi];
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ElementType, TensorDesc};

    fn run(graph: &Graph, inputs: &[HostTensor]) -> Vec<HostTensor> {
        ReferenceExecutor.execute(graph, inputs).unwrap()
    }

    #[test]
    fn test_broadcast_add() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[2, 3]));
        let b = g.constant_f32(&[3], &[10.0, 20.0, 30.0]);
        let y = g.binary(BinaryOp::Add, x, b).unwrap();
        g.result(y).unwrap();

        let out = run(&g, &[HostTensor::from_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])]);
        assert_eq!(out[0].to_f32_vec(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_round_half_to_even() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[4]));
        let y = g.round_half_to_even(x).unwrap();
        g.result(y).unwrap();

        let out = run(&g, &[HostTensor::from_f32(&[4], &[2.5, 3.5, -0.5, 1.4])]);
        assert_eq!(out[0].to_f32_vec(), vec![2.0, 4.0, -0.0, 1.0]);
    }

    #[test]
    fn test_top_k_rows_with_ties() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[2, 4]));
        let (values, indices) = g.top_k(x, 2).unwrap();
        g.result(values).unwrap();
        g.result(indices).unwrap();

        let input = HostTensor::from_f32(&[2, 4], &[1.0, 5.0, 3.0, 5.0, -1.0, -4.0, 0.5, -2.0]);
        let out = run(&g, &[input]);
        assert_eq!(out[0].to_f32_vec(), vec![5.0, 5.0, 0.5, -1.0]);
        assert_eq!(out[1].element_type(), ElementType::I32);
        assert_eq!(out[1].to_f32_vec(), vec![1.0, 3.0, 2.0, 0.0]);
        assert!(g.top_k(x, 5).is_err());
    }

    #[test]
    fn test_transpose_nhwc_to_nchw() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[1, 2, 2, 2]));
        let y = g.transpose(x, &[0, 3, 1, 2]).unwrap();
        g.result(y).unwrap();

        // channels interleaved: (c0, c1) per pixel
        let input = HostTensor::from_f32(&[1, 2, 2, 2], &[1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]);
        let out = run(&g, &[input]);
        assert_eq!(out[0].to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_convolution_with_padding() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[1, 1, 3, 3]));
        let w = g.constant_f32(&[1, 1, 3, 3], &[1.0; 9]);
        let attrs = Conv2dAttrs {
            strides: [1, 1],
            dilations: [1, 1],
            pads_begin: [1, 1],
            pads_end: [1, 1],
        };
        let y = g.convolution(x, w, attrs).unwrap();
        g.result(y).unwrap();

        let out = run(&g, &[HostTensor::from_f32(&[1, 1, 3, 3], &[1.0; 9])]);
        assert_eq!(
            out[0].to_f32_vec(),
            vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]
        );
    }

    #[test]
    fn test_average_pool_excludes_padding() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[1, 1, 2, 2]));
        let attrs = Pool2dAttrs {
            kind: PoolKind::Average,
            kernel: [2, 2],
            strides: [1, 1],
            pads_begin: [1, 1],
            pads_end: [0, 0],
        };
        let y = g.pool(x, attrs).unwrap();
        g.result(y).unwrap();

        let out = run(&g, &[HostTensor::from_f32(&[1, 1, 2, 2], &[1.0, 2.0, 3.0, 4.0])]);
        assert_eq!(out[0].to_f32_vec(), vec![1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn test_integer_narrowing_saturates() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[3]));
        let y = g.convert(x, ElementType::U8).unwrap();
        g.result(y).unwrap();

        let out = run(&g, &[HostTensor::from_f32(&[3], &[-4.0, 17.9, 999.0])]);
        assert_eq!(out[0].as_bytes(), &[0, 17, 255]);
    }

    #[test]
    fn test_reduce_mean_and_argmax() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[2, 3]));
        let mean = g.reduce(ReduceOp::Mean, x, &[1], false).unwrap();
        let arg = g.arg_reduce(x, 1, true).unwrap();
        g.result(mean).unwrap();
        g.result(arg).unwrap();

        let out = run(&g, &[HostTensor::from_f32(&[2, 3], &[1.0, 5.0, 3.0, 9.0, 2.0, 9.0])]);
        assert_eq!(out[0].to_f32_vec(), vec![3.0, 20.0 / 3.0]);
        assert_eq!(out[1].values(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_depth_space_inverse() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[1, 4, 1, 1]));
        let y = g.depth_to_space(x, 2).unwrap();
        let z = g.space_to_depth(y, 2).unwrap();
        g.result(y).unwrap();
        g.result(z).unwrap();

        let out = run(&g, &[HostTensor::from_f32(&[1, 4, 1, 1], &[1.0, 2.0, 3.0, 4.0])]);
        assert_eq!(out[0].shape(), &[1, 1, 2, 2]);
        assert_eq!(out[0].to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(out[1].to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_input_shape_mismatch_is_reported() {
        let mut g = Graph::new();
        let x = g.parameter(TensorDesc::new(ElementType::F32, &[2]));
        g.result(x).unwrap();
        let err = ReferenceExecutor
            .execute(&g, &[HostTensor::from_f32(&[3], &[0.0; 3])])
            .unwrap_err();
        assert!(matches!(err, BackendError::InputMismatch { index: 0, .. }));
    }
}
