//! Shape and data-movement operations.
//!
//! When the primary output keeps the input's encoding, values move in their
//! stored form and the output is bound without re-quantization. Otherwise
//! they pass through real values like any other operation.

use crate::backend::NodeRef;
use crate::model::{OperandType, OperationKind, Quantization};

use super::common::{normalize_axis, LayoutConversion};
use super::{BuildError, OperationView, TranslateContext, Translator, TranslatorRegistry};

pub(super) fn register(registry: &mut TranslatorRegistry) {
    registry.register(OperationKind::Reshape, |_| moving(Reshape));
    registry.register(OperationKind::Squeeze, |_| moving(Squeeze));
    registry.register(OperationKind::ExpandDims, |_| moving(ExpandDims));
    registry.register(OperationKind::Transpose, |_| moving(Transpose));
    registry.register(OperationKind::Pad, |_| moving(Pad { explicit_value: false }));
    registry.register(OperationKind::PadV2, |_| moving(Pad { explicit_value: true }));
    registry.register(OperationKind::Gather, |_| moving(Gather));
    registry.register(OperationKind::StridedSlice, |_| moving(StridedSlice));
    registry.register(OperationKind::Slice, |_| moving(Slice));
    registry.register(OperationKind::Tile, |_| moving(Tile));
    registry.register(OperationKind::DepthToSpace, |_| moving(SpaceDepth { to_space: true }));
    registry.register(OperationKind::SpaceToDepth, |_| moving(SpaceDepth { to_space: false }));
    registry.register(OperationKind::BatchToSpaceNd, |_| moving(BatchToSpace));
    registry.register(OperationKind::SpaceToBatchNd, |_| moving(SpaceToBatch));
    registry.register(OperationKind::ChannelShuffle, |_| moving(ChannelShuffle));
    registry.register(OperationKind::Concatenation, |_| Box::new(Concatenation) as Box<dyn Translator>);
    registry.register(OperationKind::Split, |_| Box::new(Split) as Box<dyn Translator>);
}

fn moving<M: Movement + 'static>(op: M) -> Box<dyn Translator> {
    Box::new(Moving(op))
}

/// True when `a` and `b` share an encoding, quantization included.
fn same_encoding(a: (OperandType, &Quantization), b: (OperandType, &Quantization)) -> bool {
    a.0 == b.0 && a.1 == b.1
}

fn passthrough(op: &OperationView<'_>) -> bool {
    match (op.input_operand(0), op.output_operand(0)) {
        (Ok(i), Ok(o)) => same_encoding((i.operand_type, &i.quantization), (o.operand_type, &o.quantization)),
        _ => false,
    }
}

/// An operation that rearranges the elements of input 0.
trait Movement: Send + Sync {
    fn kind(&self) -> OperationKind;

    fn validate(&self, op: &OperationView<'_>) -> bool;

    /// `raw` is true when `x` carries the stored encoding of input 0.
    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, raw: bool) -> Result<NodeRef, BuildError>;
}

struct Moving<M>(M);

impl<M: Movement> Translator for Moving<M> {
    fn kind(&self) -> OperationKind {
        self.0.kind()
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_type(0).is_some_and(|t| !t.is_scalar()) && self.0.validate(op)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let raw = passthrough(&ctx.view());
        let x = if raw { ctx.input_raw(0)? } else { ctx.input(0)? };
        self.0.apply(ctx, x, raw)
    }

    fn wire(&self, ctx: &mut TranslateContext<'_>) -> Result<(), BuildError> {
        let node = self.build(ctx)?;
        if passthrough(&ctx.view()) {
            ctx.register_output(0, node)
        } else {
            ctx.finish(0, node)
        }
    }
}

/// Constant INT32 vector at slot `n`, as non-negative sizes.
fn sizes_at(op: &OperationView<'_>, n: usize) -> Result<Vec<usize>, BuildError> {
    op.vector_i32(n)?
        .into_iter()
        .map(|v| usize::try_from(v).map_err(|_| op.invalid(format!("negative size {v} at input {n}"))))
        .collect()
}

fn axis_in(op: &OperationView<'_>, axis: i32, rank: usize) -> Result<usize, BuildError> {
    normalize_axis(axis, rank).ok_or_else(|| op.invalid(format!("axis {axis} out of range for rank {rank}")))
}

/// Resolve a target shape with at most one -1 entry against `total` elements.
pub(crate) fn resolve_reshape(target: &[i32], total: usize) -> Option<Vec<usize>> {
    let mut inferred = None;
    let mut known = 1usize;
    for (i, &d) in target.iter().enumerate() {
        match d {
            -1 if inferred.is_none() => inferred = Some(i),
            d if d >= 0 => known = known.checked_mul(d as usize)?,
            _ => return None,
        }
    }
    let mut shape: Vec<usize> = target.iter().map(|&d| d.max(0) as usize).collect();
    match inferred {
        Some(i) => {
            if known == 0 || total % known != 0 {
                return None;
            }
            shape[i] = total / known;
        }
        None if known != total => return None,
        None => {}
    }
    Some(shape)
}

struct Reshape;

impl Movement for Reshape {
    fn kind(&self) -> OperationKind {
        OperationKind::Reshape
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 2 && op.input_operand(1).is_ok_and(|o| o.is_constant())
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let total: usize = ctx.shape(x)?.iter().product();
        let target = ctx.vector_i32(1)?;
        let shape = resolve_reshape(&target, total)
            .ok_or_else(|| ctx.invalid(format!("cannot reshape {total} elements to {target:?}")))?;
        Ok(ctx.graph().reshape(x, &shape)?)
    }
}

/// Drops size-1 axes: the listed ones, or all of them when no list is given.
struct Squeeze;

impl Movement for Squeeze {
    fn kind(&self) -> OperationKind {
        OperationKind::Squeeze
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (1..=2).contains(&op.input_count())
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let shape = ctx.shape(x)?;
        let rank = shape.len();
        let axes: Vec<usize> = if ctx.is_omitted(1) {
            (0..rank).filter(|&d| shape[d] == 1).collect()
        } else {
            ctx.vector_i32(1)?
                .into_iter()
                .map(|a| axis_in(&ctx.view(), a, rank))
                .collect::<Result<_, _>>()?
        };
        if let Some(&d) = axes.iter().find(|&&d| shape[d] != 1) {
            return Err(ctx.invalid(format!("axis {d} has extent {}", shape[d])));
        }
        let squeezed: Vec<usize> = (0..rank).filter(|d| !axes.contains(d)).map(|d| shape[d]).collect();
        Ok(ctx.graph().reshape(x, &squeezed)?)
    }
}

struct ExpandDims;

impl Movement for ExpandDims {
    fn kind(&self) -> OperationKind {
        OperationKind::ExpandDims
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 2
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let mut shape = ctx.shape(x)?;
        let axis = axis_in(&ctx.view(), ctx.scalar_i32(1)?, shape.len() + 1)?;
        shape.insert(axis, 1);
        Ok(ctx.graph().reshape(x, &shape)?)
    }
}

/// Permutes axes; reverses them when no permutation is given.
struct Transpose;

impl Movement for Transpose {
    fn kind(&self) -> OperationKind {
        OperationKind::Transpose
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (1..=2).contains(&op.input_count())
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let rank = ctx.shape(x)?.len();
        let perm: Vec<usize> = if ctx.is_omitted(1) {
            (0..rank).rev().collect()
        } else {
            sizes_at(&ctx.view(), 1)?
        };
        Ok(ctx.graph().transpose(x, &perm)?)
    }
}

/// PAD fills with zero (the zero point for stored encodings); PAD_V2 reads the
/// fill value from input 2 in the input's own encoding.
struct Pad {
    explicit_value: bool,
}

impl Movement for Pad {
    fn kind(&self) -> OperationKind {
        if self.explicit_value {
            OperationKind::PadV2
        } else {
            OperationKind::Pad
        }
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        let arity = if self.explicit_value { 3 } else { 2 };
        op.input_count() == arity && op.input_operand(1).is_ok_and(|o| o.is_constant())
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, raw: bool) -> Result<NodeRef, BuildError> {
        let rank = ctx.shape(x)?.len();
        let paddings = sizes_at(&ctx.view(), 1)?;
        if paddings.len() != rank * 2 {
            return Err(ctx.invalid(format!("{} padding values for rank {rank}", paddings.len())));
        }
        let begin: Vec<usize> = paddings.iter().step_by(2).copied().collect();
        let end: Vec<usize> = paddings.iter().skip(1).step_by(2).copied().collect();

        let input = ctx.input_operand(0)?;
        let quantized = input.operand_type.is_quantized();
        // Fill value in the stored encoding of input 0.
        let stored = if !self.explicit_value {
            if quantized { f64::from(input.zero_point()) } else { 0.0 }
        } else if quantized {
            f64::from(ctx.scalar_i32(2)?)
        } else {
            f64::from(ctx.scalar_f32(2)?)
        };
        let value = if raw || !quantized {
            stored
        } else {
            (stored - f64::from(input.zero_point())) * f64::from(input.scale())
        };
        Ok(ctx.graph().pad(x, &begin, &end, value)?)
    }
}

/// Input 0 data, input 1 axis, input 2 INT32 indices.
struct Gather;

impl Movement for Gather {
    fn kind(&self) -> OperationKind {
        OperationKind::Gather
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 3 && op.input_type(2) == Some(OperandType::TensorInt32)
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let rank = ctx.shape(x)?.len();
        let axis = axis_in(&ctx.view(), ctx.scalar_i32(1)?, rank)?;
        let indices = ctx.input_raw(2)?;
        Ok(ctx.graph().gather(x, indices, axis)?)
    }
}

/// One axis of a strided slice after masks and clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SliceAxis {
    pub start: i64,
    pub stride: i64,
    pub size: usize,
}

/// Resolve STRIDED_SLICE bounds for one axis of extent `dim`.
pub(crate) fn strided_axis(
    dim: usize,
    begin: i32,
    end: i32,
    stride: i32,
    begin_masked: bool,
    end_masked: bool,
    shrink: bool,
) -> Option<SliceAxis> {
    if stride == 0 {
        return None;
    }
    let dim = dim as i64;
    let stride = i64::from(stride);
    let resolve = |v: i32| {
        let v = i64::from(v);
        if v < 0 { v + dim } else { v }
    };
    let clamp = |v: i64| {
        if stride > 0 { v.clamp(0, dim) } else { v.clamp(-1, dim - 1) }
    };
    let start = if begin_masked {
        if stride > 0 { 0 } else { dim - 1 }
    } else {
        clamp(resolve(begin))
    };
    if shrink {
        let start = resolve(begin);
        if start < 0 || start >= dim {
            return None;
        }
        return Some(SliceAxis { start, stride: 1, size: 1 });
    }
    let stop = if end_masked {
        if stride > 0 { dim } else { -1 }
    } else {
        clamp(resolve(end))
    };
    let span = if stride > 0 { stop - start } else { start - stop };
    let step = stride.abs();
    let size = if span <= 0 { 0 } else { ((span + step - 1) / step) as usize };
    Some(SliceAxis { start, stride, size })
}

/// Inputs: data, begin, end, strides, begin_mask, end_mask, shrink_axis_mask.
struct StridedSlice;

impl Movement for StridedSlice {
    fn kind(&self) -> OperationKind {
        OperationKind::StridedSlice
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 7 && (1..=3).all(|n| op.input_operand(n).is_ok_and(|o| o.is_constant()))
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let shape = ctx.shape(x)?;
        let rank = shape.len();
        let begin = ctx.vector_i32(1)?;
        let end = ctx.vector_i32(2)?;
        let strides = ctx.vector_i32(3)?;
        if begin.len() != rank || end.len() != rank || strides.len() != rank {
            return Err(ctx.invalid(format!("slice vectors do not match rank {rank}")));
        }
        let begin_mask = ctx.scalar_i32(4)?;
        let end_mask = ctx.scalar_i32(5)?;
        let shrink_mask = ctx.scalar_i32(6)?;
        let bit = |mask: i32, d: usize| mask & (1 << d) != 0;

        let mut starts = Vec::with_capacity(rank);
        let mut steps = Vec::with_capacity(rank);
        let mut sizes = Vec::with_capacity(rank);
        let mut kept = Vec::with_capacity(rank);
        for d in 0..rank {
            let axis = strided_axis(
                shape[d],
                begin[d],
                end[d],
                strides[d],
                bit(begin_mask, d),
                bit(end_mask, d),
                bit(shrink_mask, d),
            )
            .ok_or_else(|| ctx.invalid(format!("axis {d} slice is out of range")))?;
            starts.push(axis.start);
            steps.push(axis.stride);
            sizes.push(axis.size);
            if !bit(shrink_mask, d) {
                kept.push(axis.size);
            }
        }
        let g = ctx.graph();
        let sliced = g.slice(x, &starts, &steps, &sizes)?;
        Ok(g.reshape(sliced, &kept)?)
    }
}

/// Inputs: data, begin, size (-1 runs to the end).
struct Slice;

impl Movement for Slice {
    fn kind(&self) -> OperationKind {
        OperationKind::Slice
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 3 && (1..=2).all(|n| op.input_operand(n).is_ok_and(|o| o.is_constant()))
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let shape = ctx.shape(x)?;
        let begin = sizes_at(&ctx.view(), 1)?;
        let size = ctx.vector_i32(2)?;
        if begin.len() != shape.len() || size.len() != shape.len() {
            return Err(ctx.invalid("slice vectors do not match the input rank"));
        }
        let sizes = (0..shape.len())
            .map(|d| match size[d] {
                -1 => shape[d].checked_sub(begin[d]),
                s => usize::try_from(s).ok(),
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ctx.invalid(format!("invalid slice size {size:?}")))?;
        let starts: Vec<i64> = begin.iter().map(|&b| b as i64).collect();
        let steps = vec![1; shape.len()];
        Ok(ctx.graph().slice(x, &starts, &steps, &sizes)?)
    }
}

struct Tile;

impl Movement for Tile {
    fn kind(&self) -> OperationKind {
        OperationKind::Tile
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 2 && op.input_operand(1).is_ok_and(|o| o.is_constant())
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let repeats = sizes_at(&ctx.view(), 1)?;
        Ok(ctx.graph().tile(x, &repeats)?)
    }
}

/// DEPTH_TO_SPACE and SPACE_TO_DEPTH: block at input 1, optional layout at 2.
struct SpaceDepth {
    to_space: bool,
}

impl Movement for SpaceDepth {
    fn kind(&self) -> OperationKind {
        if self.to_space {
            OperationKind::DepthToSpace
        } else {
            OperationKind::SpaceToDepth
        }
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (2..=3).contains(&op.input_count()) && op.input_rank(0) == 4
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let block = ctx.scalar_usize(1)?;
        let nchw = ctx.flag(2)?;
        let x = if nchw { x } else { ctx.transpose(x, LayoutConversion::NhwcToNchw)? };
        let out = if self.to_space {
            ctx.graph().depth_to_space(x, block)?
        } else {
            ctx.graph().space_to_depth(x, block)?
        };
        if nchw {
            Ok(out)
        } else {
            ctx.transpose(out, LayoutConversion::NchwToNhwc)
        }
    }
}

/// Constant `[block h, block w]` vector at slot `n`.
fn block_at(op: &OperationView<'_>, n: usize) -> Result<[usize; 2], BuildError> {
    match sizes_at(op, n)?.as_slice() {
        &[bh, bw] if bh > 0 && bw > 0 => Ok([bh, bw]),
        other => Err(op.invalid(format!("block {other:?} is not two positive sizes"))),
    }
}

fn nhwc_dims(ctx: &TranslateContext<'_>, x: NodeRef) -> Result<[usize; 4], BuildError> {
    <[usize; 4]>::try_from(ctx.shape(x)?).map_err(|s| ctx.invalid(format!("shape {s:?} is not rank 4")))
}

/// BATCH_TO_SPACE_ND: block at input 1, optional layout at 2. Batch entries
/// are interleaved back into `block` tiles of the spatial plane.
struct BatchToSpace;

impl Movement for BatchToSpace {
    fn kind(&self) -> OperationKind {
        OperationKind::BatchToSpaceNd
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (2..=3).contains(&op.input_count())
            && op.input_rank(0) == 4
            && op.input_operand(1).is_ok_and(|o| o.is_constant())
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let [bh, bw] = block_at(&ctx.view(), 1)?;
        let nchw = ctx.flag(2)?;
        let x = if nchw { ctx.transpose(x, LayoutConversion::NchwToNhwc)? } else { x };
        let [batch, h, w, c] = nhwc_dims(ctx, x)?;
        if batch % (bh * bw) != 0 {
            return Err(ctx.invalid(format!("batch {batch} is not a multiple of {bh}x{bw}")));
        }
        let n = batch / (bh * bw);
        let g = ctx.graph();
        let tiles = g.reshape(x, &[bh, bw, n, h, w, c])?;
        let placed = g.transpose(tiles, &[2, 3, 0, 4, 1, 5])?;
        let out = g.reshape(placed, &[n, h * bh, w * bw, c])?;
        if nchw {
            ctx.transpose(out, LayoutConversion::NhwcToNchw)
        } else {
            Ok(out)
        }
    }
}

/// SPACE_TO_BATCH_ND: block at input 1, `[[top, bottom], [left, right]]`
/// paddings at 2, optional layout at 3.
struct SpaceToBatch;

impl Movement for SpaceToBatch {
    fn kind(&self) -> OperationKind {
        OperationKind::SpaceToBatchNd
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (3..=4).contains(&op.input_count())
            && op.input_rank(0) == 4
            && (1..=2).all(|n| op.input_operand(n).is_ok_and(|o| o.is_constant()))
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, raw: bool) -> Result<NodeRef, BuildError> {
        let [bh, bw] = block_at(&ctx.view(), 1)?;
        let paddings = sizes_at(&ctx.view(), 2)?;
        let &[top, bottom, left, right] = paddings.as_slice() else {
            return Err(ctx.invalid(format!("{} padding values for two spatial axes", paddings.len())));
        };
        let nchw = ctx.flag(3)?;
        // Padded cells hold zero; in the stored encoding that is the zero point.
        let fill = if raw { f64::from(ctx.input_operand(0)?.zero_point()) } else { 0.0 };

        let x = if nchw { ctx.transpose(x, LayoutConversion::NchwToNhwc)? } else { x };
        let padded = ctx.graph().pad(x, &[0, top, left, 0], &[0, bottom, right, 0], fill)?;
        let [n, h, w, c] = nhwc_dims(ctx, padded)?;
        if h % bh != 0 || w % bw != 0 {
            return Err(ctx.invalid(format!("padded plane {h}x{w} does not tile by {bh}x{bw}")));
        }
        let g = ctx.graph();
        let tiles = g.reshape(padded, &[n, h / bh, bh, w / bw, bw, c])?;
        let batched = g.transpose(tiles, &[2, 4, 0, 1, 3, 5])?;
        let out = g.reshape(batched, &[bh * bw * n, h / bh, w / bw, c])?;
        if nchw {
            ctx.transpose(out, LayoutConversion::NhwcToNchw)
        } else {
            Ok(out)
        }
    }
}

/// Groups count at input 1, axis at input 2. Channels `[g, c/g]` become
/// `[c/g, g]`.
struct ChannelShuffle;

impl Movement for ChannelShuffle {
    fn kind(&self) -> OperationKind {
        OperationKind::ChannelShuffle
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 3
    }

    fn apply(&self, ctx: &mut TranslateContext<'_>, x: NodeRef, _raw: bool) -> Result<NodeRef, BuildError> {
        let shape = ctx.shape(x)?;
        let groups = ctx.scalar_usize(1)?;
        let axis = axis_in(&ctx.view(), ctx.scalar_i32(2)?, shape.len())?;
        let channels = shape[axis];
        if groups == 0 || channels % groups != 0 {
            return Err(ctx.invalid(format!("{channels} channels do not split into {groups} groups")));
        }
        let mut grouped = shape[..axis].to_vec();
        grouped.extend([groups, channels / groups]);
        grouped.extend_from_slice(&shape[axis + 1..]);
        let mut perm: Vec<usize> = (0..grouped.len()).collect();
        perm.swap(axis, axis + 1);

        let g = ctx.graph();
        let split = g.reshape(x, &grouped)?;
        let swapped = g.transpose(split, &perm)?;
        Ok(g.reshape(swapped, &shape)?)
    }
}

/// Inputs 0..n-1 are joined along the axis scalar in the last slot.
struct Concatenation;

impl Concatenation {
    fn passthrough(op: &OperationView<'_>) -> bool {
        let Ok(out) = op.output_operand(0) else {
            return false;
        };
        (0..op.input_count().saturating_sub(1)).all(|n| {
            op.input_operand(n).is_ok_and(|i| {
                same_encoding((i.operand_type, &i.quantization), (out.operand_type, &out.quantization))
            })
        })
    }
}

impl Translator for Concatenation {
    fn kind(&self) -> OperationKind {
        OperationKind::Concatenation
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() >= 2 && op.input_type(op.input_count() - 1) == Some(OperandType::Int32)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let raw = Self::passthrough(&ctx.view());
        let count = ctx.input_count() - 1;
        let mut parts = Vec::with_capacity(count);
        for n in 0..count {
            parts.push(if raw { ctx.input_raw(n)? } else { ctx.input(n)? });
        }
        let rank = ctx.shape(parts[0])?.len();
        let axis = axis_in(&ctx.view(), ctx.scalar_i32(count)?, rank)?;
        Ok(ctx.graph().concat(&parts, axis)?)
    }

    fn wire(&self, ctx: &mut TranslateContext<'_>) -> Result<(), BuildError> {
        let node = self.build(ctx)?;
        if Self::passthrough(&ctx.view()) {
            ctx.register_output(0, node)
        } else {
            ctx.finish(0, node)
        }
    }
}

/// Equal parts along an axis; every output is bound.
struct Split;

impl Split {
    fn parts(ctx: &mut TranslateContext<'_>, raw: bool) -> Result<Vec<NodeRef>, BuildError> {
        let x = if raw { ctx.input_raw(0)? } else { ctx.input(0)? };
        let rank = ctx.shape(x)?.len();
        let axis = axis_in(&ctx.view(), ctx.scalar_i32(1)?, rank)?;
        let count = ctx.scalar_usize(2)?;
        if count != ctx.output_count() {
            return Err(ctx.invalid(format!("{count} splits for {} outputs", ctx.output_count())));
        }
        Ok(ctx.graph().split(x, axis, count)?)
    }
}

impl Translator for Split {
    fn kind(&self) -> OperationKind {
        OperationKind::Split
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 3 && op.output_count() >= 1 && op.input_type(0).is_some_and(|t| !t.is_scalar())
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let raw = passthrough(&ctx.view());
        Self::parts(ctx, raw)?
            .into_iter()
            .next()
            .ok_or_else(|| ctx.invalid("split produced no parts"))
    }

    fn wire(&self, ctx: &mut TranslateContext<'_>) -> Result<(), BuildError> {
        let raw = passthrough(&ctx.view());
        for (n, part) in Self::parts(ctx, raw)?.into_iter().enumerate() {
            if raw {
                ctx.register_output(n, part)?;
            } else {
                ctx.finish(n, part)?;
            }
        }
        Ok(())
    }
}
