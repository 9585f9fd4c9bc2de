//! Convolutional operations: CONV_2D, DEPTHWISE_CONV_2D, GROUPED_CONV_2D,
//! TRANSPOSE_CONV_2D and FULLY_CONNECTED.
//!
//! Argument layout is chosen from the input count and the type of the slot
//! where the explicit form keeps its last stride: explicit padding carries
//! four pad scalars, implicit padding a single scheme code. The optional
//! layout flag selects NCHW; NHWC inputs are transposed in and out.

use crate::backend::{BinaryOp, Conv2dAttrs, ElementType, NodeRef};
use crate::model::{OperandType, OperationKind, Quantization};

use super::common::{
    calculate_explicit_padding, is_padding_scheme, per_channel_bias_scales, LayoutConversion, PADDING_SAME,
    PADDING_VALID,
};
use super::{BuildError, OperationView, TranslateContext, Translator, TranslatorRegistry};

pub(super) fn register(registry: &mut TranslatorRegistry) {
    registry.register(OperationKind::Conv2d, |_| Box::new(Conv2d) as Box<dyn Translator>);
    registry.register(OperationKind::DepthwiseConv2d, |_| {
        Box::new(DepthwiseConv2d) as Box<dyn Translator>
    });
    registry.register(OperationKind::GroupedConv2d, |_| {
        Box::new(GroupedConv2d) as Box<dyn Translator>
    });
    registry.register(OperationKind::TransposeConv2d, |_| {
        Box::new(TransposeConv2d) as Box<dyn Translator>
    });
    registry.register(OperationKind::FullyConnected, |_| {
        Box::new(FullyConnected) as Box<dyn Translator>
    });
}

/// Parsed spatial parameters. Pairs are (height, width).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConvParams {
    attrs: Conv2dAttrs,
    /// Depth multiplier or group count, when the operation carries one.
    extra: usize,
    activation: i32,
    nchw: bool,
}

/// Read convolution arguments starting at slot 3.
///
/// Explicit: pad left, right, top, bottom, stride w, stride h, [extra],
/// activation, [layout], [dilation w, dilation h].
/// Implicit: scheme, stride w, stride h, [extra], activation, [layout],
/// [dilation w, dilation h].
fn parse_conv(
    op: &OperationView<'_>,
    explicit: bool,
    has_extra: bool,
    kernel: [usize; 2],
) -> Result<ConvParams, BuildError> {
    let (mut next, pads) = if explicit {
        let pads = [
            op.scalar_usize(5)?,
            op.scalar_usize(3)?,
            op.scalar_usize(6)?,
            op.scalar_usize(4)?,
        ];
        (7, Some(pads))
    } else {
        (4, None)
    };
    let stride_w = op.scalar_usize(next)?;
    let stride_h = op.scalar_usize(next + 1)?;
    next += 2;
    let extra = if has_extra {
        next += 1;
        op.scalar_usize(next - 1)?
    } else {
        1
    };
    let activation = op.scalar_i32(next)?;
    let nchw = op.flag(next + 1)?;
    let dilations = if op.input_count() > next + 3 {
        [op.scalar_usize(next + 3)?, op.scalar_usize(next + 2)?]
    } else {
        [1, 1]
    };

    let dims = op.input_dims(0)?;
    if dims.len() != 4 {
        return Err(op.invalid(format!("input rank {} is not 4", dims.len())));
    }
    let (in_h, in_w) = if nchw {
        (dims[2] as usize, dims[3] as usize)
    } else {
        (dims[1] as usize, dims[2] as usize)
    };

    let (pads_begin, pads_end) = match pads {
        // [top, left, bottom, right]
        Some([top, left, bottom, right]) => ([top, left], [bottom, right]),
        None => match op.scalar_i32(3)? {
            PADDING_SAME => {
                let (top, bottom) = calculate_explicit_padding(in_h, stride_h, kernel[0]);
                let (left, right) = calculate_explicit_padding(in_w, stride_w, kernel[1]);
                ([top, left], [bottom, right])
            }
            PADDING_VALID => ([0, 0], [0, 0]),
            other => return Err(op.invalid(format!("unknown padding scheme {other}"))),
        },
    };

    Ok(ConvParams {
        attrs: Conv2dAttrs {
            strides: [stride_h, stride_w],
            dilations,
            pads_begin,
            pads_end,
        },
        extra,
        activation,
        nchw,
    })
}

/// Spatial kernel size of a filter stored as `[_, kh, kw, _]`.
fn filter_kernel(op: &OperationView<'_>) -> Result<[usize; 2], BuildError> {
    let dims = op.input_dims(1)?;
    if dims.len() != 4 {
        return Err(op.invalid(format!("filter rank {} is not 4", dims.len())));
    }
    Ok([dims[1] as usize, dims[2] as usize])
}

/// Implicit forms carry a known scheme code at `slot`.
fn padding_ok(op: &OperationView<'_>, explicit: bool, slot: usize) -> bool {
    explicit || op.scalar_i32(slot).is_ok_and(is_padding_scheme)
}

fn per_channel_dim(op: &OperationView<'_>, n: usize) -> Option<usize> {
    match op.input_operand(n).ok().map(|o| &o.quantization) {
        Some(Quantization::PerChannel { channel_dim, .. }) => Some(*channel_dim),
        _ => None,
    }
}

fn supported_input(ty: Option<OperandType>) -> bool {
    matches!(
        ty,
        Some(
            OperandType::TensorFloat32
                | OperandType::TensorFloat16
                | OperandType::TensorQuant8Asymm
                | OperandType::TensorQuant8AsymmSigned
        )
    )
}

/// Real-valued bias vector.
///
/// Per-channel filters scale the INT32 bias by `input_scale * filter_scale[c]`;
/// other quantized inputs dequantize the bias with its own scale.
fn bias(ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
    let filter = ctx.input_operand(1)?;
    if let Quantization::PerChannel { scales, .. } = &filter.quantization {
        let input_scale = ctx.input_operand(0)?.scale();
        let scales = per_channel_bias_scales(input_scale, scales);
        let raw = ctx.input_raw(2)?;
        let g = ctx.graph();
        let real = g.convert(raw, ElementType::F32)?;
        let scale = g.constant_f32(&[scales.len()], &scales);
        return Ok(g.binary(BinaryOp::Mul, real, scale)?);
    }
    let input_quantized = ctx.input_type(0).is_some_and(|t| t.is_quantized());
    if input_quantized {
        let raw = ctx.input_raw(2)?;
        let id = ctx.input_id(2)?;
        ctx.dequantize(raw, id)
    } else {
        ctx.input(2)
    }
}

/// Shared tail: data in NCHW, add `[1, C, 1, 1]` bias, activation, layout back.
fn finish_conv(
    ctx: &mut TranslateContext<'_>,
    conv: NodeRef,
    params: &ConvParams,
) -> Result<NodeRef, BuildError> {
    let channels = ctx.shape(conv)?[1];
    let b = bias(ctx)?;
    let g = ctx.graph();
    let b = g.reshape(b, &[1, channels, 1, 1])?;
    let sum = g.binary(BinaryOp::Add, conv, b)?;
    let activated = ctx.activation(sum, params.activation)?;
    if params.nchw {
        Ok(activated)
    } else {
        ctx.transpose(activated, LayoutConversion::NchwToNhwc)
    }
}

fn input_nchw(ctx: &mut TranslateContext<'_>, params: &ConvParams) -> Result<NodeRef, BuildError> {
    let x = ctx.input(0)?;
    if params.nchw {
        Ok(x)
    } else {
        ctx.transpose(x, LayoutConversion::NhwcToNchw)
    }
}

struct Conv2d;

impl Conv2d {
    fn explicit(op: &OperationView<'_>) -> bool {
        op.input_count() >= 10 && !op.input_is_bool(7)
    }
}

impl Translator for Conv2d {
    fn kind(&self) -> OperationKind {
        OperationKind::Conv2d
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (7..=13).contains(&op.input_count())
            && supported_input(op.input_type(0))
            && op.input_rank(0) == 4
            && op.input_rank(1) == 4
            && per_channel_dim(op, 1).map_or(true, |d| d == 0)
            && padding_ok(op, Self::explicit(op), 3)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let view = ctx.view();
        let params = parse_conv(&view, Self::explicit(&view), false, filter_kernel(&view)?)?;
        let x = input_nchw(ctx, &params)?;
        let w = ctx.input(1)?;
        let w = ctx.transpose(w, LayoutConversion::OhwiToOihw)?;
        let conv = ctx.graph().convolution(x, w, params.attrs.clone())?;
        finish_conv(ctx, conv, &params)
    }
}

struct DepthwiseConv2d;

impl DepthwiseConv2d {
    fn explicit(op: &OperationView<'_>) -> bool {
        op.input_count() >= 11 && !op.input_is_bool(8)
    }
}

impl Translator for DepthwiseConv2d {
    fn kind(&self) -> OperationKind {
        OperationKind::DepthwiseConv2d
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (8..=14).contains(&op.input_count())
            && supported_input(op.input_type(0))
            && op.input_rank(0) == 4
            && op.input_dims(1).is_ok_and(|d| d.len() == 4 && d[0] == 1)
            && per_channel_dim(op, 1).map_or(true, |d| d == 3)
            && padding_ok(op, Self::explicit(op), 3)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let view = ctx.view();
        let params = parse_conv(&view, Self::explicit(&view), true, filter_kernel(&view)?)?;
        let x = input_nchw(ctx, &params)?;
        let channels = ctx.shape(x)?[1];

        // [1, kh, kw, C*M] -> [C*M, 1, kh, kw] -> [C, M, 1, kh, kw]
        let w = ctx.input(1)?;
        let w = ctx.transpose(w, LayoutConversion::IhwoToOihw)?;
        let ws = ctx.shape(w)?;
        if channels == 0 || ws[0] != channels * params.extra {
            return Err(ctx.invalid(format!(
                "filter depth {} is not {} channels x multiplier {}",
                ws[0], channels, params.extra
            )));
        }
        let g = ctx.graph();
        let w = g.reshape(w, &[channels, ws[0] / channels, 1, ws[2], ws[3]])?;
        let conv = g.group_convolution(x, w, params.attrs.clone())?;
        finish_conv(ctx, conv, &params)
    }
}

struct GroupedConv2d;

impl GroupedConv2d {
    fn explicit(op: &OperationView<'_>) -> bool {
        op.input_count() >= 11 && !op.input_is_bool(8)
    }
}

impl Translator for GroupedConv2d {
    fn kind(&self) -> OperationKind {
        OperationKind::GroupedConv2d
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (9..=12).contains(&op.input_count())
            && supported_input(op.input_type(0))
            && op.input_rank(0) == 4
            && op.input_rank(1) == 4
            && per_channel_dim(op, 1).map_or(true, |d| d == 0)
            && padding_ok(op, Self::explicit(op), 3)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let view = ctx.view();
        let params = parse_conv(&view, Self::explicit(&view), true, filter_kernel(&view)?)?;
        let groups = params.extra;
        let x = input_nchw(ctx, &params)?;

        // [O, kh, kw, I/g] -> [O, I/g, kh, kw] -> [g, O/g, I/g, kh, kw]
        let w = ctx.input(1)?;
        let w = ctx.transpose(w, LayoutConversion::OhwiToOihw)?;
        let ws = ctx.shape(w)?;
        if groups == 0 || ws[0] % groups != 0 {
            return Err(ctx.invalid(format!("{} filters do not split into {groups} groups", ws[0])));
        }
        let g = ctx.graph();
        let w = g.reshape(w, &[groups, ws[0] / groups, ws[1], ws[2], ws[3]])?;
        let conv = g.group_convolution(x, w, params.attrs.clone())?;
        finish_conv(ctx, conv, &params)
    }
}

/// Gradient of a strided convolution, built as a stride-1 convolution over
/// the zero-dilated input with the filter flipped in both spatial axes.
///
/// Explicit (11 inputs): pad left, right, top, bottom, stride w, stride h,
/// activation, layout. Implicit (9 inputs): output shape, scheme, stride w,
/// stride h, activation, layout.
struct TransposeConv2d;

impl TransposeConv2d {
    fn explicit(op: &OperationView<'_>) -> bool {
        op.input_count() == 11
    }

    /// Padding removed from the full transposed output, as (begin, end) per
    /// spatial axis.
    fn output_padding(
        ctx: &TranslateContext<'_>,
        in_hw: [usize; 2],
        kernel: [usize; 2],
        strides: [usize; 2],
        nchw: bool,
    ) -> Result<([usize; 2], [usize; 2]), BuildError> {
        if Self::explicit(&ctx.view()) {
            let (left, right) = (ctx.scalar_usize(3)?, ctx.scalar_usize(4)?);
            let (top, bottom) = (ctx.scalar_usize(5)?, ctx.scalar_usize(6)?);
            return Ok(([top, left], [bottom, right]));
        }
        match ctx.scalar_i32(4)? {
            PADDING_VALID => Ok(([0, 0], [0, 0])),
            PADDING_SAME => {
                let shape = ctx.vector_i32(3)?;
                if shape.len() != 4 {
                    return Err(ctx.invalid(format!("output shape {shape:?} is not rank 4")));
                }
                let out = if nchw { [shape[2], shape[3]] } else { [shape[1], shape[2]] };
                let mut begin = [0; 2];
                let mut end = [0; 2];
                for i in 0..2 {
                    let full = strides[i] * in_hw[i].saturating_sub(1) + kernel[i];
                    let total = full.saturating_sub(usize::try_from(out[i]).unwrap_or(0));
                    begin[i] = total / 2;
                    end[i] = total - total / 2;
                }
                Ok((begin, end))
            }
            other => Err(ctx.invalid(format!("unknown padding scheme {other}"))),
        }
    }
}

impl Translator for TransposeConv2d {
    fn kind(&self) -> OperationKind {
        OperationKind::TransposeConv2d
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        matches!(op.input_count(), 9 | 11)
            && supported_input(op.input_type(0))
            && op.input_rank(0) == 4
            && op.input_rank(1) == 4
            && per_channel_dim(op, 1).map_or(true, |d| d == 0)
            && padding_ok(op, Self::explicit(op), 4)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let view = ctx.view();
        let next = if Self::explicit(&view) { 7 } else { 5 };
        let strides = [ctx.scalar_usize(next + 1)?, ctx.scalar_usize(next)?];
        let activation = ctx.scalar_i32(next + 2)?;
        let nchw = ctx.flag(next + 3)?;
        let kernel = filter_kernel(&view)?;
        if strides.contains(&0) {
            return Err(ctx.invalid("stride must be positive"));
        }

        let x = ctx.input(0)?;
        let x = if nchw { x } else { ctx.transpose(x, LayoutConversion::NhwcToNchw)? };
        let [n, c, h, w] = <[usize; 4]>::try_from(ctx.shape(x)?)
            .map_err(|s| ctx.invalid(format!("input shape {s:?} is not rank 4")))?;
        let (cut_begin, cut_end) = Self::output_padding(ctx, [h, w], kernel, strides, nchw)?;

        // Insert stride - 1 zeros between neighbouring pixels.
        let g = ctx.graph();
        let x = if strides == [1, 1] || h == 0 || w == 0 {
            x
        } else {
            let cells = g.reshape(x, &[n, c, h, 1, w, 1])?;
            let spread = g.pad(cells, &[0; 6], &[0, 0, 0, strides[0] - 1, 0, strides[1] - 1], 0.0)?;
            let flat = g.reshape(spread, &[n, c, h * strides[0], w * strides[1]])?;
            let dilated = [(h - 1) * strides[0] + 1, (w - 1) * strides[1] + 1];
            g.slice(flat, &[0; 4], &[1; 4], &[n, c, dilated[0], dilated[1]])?
        };

        // [O, kh, kw, I] -> [O, I, kh, kw], reversed along kh and kw.
        let filter = ctx.input(1)?;
        let filter = ctx.transpose(filter, LayoutConversion::OhwiToOihw)?;
        let g = ctx.graph();
        let mut filter = filter;
        for (axis, extent) in [(2, kernel[0]), (3, kernel[1])] {
            let reversed: Vec<i32> = (0..extent as i32).rev().collect();
            let indices = g.constant_i32(&[extent], &reversed);
            filter = g.gather(filter, indices, axis)?;
        }

        let mut pads_begin = [0; 2];
        let mut pads_end = [0; 2];
        for i in 0..2 {
            let reach = kernel[i].saturating_sub(1);
            pads_begin[i] = reach
                .checked_sub(cut_begin[i])
                .ok_or_else(|| ctx.invalid(format!("padding {} exceeds filter reach {reach}", cut_begin[i])))?;
            pads_end[i] = reach
                .checked_sub(cut_end[i])
                .ok_or_else(|| ctx.invalid(format!("padding {} exceeds filter reach {reach}", cut_end[i])))?;
        }
        let params = ConvParams {
            attrs: Conv2dAttrs {
                strides: [1, 1],
                dilations: [1, 1],
                pads_begin,
                pads_end,
            },
            extra: 1,
            activation,
            nchw,
        };
        let conv = ctx.graph().convolution(x, filter, params.attrs.clone())?;
        finish_conv(ctx, conv, &params)
    }
}

/// `activation(reshape(x, [batch, in]) x weights^T + bias)`
struct FullyConnected;

impl Translator for FullyConnected {
    fn kind(&self) -> OperationKind {
        OperationKind::FullyConnected
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 4
            && supported_input(op.input_type(0))
            && op.input_rank(0) >= 2
            && op.input_rank(1) == 2
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = ctx.input(0)?;
        let w = ctx.input(1)?;
        let input_size = ctx.shape(w)?[1];
        let total: usize = ctx.shape(x)?.iter().product();
        if input_size == 0 || total % input_size != 0 {
            return Err(ctx.invalid(format!("{total} elements do not form rows of {input_size}")));
        }
        let g = ctx.graph();
        let rows = g.reshape(x, &[total / input_size, input_size])?;
        let product = g.matmul(rows, w, true)?;
        let out = if ctx.is_omitted(2) {
            product
        } else {
            let b = bias(ctx)?;
            ctx.graph().binary(BinaryOp::Add, product, b)?
        };
        ctx.fused_activation(out, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, Operand};

    fn conv_model(args: &[Operand]) -> crate::model::Model {
        let mut b = ModelBuilder::new();
        let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 5, 5, 3]));
        let w = b.operand(Operand::const_f32(&[2, 3, 3, 3], &[0.0; 54]));
        let bias = b.operand(Operand::const_f32(&[2], &[0.0; 2]));
        let mut inputs = vec![x, w, bias];
        inputs.extend(args.iter().cloned().map(|a| b.operand(a)));
        let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 5, 5, 2]));
        b.operation(OperationKind::Conv2d, &inputs, &[out]);
        b.build().unwrap()
    }

    #[test]
    fn test_explicit_padding_order() {
        // left, right, top, bottom, stride w, stride h, activation
        let args: Vec<Operand> = [1, 2, 3, 4, 1, 2, 0].map(Operand::scalar_i32).to_vec();
        let model = conv_model(&args);
        let view = OperationView::new(&model, 0).unwrap();
        assert!(Conv2d::explicit(&view));
        let params = parse_conv(&view, true, false, [3, 3]).unwrap();
        assert_eq!(params.attrs.pads_begin, [3, 1]);
        assert_eq!(params.attrs.pads_end, [4, 2]);
        assert_eq!(params.attrs.strides, [2, 1]);
        assert!(!params.nchw);
    }

    #[test]
    fn test_implicit_same_padding_with_layout_and_dilation() {
        let mut args: Vec<Operand> = [PADDING_SAME, 1, 1, 0].map(Operand::scalar_i32).to_vec();
        args.push(Operand::scalar_bool(false));
        args.extend([2, 3].map(Operand::scalar_i32));
        let model = conv_model(&args);
        let view = OperationView::new(&model, 0).unwrap();
        assert!(!Conv2d::explicit(&view));
        let params = parse_conv(&view, false, false, [3, 3]).unwrap();
        assert_eq!(params.attrs.pads_begin, [1, 1]);
        assert_eq!(params.attrs.pads_end, [1, 1]);
        assert_eq!(params.attrs.dilations, [3, 2]);
        assert!(Conv2d.validate(&view));
    }

    #[test]
    fn test_unknown_padding_scheme_rejected() {
        let args: Vec<Operand> = [7, 1, 1, 0].map(Operand::scalar_i32).to_vec();
        let model = conv_model(&args);
        let view = OperationView::new(&model, 0).unwrap();
        assert!(!Conv2d.validate(&view));
        assert!(matches!(
            parse_conv(&view, false, false, [3, 3]),
            Err(BuildError::InvalidParameter { .. })
        ));

        let args: Vec<Operand> = [PADDING_VALID, 1, 1, 0].map(Operand::scalar_i32).to_vec();
        let model = conv_model(&args);
        let view = OperationView::new(&model, 0).unwrap();
        assert!(Conv2d.validate(&view));
        let params = parse_conv(&view, false, false, [3, 3]).unwrap();
        assert_eq!(params.attrs.pads_begin, [0, 0]);
    }

    #[test]
    fn test_transpose_conv_forms() {
        let build = |scheme: i32| {
            let mut b = ModelBuilder::new();
            let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 2, 2, 1]));
            let w = b.operand(Operand::const_f32(&[1, 3, 3, 1], &[1.0; 9]));
            let bias = b.operand(Operand::const_f32(&[1], &[0.0]));
            let shape = b.operand(Operand::const_i32(&[4], &[1, 5, 5, 1]));
            let mut inputs = vec![x, w, bias, shape];
            for v in [scheme, 2, 2, 0] {
                inputs.push(b.operand(Operand::scalar_i32(v)));
            }
            inputs.push(b.operand(Operand::scalar_bool(false)));
            let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 5, 5, 1]));
            b.operation(OperationKind::TransposeConv2d, &inputs, &[out]);
            b.build().unwrap()
        };

        let model = build(PADDING_VALID);
        let view = OperationView::new(&model, 0).unwrap();
        assert!(!TransposeConv2d::explicit(&view));
        assert!(TransposeConv2d.validate(&view));

        let model = build(5);
        assert!(!TransposeConv2d.validate(&OperationView::new(&model, 0).unwrap()));
    }
}
