//! SOFTMAX, LOG_SOFTMAX, L2_NORMALIZATION, LOCAL_RESPONSE_NORMALIZATION and
//! INSTANCE_NORMALIZATION.

use crate::backend::{BinaryOp, NodeRef, ReduceOp, UnaryOp};
use crate::model::{OperandType, OperationKind};

use super::common::{normalize_axis, LayoutConversion};
use super::{BuildError, OperationView, TranslateContext, Translator, TranslatorRegistry};

const L2_EPSILON: f64 = 1e-6;

pub(super) fn register(registry: &mut TranslatorRegistry) {
    registry.register(OperationKind::Softmax, |_| Box::new(Softmax) as Box<dyn Translator>);
    registry.register(OperationKind::LogSoftmax, |_| Box::new(LogSoftmax) as Box<dyn Translator>);
    registry.register(OperationKind::L2Normalization, |_| {
        Box::new(L2Normalization) as Box<dyn Translator>
    });
    registry.register(OperationKind::LocalResponseNormalization, |_| {
        Box::new(LocalResponseNormalization) as Box<dyn Translator>
    });
    registry.register(OperationKind::InstanceNormalization, |_| {
        Box::new(InstanceNormalization) as Box<dyn Translator>
    });
}

fn is_float_tensor(ty: Option<OperandType>) -> bool {
    matches!(ty, Some(OperandType::TensorFloat32 | OperandType::TensorFloat16))
}

fn is_float_or_quant8(ty: Option<OperandType>) -> bool {
    is_float_tensor(ty)
        || matches!(
            ty,
            Some(OperandType::TensorQuant8Asymm | OperandType::TensorQuant8AsymmSigned)
        )
}

/// Axis at slot `n`, defaulting to the last dimension when absent.
fn axis_at(ctx: &TranslateContext<'_>, node: NodeRef, n: usize) -> Result<usize, BuildError> {
    let rank = ctx.shape(node)?.len();
    let axis = if n < ctx.input_count() && !ctx.is_omitted(n) {
        ctx.scalar_i32(n)?
    } else {
        -1
    };
    normalize_axis(axis, rank).ok_or_else(|| ctx.invalid(format!("axis {axis} out of range for rank {rank}")))
}

/// `softmax(x * beta)` along the axis at slot 2.
fn scaled_softmax(ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
    let x = ctx.input(0)?;
    let beta = ctx.scalar_f32(1)?;
    let axis = axis_at(ctx, x, 2)?;
    let beta = ctx.scalar_like(x, f64::from(beta))?;
    let g = ctx.graph();
    let scaled = g.binary(BinaryOp::Mul, x, beta)?;
    Ok(g.softmax(scaled, axis)?)
}

struct Softmax;

impl Translator for Softmax {
    fn kind(&self) -> OperationKind {
        OperationKind::Softmax
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (2..=3).contains(&op.input_count()) && is_float_or_quant8(op.input_type(0))
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        scaled_softmax(ctx)
    }
}

struct LogSoftmax;

impl Translator for LogSoftmax {
    fn kind(&self) -> OperationKind {
        OperationKind::LogSoftmax
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 3 && is_float_tensor(op.input_type(0))
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let soft = scaled_softmax(ctx)?;
        Ok(ctx.graph().unary(UnaryOp::Log, soft)?)
    }
}

/// `x / max(sqrt(sum(x^2)), eps)` along one axis.
struct L2Normalization;

impl Translator for L2Normalization {
    fn kind(&self) -> OperationKind {
        OperationKind::L2Normalization
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (1..=2).contains(&op.input_count()) && is_float_or_quant8(op.input_type(0))
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = ctx.input(0)?;
        let axis = axis_at(ctx, x, 1)?;
        let eps = ctx.scalar_like(x, L2_EPSILON)?;
        let g = ctx.graph();
        let squared = g.binary(BinaryOp::Mul, x, x)?;
        let sum = g.reduce(ReduceOp::Sum, squared, &[axis], true)?;
        let norm = g.unary(UnaryOp::Sqrt, sum)?;
        let norm = g.binary(BinaryOp::Max, norm, eps)?;
        Ok(g.binary(BinaryOp::Div, x, norm)?)
    }
}

/// `x / (bias + alpha * sum(x^2))^beta`, the sum running over `radius`
/// neighbours on each side along one axis.
///
/// Inputs: data, radius, bias, alpha, beta, optional axis (last by default).
struct LocalResponseNormalization;

impl Translator for LocalResponseNormalization {
    fn kind(&self) -> OperationKind {
        OperationKind::LocalResponseNormalization
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        (5..=6).contains(&op.input_count()) && is_float_tensor(op.input_type(0)) && op.input_rank(0) <= 4
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = ctx.input(0)?;
        let radius = ctx.scalar_usize(1)?;
        let bias = f64::from(ctx.scalar_f32(2)?);
        let alpha = f64::from(ctx.scalar_f32(3)?);
        let beta = f64::from(ctx.scalar_f32(4)?);
        let axis = axis_at(ctx, x, 5)?;
        let shape = ctx.shape(x)?;
        let rank = shape.len();

        let bias = ctx.scalar_like(x, bias)?;
        let alpha = ctx.scalar_like(x, alpha)?;
        let beta = ctx.scalar_like(x, beta)?;
        let g = ctx.graph();
        let squared = g.binary(BinaryOp::Mul, x, x)?;
        let mut begin = vec![0; rank];
        begin[axis] = radius;
        let padded = g.pad(squared, &begin, &begin, 0.0)?;

        let steps = vec![1; rank];
        let mut sum = None;
        for offset in 0..=2 * radius {
            let mut starts = vec![0i64; rank];
            starts[axis] = offset as i64;
            let window = g.slice(padded, &starts, &steps, &shape)?;
            sum = Some(match sum {
                Some(acc) => g.binary(BinaryOp::Add, acc, window)?,
                None => window,
            });
        }
        let sum = sum.unwrap_or(squared);
        let scaled = g.binary(BinaryOp::Mul, sum, alpha)?;
        let base = g.binary(BinaryOp::Add, scaled, bias)?;
        let denom = g.binary(BinaryOp::Pow, base, beta)?;
        Ok(g.binary(BinaryOp::Div, x, denom)?)
    }
}

/// `mvn(x) * gamma + beta` over the spatial axes of each channel.
struct InstanceNormalization;

impl Translator for InstanceNormalization {
    fn kind(&self) -> OperationKind {
        OperationKind::InstanceNormalization
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 5
            && op.input_type(0) == Some(OperandType::TensorFloat32)
            && op.output_type(0) == Some(OperandType::TensorFloat32)
            && op.input_rank(0) <= 4
            && op.is_valid_input_tensor(0)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let gamma = f64::from(ctx.scalar_f32(1)?);
        let beta = f64::from(ctx.scalar_f32(2)?);
        let epsilon = f64::from(ctx.scalar_f32(3)?);
        let nchw = ctx.flag(4)?;

        let mut x = ctx.input(0)?;
        if ctx.shape(x)?.len() != 4 {
            return Err(ctx.invalid("instance normalization needs a rank-4 input"));
        }
        if !nchw {
            x = ctx.transpose(x, LayoutConversion::NhwcToNchw)?;
        }
        let gamma = ctx.scalar_like(x, gamma)?;
        let beta = ctx.scalar_like(x, beta)?;
        let g = ctx.graph();
        let normalized = g.mvn(x, &[2, 3], epsilon)?;
        let scaled = g.binary(BinaryOp::Mul, normalized, gamma)?;
        let out = g.binary(BinaryOp::Add, scaled, beta)?;
        if nchw {
            Ok(out)
        } else {
            ctx.transpose(out, LayoutConversion::NchwToNhwc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, Operand};

    #[test]
    fn test_instance_norm_requires_fp32() {
        let mut b = ModelBuilder::new();
        let x = b.input(Operand::tensor(OperandType::TensorFloat16, &[1, 2, 2, 1]));
        let mut inputs = vec![x];
        for v in [1.0, 0.0, 1e-5] {
            inputs.push(b.operand(Operand::scalar_f32(v)));
        }
        inputs.push(b.operand(Operand::scalar_bool(false)));
        let out = b.output(Operand::tensor(OperandType::TensorFloat16, &[1, 2, 2, 1]));
        b.operation(OperationKind::InstanceNormalization, &inputs, &[out]);
        let model = b.build().unwrap();
        let view = OperationView::new(&model, 0).unwrap();
        assert!(!InstanceNormalization.validate(&view));
    }

    #[test]
    fn test_softmax_axis_is_optional() {
        let mut b = ModelBuilder::new();
        let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[2, 3]));
        let beta = b.operand(Operand::scalar_f32(1.0));
        let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[2, 3]));
        b.operation(OperationKind::Softmax, &[x, beta], &[out]);
        let model = b.build().unwrap();
        let view = OperationView::new(&model, 0).unwrap();
        assert!(Softmax.validate(&view));
        assert!(!LogSoftmax.validate(&view));
    }

    #[test]
    fn test_lrn_axis_is_optional() {
        let mut b = ModelBuilder::new();
        let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 1, 1, 4]));
        let radius = b.operand(Operand::scalar_i32(1));
        let mut inputs = vec![x, radius];
        for v in [1.0, 1.0, 0.5] {
            inputs.push(b.operand(Operand::scalar_f32(v)));
        }
        let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 1, 1, 4]));
        b.operation(OperationKind::LocalResponseNormalization, &inputs, &[out]);
        let model = b.build().unwrap();
        let view = OperationView::new(&model, 0).unwrap();
        assert!(LocalResponseNormalization.validate(&view));
    }
}
