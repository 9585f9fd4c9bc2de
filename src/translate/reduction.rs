//! MEAN, REDUCE_*, ARGMAX/ARGMIN and TOPK_V2.

use crate::backend::{NodeRef, ReduceOp};
use crate::model::{OperandType, OperationKind};

use super::common::normalize_axis;
use super::{BuildError, OperationView, TranslateContext, Translator, TranslatorRegistry};

pub(super) fn register(registry: &mut TranslatorRegistry) {
    use OperationKind::*;
    for kind in [Mean, ReduceSum, ReduceMax, ReduceMin, ReduceProd, ReduceAny, ReduceAll] {
        registry.register(kind, reduce);
    }
    for kind in [ArgMax, ArgMin] {
        registry.register(kind, arg_reduce);
    }
    registry.register(TopkV2, |_| Box::new(TopK) as Box<dyn Translator>);
}

fn reduce(kind: OperationKind) -> Box<dyn Translator> {
    Box::new(Reduce { kind })
}

fn arg_reduce(kind: OperationKind) -> Box<dyn Translator> {
    Box::new(ArgReduce { kind })
}

/// Resolve an axes vector against `rank`; negative entries count from the end.
fn resolve_axes(op: &OperationView<'_>, raw: &[i32], rank: usize) -> Result<Vec<usize>, BuildError> {
    if raw.is_empty() {
        return Err(op.invalid("empty reduction axes"));
    }
    let mut axes = raw
        .iter()
        .map(|&a| normalize_axis(a, rank).ok_or_else(|| op.invalid(format!("axis {a} out of range for rank {rank}"))))
        .collect::<Result<Vec<_>, _>>()?;
    axes.sort_unstable();
    axes.dedup();
    Ok(axes)
}

struct Reduce {
    kind: OperationKind,
}

impl Reduce {
    fn op(&self) -> ReduceOp {
        match self.kind {
            OperationKind::ReduceSum => ReduceOp::Sum,
            OperationKind::ReduceMax => ReduceOp::Max,
            OperationKind::ReduceMin => ReduceOp::Min,
            OperationKind::ReduceProd => ReduceOp::Prod,
            OperationKind::ReduceAny => ReduceOp::Any,
            OperationKind::ReduceAll => ReduceOp::All,
            _ => ReduceOp::Mean,
        }
    }

    fn is_logical(&self) -> bool {
        matches!(self.kind, OperationKind::ReduceAny | OperationKind::ReduceAll)
    }
}

impl Translator for Reduce {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        let ty = op.input_type(0);
        let type_ok = if self.is_logical() {
            ty == Some(OperandType::TensorBool8)
        } else {
            ty.is_some_and(|t| !t.is_scalar() && t != OperandType::TensorBool8)
        };
        op.input_count() == 3 && type_ok && op.input_type(1) == Some(OperandType::TensorInt32)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = if self.is_logical() {
            ctx.input_raw(0)?
        } else {
            ctx.input(0)?
        };
        let rank = ctx.shape(x)?.len();
        let axes = resolve_axes(&ctx.view(), &ctx.vector_i32(1)?, rank)?;
        // MEAN encodes keep_dims as INT32, the REDUCE_* family as BOOL.
        let keep_dims = if self.kind == OperationKind::Mean {
            ctx.scalar_i32(2)? != 0
        } else {
            ctx.scalar_bool(2)?
        };
        Ok(ctx.graph().reduce(self.op(), x, &axes, keep_dims)?)
    }
}

/// Index of the first extreme element along an axis. Output is INT32.
struct ArgReduce {
    kind: OperationKind,
}

impl Translator for ArgReduce {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 2
            && op.input_type(0).is_some_and(|t| !t.is_scalar() && t != OperandType::TensorBool8)
            && op.output_type(0) == Some(OperandType::TensorInt32)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = ctx.input(0)?;
        let rank = ctx.shape(x)?.len();
        let axis = ctx.scalar_i32(1)?;
        let axis = normalize_axis(axis, rank)
            .ok_or_else(|| ctx.invalid(format!("axis {axis} out of range for rank {rank}")))?;
        let max = self.kind == OperationKind::ArgMax;
        Ok(ctx.graph().arg_reduce(x, axis, max)?)
    }
}

/// `k` largest entries along the last axis. Output 0 holds the values,
/// output 1 their INT32 indices.
struct TopK;

impl TopK {
    /// Values keep the input's stored encoding; ordering survives quantization.
    fn raw(op: &OperationView<'_>) -> bool {
        match (op.input_operand(0), op.output_operand(0)) {
            (Ok(i), Ok(o)) => i.operand_type == o.operand_type && i.quantization == o.quantization,
            _ => false,
        }
    }

    fn outputs(ctx: &mut TranslateContext<'_>) -> Result<(NodeRef, NodeRef), BuildError> {
        let x = if Self::raw(&ctx.view()) { ctx.input_raw(0)? } else { ctx.input(0)? };
        let k = ctx.scalar_usize(1)?;
        Ok(ctx.graph().top_k(x, k)?)
    }
}

impl Translator for TopK {
    fn kind(&self) -> OperationKind {
        OperationKind::TopkV2
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 2
            && op.output_count() == 2
            && op.input_type(0).is_some_and(|t| !t.is_scalar() && t != OperandType::TensorBool8)
            && op.input_type(1) == Some(OperandType::Int32)
            && op.output_type(1) == Some(OperandType::TensorInt32)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        Ok(Self::outputs(ctx)?.0)
    }

    fn wire(&self, ctx: &mut TranslateContext<'_>) -> Result<(), BuildError> {
        let (values, indices) = Self::outputs(ctx)?;
        if Self::raw(&ctx.view()) {
            ctx.register_output(0, values)?;
        } else {
            ctx.finish(0, values)?;
        }
        ctx.register_output(1, indices)
    }
}
