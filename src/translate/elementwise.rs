//! Elementwise arithmetic, comparison, logical and activation operations.

use crate::backend::{BinaryOp, CompareOp, LogicalOp, NodeRef, UnaryOp};
use crate::model::{OperandType, OperationKind};

use super::{BuildError, OperationView, TranslateContext, Translator, TranslatorRegistry};

pub(super) fn register(registry: &mut TranslatorRegistry) {
    use OperationKind::*;
    for kind in [Add, Sub, Mul, Div, Maximum, Minimum, Pow] {
        registry.register(kind, binary);
    }
    for kind in [Equal, NotEqual, Greater, GreaterEqual, Less, LessEqual] {
        registry.register(kind, compare);
    }
    for kind in [LogicalAnd, LogicalOr, LogicalNot] {
        registry.register(kind, logical);
    }
    for kind in [Abs, Exp, Log, Neg, Sin, Sqrt, Rsqrt, Floor, Relu, Relu1, Relu6, Tanh, Logistic] {
        registry.register(kind, unary);
    }
    registry.register(HardSwish, |_| Box::new(HardSwishOp) as Box<dyn Translator>);
    registry.register(Elu, |_| Box::new(EluOp) as Box<dyn Translator>);
    registry.register(Prelu, |_| Box::new(PreluOp) as Box<dyn Translator>);
    registry.register(Select, |_| Box::new(SelectOp) as Box<dyn Translator>);
    registry.register(Cast, |_| Box::new(CastOp) as Box<dyn Translator>);
}

fn binary(kind: OperationKind) -> Box<dyn Translator> {
    Box::new(Binary { kind })
}

fn compare(kind: OperationKind) -> Box<dyn Translator> {
    Box::new(Compare { kind })
}

fn logical(kind: OperationKind) -> Box<dyn Translator> {
    Box::new(Logical { kind })
}

fn unary(kind: OperationKind) -> Box<dyn Translator> {
    Box::new(Unary { kind })
}

/// Real-valued or integer tensor encodings elementwise kernels accept.
fn is_tensor_value(ty: Option<OperandType>) -> bool {
    ty.is_some_and(|t| {
        !t.is_scalar() && t != OperandType::TensorBool8 && t != OperandType::TensorQuant8SymmPerChannel
    })
}

struct Binary {
    kind: OperationKind,
}

impl Binary {
    fn op(&self) -> BinaryOp {
        match self.kind {
            OperationKind::Sub => BinaryOp::Sub,
            OperationKind::Mul => BinaryOp::Mul,
            OperationKind::Div => BinaryOp::Div,
            OperationKind::Maximum => BinaryOp::Max,
            OperationKind::Minimum => BinaryOp::Min,
            OperationKind::Pow => BinaryOp::Pow,
            _ => BinaryOp::Add,
        }
    }

    /// ADD, SUB, MUL and DIV carry a fused activation at input 2.
    fn has_activation(&self) -> bool {
        matches!(
            self.kind,
            OperationKind::Add | OperationKind::Sub | OperationKind::Mul | OperationKind::Div
        )
    }
}

impl Translator for Binary {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        let arity = if self.has_activation() { 3 } else { 2 };
        op.input_count() == arity
            && is_tensor_value(op.input_type(0))
            && op.input_type(0) == op.input_type(1)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let a = ctx.input(0)?;
        let b = ctx.input(1)?;
        let out = ctx.graph().binary(self.op(), a, b)?;
        if self.has_activation() {
            ctx.fused_activation(out, 2)
        } else {
            Ok(out)
        }
    }
}

struct Compare {
    kind: OperationKind,
}

impl Translator for Compare {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 2 && op.input_type(0) == op.input_type(1)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let op = match self.kind {
            OperationKind::NotEqual => CompareOp::NotEqual,
            OperationKind::Greater => CompareOp::Greater,
            OperationKind::GreaterEqual => CompareOp::GreaterEqual,
            OperationKind::Less => CompareOp::Less,
            OperationKind::LessEqual => CompareOp::LessEqual,
            _ => CompareOp::Equal,
        };
        let a = ctx.input(0)?;
        let b = ctx.input(1)?;
        Ok(ctx.graph().compare(op, a, b)?)
    }
}

struct Logical {
    kind: OperationKind,
}

impl Translator for Logical {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        let arity = if self.kind == OperationKind::LogicalNot { 1 } else { 2 };
        op.input_count() == arity
            && (0..arity).all(|n| op.input_type(n) == Some(OperandType::TensorBool8))
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let a = ctx.input_raw(0)?;
        if self.kind == OperationKind::LogicalNot {
            return Ok(ctx.graph().unary(UnaryOp::Not, a)?);
        }
        let op = if self.kind == OperationKind::LogicalOr {
            LogicalOp::Or
        } else {
            LogicalOp::And
        };
        let b = ctx.input_raw(1)?;
        Ok(ctx.graph().logical(op, a, b)?)
    }
}

struct Unary {
    kind: OperationKind,
}

impl Translator for Unary {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        let ty = op.input_type(0);
        let integral_ok = matches!(self.kind, OperationKind::Abs | OperationKind::Neg)
            && ty == Some(OperandType::TensorInt32);
        is_tensor_value(ty)
            && (integral_ok || ty != Some(OperandType::TensorInt32))
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = ctx.input(0)?;
        let g = ctx.graph();
        let out = match self.kind {
            OperationKind::Relu1 => g.clamp(x, -1.0, 1.0)?,
            OperationKind::Relu6 => g.clamp(x, 0.0, 6.0)?,
            kind => {
                let op = match kind {
                    OperationKind::Abs => UnaryOp::Abs,
                    OperationKind::Exp => UnaryOp::Exp,
                    OperationKind::Log => UnaryOp::Log,
                    OperationKind::Neg => UnaryOp::Neg,
                    OperationKind::Sin => UnaryOp::Sin,
                    OperationKind::Sqrt => UnaryOp::Sqrt,
                    OperationKind::Rsqrt => UnaryOp::Rsqrt,
                    OperationKind::Floor => UnaryOp::Floor,
                    OperationKind::Tanh => UnaryOp::Tanh,
                    OperationKind::Logistic => UnaryOp::Sigmoid,
                    _ => UnaryOp::Relu,
                };
                g.unary(op, x)?
            }
        };
        Ok(out)
    }
}

/// `x * relu6(x + 3) / 6`
struct HardSwishOp;

impl Translator for HardSwishOp {
    fn kind(&self) -> OperationKind {
        OperationKind::HardSwish
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        is_tensor_value(op.input_type(0)) && op.input_type(0) != Some(OperandType::TensorInt32)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = ctx.input(0)?;
        let three = ctx.scalar_like(x, 3.0)?;
        let six = ctx.scalar_like(x, 6.0)?;
        let g = ctx.graph();
        let shifted = g.binary(BinaryOp::Add, x, three)?;
        let gate = g.clamp(shifted, 0.0, 6.0)?;
        let scaled = g.binary(BinaryOp::Mul, x, gate)?;
        Ok(g.binary(BinaryOp::Div, scaled, six)?)
    }
}

/// `max(0, x) + min(0, alpha * (exp(x) - 1))`
struct EluOp;

impl Translator for EluOp {
    fn kind(&self) -> OperationKind {
        OperationKind::Elu
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 2
            && matches!(
                op.input_type(0),
                Some(OperandType::TensorFloat32 | OperandType::TensorFloat16)
            )
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = ctx.input(0)?;
        let alpha = ctx.scalar_f32(1)?;
        let alpha = ctx.scalar_like(x, f64::from(alpha))?;
        let one = ctx.scalar_like(x, 1.0)?;
        let zero = ctx.scalar_like(x, 0.0)?;
        let g = ctx.graph();
        let positive = g.unary(UnaryOp::Relu, x)?;
        let exp = g.unary(UnaryOp::Exp, x)?;
        let expm1 = g.binary(BinaryOp::Sub, exp, one)?;
        let scaled = g.binary(BinaryOp::Mul, expm1, alpha)?;
        let negative = g.binary(BinaryOp::Min, scaled, zero)?;
        Ok(g.binary(BinaryOp::Add, positive, negative)?)
    }
}

/// `max(0, x) + alpha * min(0, x)`, alpha broadcast against x.
struct PreluOp;

impl Translator for PreluOp {
    fn kind(&self) -> OperationKind {
        OperationKind::Prelu
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 2 && is_tensor_value(op.input_type(0))
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = ctx.input(0)?;
        let alpha = ctx.input(1)?;
        let zero = ctx.scalar_like(x, 0.0)?;
        let g = ctx.graph();
        let positive = g.unary(UnaryOp::Relu, x)?;
        let negative = g.binary(BinaryOp::Min, x, zero)?;
        let scaled = g.binary(BinaryOp::Mul, alpha, negative)?;
        Ok(g.binary(BinaryOp::Add, positive, scaled)?)
    }
}

struct SelectOp;

impl Translator for SelectOp {
    fn kind(&self) -> OperationKind {
        OperationKind::Select
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 3
            && op.input_type(0) == Some(OperandType::TensorBool8)
            && op.input_type(1) == op.input_type(2)
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let cond = ctx.input_raw(0)?;
        let a = ctx.input(1)?;
        let b = ctx.input(2)?;
        Ok(ctx.graph().select(cond, a, b)?)
    }
}

/// Value-preserving element type change. Quantized encodings are treated as
/// plain integers, so the output is bound without re-quantization.
struct CastOp;

impl Translator for CastOp {
    fn kind(&self) -> OperationKind {
        OperationKind::Cast
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 1 && is_tensor_value(op.input_type(0)) && is_tensor_value(op.output_type(0))
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = ctx.input_raw(0)?;
        let to = ctx.output_operand(0)?.operand_type.element_type();
        Ok(ctx.graph().convert(x, to)?)
    }

    fn wire(&self, ctx: &mut TranslateContext<'_>) -> Result<(), BuildError> {
        let node = self.build(ctx)?;
        ctx.register_output(0, node)
    }
}
