//! QUANTIZE and DEQUANTIZE.

use crate::backend::{ElementType, NodeRef};
use crate::model::{OperandType, OperationKind};

use super::{BuildError, OperationView, TranslateContext, Translator, TranslatorRegistry};

pub(super) fn register(registry: &mut TranslatorRegistry) {
    registry.register(OperationKind::Quantize, |_| Box::new(Quantize) as Box<dyn Translator>);
    registry.register(OperationKind::Dequantize, |_| Box::new(Dequantize) as Box<dyn Translator>);
}

/// Real input, quantized output. Encoding happens when the output is bound.
struct Quantize;

impl Translator for Quantize {
    fn kind(&self) -> OperationKind {
        OperationKind::Quantize
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 1
            && matches!(
                op.input_type(0),
                Some(OperandType::TensorFloat32 | OperandType::TensorFloat16)
            )
            && matches!(
                op.output_type(0),
                Some(OperandType::TensorQuant8Asymm | OperandType::TensorQuant8AsymmSigned)
            )
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let x = ctx.input(0)?;
        Ok(ctx.graph().convert(x, ElementType::F32)?)
    }
}

/// Quantized input, FP32 or FP16 output.
struct Dequantize;

impl Translator for Dequantize {
    fn kind(&self) -> OperationKind {
        OperationKind::Dequantize
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        op.input_count() == 1
            && op.input_type(0).is_some_and(|t| t.is_quantized())
            && matches!(
                op.output_type(0),
                Some(OperandType::TensorFloat32 | OperandType::TensorFloat16)
            )
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let raw = ctx.input_raw(0)?;
        let id = ctx.input_id(0)?;
        let real = ctx.dequantize(raw, id)?;
        if ctx.output_type(0) == Some(OperandType::TensorFloat16) {
            Ok(ctx.graph().convert(real, ElementType::F16)?)
        } else {
            Ok(real)
        }
    }

    fn wire(&self, ctx: &mut TranslateContext<'_>) -> Result<(), BuildError> {
        let node = self.build(ctx)?;
        ctx.register_output(0, node)
    }
}
