//! AVERAGE_POOL_2D, MAX_POOL_2D and L2_POOL_2D.

use crate::backend::{NodeRef, Pool2dAttrs, PoolKind};
use crate::model::{OperandType, OperationKind};

use super::common::{calculate_explicit_padding, is_padding_scheme, LayoutConversion, PADDING_SAME, PADDING_VALID};
use super::{BuildError, OperationView, TranslateContext, Translator, TranslatorRegistry};

pub(super) fn register(registry: &mut TranslatorRegistry) {
    for kind in [
        OperationKind::AveragePool2d,
        OperationKind::MaxPool2d,
        OperationKind::L2Pool2d,
    ] {
        registry.register(kind, pool);
    }
}

fn pool(kind: OperationKind) -> Box<dyn Translator> {
    Box::new(Pool { kind })
}

struct Pool {
    kind: OperationKind,
}

impl Pool {
    fn pool_kind(&self) -> PoolKind {
        match self.kind {
            OperationKind::MaxPool2d => PoolKind::Max,
            OperationKind::L2Pool2d => PoolKind::L2,
            _ => PoolKind::Average,
        }
    }

    /// Explicit: pads at 1..=4, strides 5 and 6, filter 7 and 8, activation 9,
    /// optional layout 10. Implicit: scheme 1, strides 2 and 3, filter 4 and 5,
    /// activation 6, optional layout 7.
    fn parse(&self, op: &OperationView<'_>) -> Result<(Pool2dAttrs, i32, bool), BuildError> {
        let explicit = op.input_count() >= 10;
        let base = if explicit { 5 } else { 2 };
        let stride_w = op.scalar_usize(base)?;
        let stride_h = op.scalar_usize(base + 1)?;
        let kernel_w = op.scalar_usize(base + 2)?;
        let kernel_h = op.scalar_usize(base + 3)?;
        let activation = op.scalar_i32(base + 4)?;
        let nchw = op.flag(base + 5)?;

        let (pads_begin, pads_end) = if explicit {
            let left = op.scalar_usize(1)?;
            let right = op.scalar_usize(2)?;
            let top = op.scalar_usize(3)?;
            let bottom = op.scalar_usize(4)?;
            ([top, left], [bottom, right])
        } else {
            match op.scalar_i32(1)? {
                PADDING_SAME => {
                    let dims = op.input_dims(0)?;
                    let (in_h, in_w) = if nchw {
                        (dims[2] as usize, dims[3] as usize)
                    } else {
                        (dims[1] as usize, dims[2] as usize)
                    };
                    let (top, bottom) = calculate_explicit_padding(in_h, stride_h, kernel_h);
                    let (left, right) = calculate_explicit_padding(in_w, stride_w, kernel_w);
                    ([top, left], [bottom, right])
                }
                PADDING_VALID => ([0, 0], [0, 0]),
                other => return Err(op.invalid(format!("unknown padding scheme {other}"))),
            }
        };

        let attrs = Pool2dAttrs {
            kind: self.pool_kind(),
            kernel: [kernel_h, kernel_w],
            strides: [stride_h, stride_w],
            pads_begin,
            pads_end,
        };
        Ok((attrs, activation, nchw))
    }
}

impl Translator for Pool {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        let count_ok = matches!(op.input_count(), 7 | 8 | 10 | 11);
        let type_ok = match op.input_type(0) {
            Some(OperandType::TensorFloat32 | OperandType::TensorFloat16) => true,
            Some(OperandType::TensorQuant8Asymm | OperandType::TensorQuant8AsymmSigned) => {
                self.kind != OperationKind::L2Pool2d
            }
            _ => false,
        };
        let explicit = op.input_count() >= 10;
        let padding_ok = explicit || op.scalar_i32(1).is_ok_and(is_padding_scheme);
        count_ok && type_ok && padding_ok && op.input_rank(0) == 4
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let (attrs, activation, nchw) = self.parse(&ctx.view())?;
        let mut x = ctx.input(0)?;
        if !nchw {
            x = ctx.transpose(x, LayoutConversion::NhwcToNchw)?;
        }
        let pooled = ctx.graph().pool(x, attrs)?;
        let out = ctx.activation(pooled, activation)?;
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
    fn test_implicit_same_padding() {
        let mut b = ModelBuilder::new();
        let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 4, 4, 1]));
        let mut inputs = vec![x];
        // scheme, stride w, stride h, filter w, filter h, activation
        for v in [PADDING_SAME, 2, 2, 3, 3, 0] {
            inputs.push(b.operand(Operand::scalar_i32(v)));
        }
        let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 2, 2, 1]));
        b.operation(OperationKind::MaxPool2d, &inputs, &[out]);
        let model = b.build().unwrap();

        let view = OperationView::new(&model, 0).unwrap();
        let translator = Pool {
            kind: OperationKind::MaxPool2d,
        };
        assert!(translator.validate(&view));
        let (attrs, activation, nchw) = translator.parse(&view).unwrap();
        assert_eq!(attrs.kind, PoolKind::Max);
        assert_eq!(attrs.kernel, [3, 3]);
        assert_eq!(attrs.pads_begin, [0, 0]);
        assert_eq!(attrs.pads_end, [1, 1]);
        assert_eq!(activation, 0);
        assert!(!nchw);
    }

    #[test]
    fn test_l2_rejects_quantized_input() {
        let mut b = ModelBuilder::new();
        let x = b.input(Operand::quantized(OperandType::TensorQuant8Asymm, &[1, 2, 2, 1], 0.5, 0));
        let mut inputs = vec![x];
        for v in [2, 1, 1, 1, 1, 0] {
            inputs.push(b.operand(Operand::scalar_i32(v)));
        }
        let out = b.output(Operand::quantized(OperandType::TensorQuant8Asymm, &[1, 2, 2, 1], 0.5, 0));
        b.operation(OperationKind::L2Pool2d, &inputs, &[out]);
        let model = b.build().unwrap();
        let view = OperationView::new(&model, 0).unwrap();
        assert!(!Pool { kind: OperationKind::L2Pool2d }.validate(&view));
        assert!(Pool { kind: OperationKind::AveragePool2d }.validate(&view));
    }

    #[test]
    fn test_unknown_padding_scheme_rejected() {
        let mut b = ModelBuilder::new();
        let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 4, 4, 1]));
        let mut inputs = vec![x];
        for v in [0, 2, 2, 2, 2, 0] {
            inputs.push(b.operand(Operand::scalar_i32(v)));
        }
        let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 2, 2, 1]));
        b.operation(OperationKind::MaxPool2d, &inputs, &[out]);
        let model = b.build().unwrap();
        let view = OperationView::new(&model, 0).unwrap();
        let translator = Pool {
            kind: OperationKind::MaxPool2d,
        };
        assert!(!translator.validate(&view));
        assert!(matches!(translator.parse(&view), Err(BuildError::InvalidParameter { .. })));
    }
}
