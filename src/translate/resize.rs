//! RESIZE_BILINEAR and RESIZE_NEAREST_NEIGHBOR.
//!
//! Inputs: data, then either the output width and height as INT32 scalars or
//! width and height scale factors as float scalars, then optional layout,
//! align-corners and half-pixel-centers flags. Each spatial axis is resized
//! separately with gathers whose source indices and weights are fixed when
//! the graph is built.

use crate::backend::{BinaryOp, ElementType, NodeRef};
use crate::model::{OperandType, OperationKind};

use super::{BuildError, OperationView, TranslateContext, Translator, TranslatorRegistry};

pub(super) fn register(registry: &mut TranslatorRegistry) {
    registry.register(OperationKind::ResizeBilinear, |_| {
        Box::new(Resize { nearest: false }) as Box<dyn Translator>
    });
    registry.register(OperationKind::ResizeNearestNeighbor, |_| {
        Box::new(Resize { nearest: true }) as Box<dyn Translator>
    });
}

/// Sampling flags shared by both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sampling {
    align_corners: bool,
    half_pixel: bool,
}

impl Sampling {
    fn ratio(self, input: usize, output: usize) -> f64 {
        if self.align_corners && output > 1 {
            (input - 1) as f64 / (output - 1) as f64
        } else {
            input as f64 / output as f64
        }
    }

    /// Source index of every output position.
    fn nearest(self, input: usize, output: usize) -> Vec<i32> {
        let ratio = self.ratio(input, output);
        let offset = if self.half_pixel { 0.5 } else { 0.0 };
        let last = input.saturating_sub(1) as f64;
        (0..output)
            .map(|o| {
                let src = (o as f64 + offset) * ratio;
                let src = if self.align_corners { src.round() } else { src.floor() };
                src.min(last) as i32
            })
            .collect()
    }

    /// Lower and upper source index and the weight of the upper one.
    fn bilinear(self, input: usize, output: usize) -> (Vec<i32>, Vec<i32>, Vec<f32>) {
        let ratio = self.ratio(input, output);
        let last = input.saturating_sub(1);
        let mut lower = Vec::with_capacity(output);
        let mut upper = Vec::with_capacity(output);
        let mut weight = Vec::with_capacity(output);
        for o in 0..output {
            let src = if self.half_pixel {
                (o as f64 + 0.5) * ratio - 0.5
            } else {
                o as f64 * ratio
            };
            let src = src.max(0.0);
            let lo = (src.floor() as usize).min(last);
            lower.push(lo as i32);
            upper.push((lo + 1).min(last) as i32);
            weight.push((src - lo as f64) as f32);
        }
        (lower, upper, weight)
    }
}

struct Resize {
    nearest: bool,
}

impl Resize {
    /// Output (height, width) from sizes or scale factors.
    fn output_size(ctx: &TranslateContext<'_>, in_h: usize, in_w: usize) -> Result<[usize; 2], BuildError> {
        if ctx.input_type(1) == Some(OperandType::Int32) {
            return Ok([ctx.scalar_usize(2)?, ctx.scalar_usize(1)?]);
        }
        let scale_w = f64::from(ctx.scalar_f32(1)?);
        let scale_h = f64::from(ctx.scalar_f32(2)?);
        if !(scale_w > 0.0 && scale_h > 0.0) {
            return Err(ctx.invalid(format!("scales {scale_w} and {scale_h} must be positive")));
        }
        Ok([(in_h as f64 * scale_h).floor() as usize, (in_w as f64 * scale_w).floor() as usize])
    }

    fn resize_axis(
        &self,
        ctx: &mut TranslateContext<'_>,
        x: NodeRef,
        axis: usize,
        output: usize,
        sampling: Sampling,
    ) -> Result<NodeRef, BuildError> {
        let shape = ctx.shape(x)?;
        let input = shape[axis];
        if input == output {
            return Ok(x);
        }
        if input == 0 {
            return Err(ctx.invalid(format!("axis {axis} is empty")));
        }
        let element_type = ctx.element_type(x)?;
        let g = ctx.graph();
        if self.nearest {
            let indices = g.constant_i32(&[output], &sampling.nearest(input, output));
            return Ok(g.gather(x, indices, axis)?);
        }

        let (lower, upper, weight) = sampling.bilinear(input, output);
        let lower = g.constant_i32(&[output], &lower);
        let upper = g.constant_i32(&[output], &upper);
        let mut weight_shape = vec![1; shape.len()];
        weight_shape[axis] = output;
        let mut weight = g.constant_f32(&weight_shape, &weight);
        if element_type != ElementType::F32 {
            weight = g.convert(weight, element_type)?;
        }
        let a = g.gather(x, lower, axis)?;
        let b = g.gather(x, upper, axis)?;
        let delta = g.binary(BinaryOp::Sub, b, a)?;
        let step = g.binary(BinaryOp::Mul, delta, weight)?;
        Ok(g.binary(BinaryOp::Add, a, step)?)
    }
}

impl Translator for Resize {
    fn kind(&self) -> OperationKind {
        if self.nearest {
            OperationKind::ResizeNearestNeighbor
        } else {
            OperationKind::ResizeBilinear
        }
    }

    fn validate(&self, op: &OperationView<'_>) -> bool {
        let size_types = matches!(
            (op.input_type(1), op.input_type(2)),
            (Some(OperandType::Int32), Some(OperandType::Int32))
                | (Some(OperandType::Float32), Some(OperandType::Float32))
                | (Some(OperandType::Float16), Some(OperandType::Float16))
        );
        let data_ok = matches!(
            op.input_type(0),
            Some(
                OperandType::TensorFloat32
                    | OperandType::TensorFloat16
                    | OperandType::TensorQuant8Asymm
                    | OperandType::TensorQuant8AsymmSigned
            )
        );
        (3..=6).contains(&op.input_count()) && data_ok && size_types && op.input_rank(0) == 4
    }

    fn build(&self, ctx: &mut TranslateContext<'_>) -> Result<NodeRef, BuildError> {
        let nchw = ctx.flag(3)?;
        let sampling = Sampling {
            align_corners: ctx.flag(4)?,
            half_pixel: ctx.flag(5)?,
        };
        if sampling.align_corners && sampling.half_pixel {
            return Err(ctx.invalid("align_corners and half_pixel_centers are exclusive"));
        }
        let x = ctx.input(0)?;
        let (h_axis, w_axis) = if nchw { (2, 3) } else { (1, 2) };
        let shape = ctx.shape(x)?;
        let [out_h, out_w] = Self::output_size(ctx, shape[h_axis], shape[w_axis])?;
        if out_h == 0 || out_w == 0 {
            return Err(ctx.invalid(format!("output size {out_h}x{out_w} is empty")));
        }
        let rows = self.resize_axis(ctx, x, h_axis, out_h, sampling)?;
        self.resize_axis(ctx, rows, w_axis, out_w, sampling)
    }
}
