//! Per-operation views used by translators.

use std::ops::Deref;

use crate::backend::{BinaryOp, ElementType, Graph, NodeRef, UnaryOp};
use crate::compile::NodeTable;
use crate::model::{Model, Operand, OperandType, Operation, OperationKind, Quantization};

use super::common::{
    LayoutConversion, ACTIVATION_NONE, ACTIVATION_RELU, ACTIVATION_RELU1, ACTIVATION_RELU6,
};
use super::error::BuildError;

/// Read-only view of one operation and its operands.
#[derive(Clone, Copy)]
pub struct OperationView<'a> {
    model: &'a Model,
    index: usize,
    op: &'a Operation,
}

impl<'a> OperationView<'a> {
    pub fn new(model: &'a Model, index: usize) -> Result<Self, BuildError> {
        let op = model.operation(index)?;
        Ok(Self { model, index, op })
    }

    pub fn model(&self) -> &'a Model {
        self.model
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> OperationKind {
        self.op.kind
    }

    pub fn input_count(&self) -> usize {
        self.op.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.op.outputs.len()
    }

    pub(crate) fn invalid(&self, detail: impl Into<String>) -> BuildError {
        BuildError::InvalidParameter {
            index: self.index,
            detail: detail.into(),
        }
    }

    pub fn input_id(&self, n: usize) -> Result<u32, BuildError> {
        Ok(self.model.operation_input(self.index, n)?)
    }

    pub fn output_id(&self, n: usize) -> Result<u32, BuildError> {
        Ok(self.model.operation_output(self.index, n)?)
    }

    pub fn input_operand(&self, n: usize) -> Result<&'a Operand, BuildError> {
        Ok(self.model.operand(self.input_id(n)?)?)
    }

    pub fn output_operand(&self, n: usize) -> Result<&'a Operand, BuildError> {
        Ok(self.model.operand(self.output_id(n)?)?)
    }

    /// Element encoding of input `n`, if present.
    pub fn input_type(&self, n: usize) -> Option<OperandType> {
        self.input_operand(n).ok().map(|o| o.operand_type)
    }

    pub fn output_type(&self, n: usize) -> Option<OperandType> {
        self.output_operand(n).ok().map(|o| o.operand_type)
    }

    pub fn input_rank(&self, n: usize) -> usize {
        self.input_operand(n).map(|o| o.dimensions.len()).unwrap_or(0)
    }

    pub fn input_dims(&self, n: usize) -> Result<&'a [u32], BuildError> {
        Ok(&self.input_operand(n)?.dimensions)
    }

    /// True if input `n` is absent or explicitly omitted.
    pub fn is_omitted(&self, n: usize) -> bool {
        match self.input_id(n) {
            Ok(id) => self.model.is_omitted(id),
            Err(_) => true,
        }
    }

    /// True if the operand at slot `n` is a BOOL scalar (a layout flag).
    pub fn input_is_bool(&self, n: usize) -> bool {
        self.input_type(n) == Some(OperandType::Bool)
    }

    pub fn scalar_i32(&self, n: usize) -> Result<i32, BuildError> {
        Ok(self.model.scalar_i32(self.input_id(n)?)?)
    }

    pub fn scalar_f32(&self, n: usize) -> Result<f32, BuildError> {
        Ok(self.model.scalar_f32(self.input_id(n)?)?)
    }

    pub fn scalar_bool(&self, n: usize) -> Result<bool, BuildError> {
        Ok(self.model.scalar_bool(self.input_id(n)?)?)
    }

    /// Optional BOOL flag at slot `n`; false when absent.
    pub fn flag(&self, n: usize) -> Result<bool, BuildError> {
        if n >= self.input_count() || self.is_omitted(n) {
            return Ok(false);
        }
        self.scalar_bool(n)
    }

    pub fn vector_i32(&self, n: usize) -> Result<Vec<i32>, BuildError> {
        Ok(self.model.vector_i32(self.input_id(n)?)?)
    }

    /// A non-negative INT32 scalar at slot `n`.
    pub fn scalar_usize(&self, n: usize) -> Result<usize, BuildError> {
        let v = self.scalar_i32(n)?;
        usize::try_from(v).map_err(|_| self.invalid(format!("input {n} is negative ({v})")))
    }

    /// Non-empty dims with a non-zero element count.
    pub fn is_valid_input_tensor(&self, n: usize) -> bool {
        self.input_operand(n)
            .map(|o| !o.dimensions.is_empty() && o.dimensions.iter().all(|&d| d != 0))
            .unwrap_or(false)
    }
}

/// Mutable translation state for one operation: its view, the graph under
/// construction and the operand-to-node table.
pub struct TranslateContext<'a> {
    view: OperationView<'a>,
    graph: &'a mut Graph,
    nodes: &'a mut NodeTable,
}

impl<'a> Deref for TranslateContext<'a> {
    type Target = OperationView<'a>;

    fn deref(&self) -> &OperationView<'a> {
        &self.view
    }
}

impl<'a> TranslateContext<'a> {
    pub fn new(view: OperationView<'a>, graph: &'a mut Graph, nodes: &'a mut NodeTable) -> Self {
        Self { view, graph, nodes }
    }

    pub fn view(&self) -> OperationView<'a> {
        self.view
    }

    pub fn graph(&mut self) -> &mut Graph {
        &mut *self.graph
    }

    pub fn shape(&self, node: NodeRef) -> Result<Vec<usize>, BuildError> {
        Ok(self.graph.shape(node)?)
    }

    pub fn element_type(&self, node: NodeRef) -> Result<ElementType, BuildError> {
        Ok(self.graph.element_type(node)?)
    }

    /// Node bound to an operand, materializing constants on first use.
    pub fn operand_node(&mut self, id: u32) -> Result<NodeRef, BuildError> {
        if let Some(node) = self.nodes.get(id) {
            return Ok(node);
        }
        let model = self.view.model();
        let operand = model.operand(id)?;
        if !operand.is_constant() {
            return Err(BuildError::MissingNode {
                index: self.view.index(),
                operand: id,
            });
        }
        let bytes = model.constant_bytes(id)?.to_vec();
        let shape: Vec<usize> = operand.dimensions.iter().map(|&d| d as usize).collect();
        let element_type = operand.operand_type.element_type();
        let tensor = crate::backend::HostTensor::from_bytes(element_type, &shape, bytes)
            .ok_or_else(|| self.view.invalid(format!("constant operand {id} has the wrong byte length")))?;
        let node = self.graph.constant(&tensor);
        self.nodes.set(id, node);
        Ok(node)
    }

    /// Input `n` in real-valued form: quantized encodings are dequantized to f32.
    pub fn input(&mut self, n: usize) -> Result<NodeRef, BuildError> {
        let id = self.view.input_id(n)?;
        let node = self.operand_node(id)?;
        if self.view.model().operand_type(id)?.is_quantized() {
            self.dequantize(node, id)
        } else {
            Ok(node)
        }
    }

    /// Input `n` in its stored encoding.
    pub fn input_raw(&mut self, n: usize) -> Result<NodeRef, BuildError> {
        let id = self.view.input_id(n)?;
        self.operand_node(id)
    }

    /// Real value of a node stored in operand `id`'s quantized encoding.
    ///
    /// Asymmetric encodings subtract the zero point before scaling; per-channel
    /// encodings scale along the channel axis.
    pub fn dequantize(&mut self, node: NodeRef, id: u32) -> Result<NodeRef, BuildError> {
        let operand = self.view.model().operand(id)?;
        let x = self.graph.convert(node, ElementType::F32)?;
        match &operand.quantization {
            Quantization::PerChannel {
                scales,
                channel_dim,
            } => {
                let rank = self.graph.shape(x)?.len();
                if *channel_dim >= rank {
                    return Err(self.view.invalid(format!("channel axis {channel_dim} exceeds rank {rank}")));
                }
                let mut shape = vec![1; rank];
                shape[*channel_dim] = scales.len();
                let scale = self.graph.constant_f32(&shape, scales);
                Ok(self.graph.binary(BinaryOp::Mul, x, scale)?)
            }
            Quantization::Scalar { scale, zero_point } => {
                let shifted = if operand.operand_type.is_asymmetric() {
                    let zp = self.graph.scalar(ElementType::F32, f64::from(*zero_point));
                    self.graph.binary(BinaryOp::Sub, x, zp)?
                } else {
                    x
                };
                let s = self.graph.scalar(ElementType::F32, f64::from(*scale));
                Ok(self.graph.binary(BinaryOp::Mul, shifted, s)?)
            }
            Quantization::None => Ok(x),
        }
    }

    /// Encode a real-valued node into operand `id`'s quantized encoding:
    /// `clamp(round_half_to_even(x / scale) + zero_point, min, max)`.
    pub fn quantize(&mut self, node: NodeRef, id: u32) -> Result<NodeRef, BuildError> {
        let operand = self.view.model().operand(id)?;
        let ty = operand.operand_type;
        let Some((min, max)) = ty.quant_range() else {
            return Ok(node);
        };
        let x = self.graph.convert(node, ElementType::F32)?;
        let scale = self.graph.scalar(ElementType::F32, f64::from(operand.scale()));
        let divided = self.graph.binary(BinaryOp::Div, x, scale)?;
        let rounded = self.graph.round_half_to_even(divided)?;
        let integral = self.graph.convert(rounded, ElementType::I32)?;
        let zp = self.graph.scalar(ElementType::I32, f64::from(operand.zero_point()));
        let shifted = self.graph.binary(BinaryOp::Add, integral, zp)?;
        let clamped = self.graph.clamp(shifted, f64::from(min), f64::from(max))?;
        Ok(self.graph.convert(clamped, ty.element_type())?)
    }

    pub fn transpose(&mut self, node: NodeRef, conversion: LayoutConversion) -> Result<NodeRef, BuildError> {
        Ok(self.graph.transpose(node, &conversion.order())?)
    }

    /// Apply a fused activation code.
    pub fn activation(&mut self, node: NodeRef, code: i32) -> Result<NodeRef, BuildError> {
        Ok(match code {
            ACTIVATION_NONE => node,
            ACTIVATION_RELU => self.graph.unary(UnaryOp::Relu, node)?,
            ACTIVATION_RELU1 => self.graph.clamp(node, -1.0, 1.0)?,
            ACTIVATION_RELU6 => self.graph.clamp(node, 0.0, 6.0)?,
            other => return Err(self.view.invalid(format!("unknown activation code {other}"))),
        })
    }

    /// Activation code at input slot `n`.
    pub fn fused_activation(&mut self, node: NodeRef, n: usize) -> Result<NodeRef, BuildError> {
        let code = self.view.scalar_i32(n)?;
        self.activation(node, code)
    }

    /// Rank-0 constant with `like`'s element type.
    pub fn scalar_like(&mut self, like: NodeRef, value: f64) -> Result<NodeRef, BuildError> {
        let ty = self.graph.element_type(like)?;
        Ok(self.graph.scalar(ty, value))
    }

    /// Bind output `n` to `node` without re-encoding.
    pub fn register_output(&mut self, n: usize, node: NodeRef) -> Result<(), BuildError> {
        let id = self.view.output_id(n)?;
        self.check_shape(id, node)?;
        self.nodes.set(id, node);
        Ok(())
    }

    /// Bind output `n`, quantizing into its encoding when it is a quantized type
    /// and converting to its element type otherwise.
    pub fn finish(&mut self, n: usize, node: NodeRef) -> Result<(), BuildError> {
        let id = self.view.output_id(n)?;
        let ty = self.view.model().operand_type(id)?;
        let node = if ty.is_quantized() {
            self.quantize(node, id)?
        } else {
            self.graph.convert(node, ty.element_type())?
        };
        self.register_output(n, node)
    }

    fn check_shape(&self, id: u32, node: NodeRef) -> Result<(), BuildError> {
        let declared = &self.view.model().operand(id)?.dimensions;
        if declared.is_empty() || declared.contains(&0) {
            return Ok(());
        }
        let built = self.graph.shape(node)?;
        let matches = built.len() == declared.len()
            && built.iter().zip(declared).all(|(b, d)| *b == *d as usize);
        if matches {
            Ok(())
        } else {
            Err(BuildError::ShapeMismatch {
                index: self.view.index(),
                operand: id,
                built,
                declared: declared.clone(),
            })
        }
    }
}
