//! The operand store: an immutable, validated model graph.

use half::f16;
use thiserror::Error;

use super::operand::{Lifetime, Operand, OperandType, OperandValue, Quantization};
use super::operation::{Operation, OperationKind};

/// Errors raised while validating or reading a model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Operand {operand} out of range ({count} operands)")]
    OperandOutOfRange { operand: u32, count: usize },

    #[error("Operation {index} out of range")]
    OperationOutOfRange { index: usize },

    #[error("Operand {operand} produced by operations {first} and {second}")]
    MultipleProducers {
        operand: u32,
        first: usize,
        second: usize,
    },

    #[error("Operand {operand} has invalid quantization: {reason}")]
    InvalidQuantization { operand: u32, reason: String },

    #[error("Operand {operand} listed more than once as model input/output")]
    DuplicateBinding { operand: u32 },

    #[error("Operand {operand} is not a constant")]
    NotConstant { operand: u32 },

    #[error("Operand {operand} constant range is out of bounds")]
    ConstantOutOfBounds { operand: u32 },

    #[error("Operand {operand} has type {actual:?}, expected {expected}")]
    TypeMismatch {
        operand: u32,
        expected: &'static str,
        actual: OperandType,
    },

    #[error("Operation {operation} has no input {position}")]
    MissingOperationInput { operation: usize, position: usize },

    #[error("Operation {operation} has no output {position}")]
    MissingOperationOutput { operation: usize, position: usize },
}

/// A validated model: operand table, operations in declaration order,
/// model input/output operand ids and constant pools.
#[derive(Debug, Clone)]
pub struct Model {
    operands: Vec<Operand>,
    operations: Vec<Operation>,
    inputs: Vec<u32>,
    outputs: Vec<u32>,
    pools: Vec<Vec<u8>>,
}

impl Model {
    /// Validate and freeze a model.
    pub fn new(
        operands: Vec<Operand>,
        operations: Vec<Operation>,
        inputs: Vec<u32>,
        outputs: Vec<u32>,
        pools: Vec<Vec<u8>>,
    ) -> Result<Self, ModelError> {
        let model = Self {
            operands,
            operations,
            inputs,
            outputs,
            pools,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ModelError> {
        let count = self.operands.len();
        let check = |operand: u32| {
            if (operand as usize) < count {
                Ok(())
            } else {
                Err(ModelError::OperandOutOfRange { operand, count })
            }
        };

        let mut producer: Vec<Option<usize>> = vec![None; count];
        for (index, op) in self.operations.iter().enumerate() {
            for &id in &op.inputs {
                check(id)?;
            }
            for &id in &op.outputs {
                check(id)?;
                if let Some(first) = producer[id as usize] {
                    return Err(ModelError::MultipleProducers {
                        operand: id,
                        first,
                        second: index,
                    });
                }
                producer[id as usize] = Some(index);
            }
        }

        let mut seen = vec![false; count];
        for &id in self.inputs.iter().chain(self.outputs.iter()) {
            check(id)?;
            if std::mem::replace(&mut seen[id as usize], true) {
                return Err(ModelError::DuplicateBinding { operand: id });
            }
        }

        for (id, operand) in self.operands.iter().enumerate() {
            validate_quantization(id as u32, operand)?;
            if let Some(OperandValue::Pool(loc)) = &operand.value {
                let end = loc.offset as usize + loc.length as usize;
                let fits = self
                    .pools
                    .get(loc.pool_index as usize)
                    .is_some_and(|pool| end <= pool.len());
                if !fits {
                    return Err(ModelError::ConstantOutOfBounds { operand: id as u32 });
                }
            }
        }
        Ok(())
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operand(&self, id: u32) -> Result<&Operand, ModelError> {
        self.operands
            .get(id as usize)
            .ok_or(ModelError::OperandOutOfRange {
                operand: id,
                count: self.operands.len(),
            })
    }

    pub fn operand_type(&self, id: u32) -> Result<OperandType, ModelError> {
        Ok(self.operand(id)?.operand_type)
    }

    pub fn dimensions(&self, id: u32) -> Result<&[u32], ModelError> {
        Ok(&self.operand(id)?.dimensions)
    }

    pub fn scale(&self, id: u32) -> Result<f32, ModelError> {
        Ok(self.operand(id)?.scale())
    }

    pub fn zero_point(&self, id: u32) -> Result<i32, ModelError> {
        Ok(self.operand(id)?.zero_point())
    }

    pub fn byte_size(&self, id: u32) -> Result<Option<usize>, ModelError> {
        Ok(self.operand(id)?.byte_size())
    }

    pub fn operation(&self, index: usize) -> Result<&Operation, ModelError> {
        self.operations
            .get(index)
            .ok_or(ModelError::OperationOutOfRange { index })
    }

    pub fn operation_kind(&self, index: usize) -> Result<OperationKind, ModelError> {
        Ok(self.operation(index)?.kind)
    }

    /// Operand id feeding input `position` of operation `index`.
    pub fn operation_input(&self, index: usize, position: usize) -> Result<u32, ModelError> {
        self.operation(index)?
            .inputs
            .get(position)
            .copied()
            .ok_or(ModelError::MissingOperationInput {
                operation: index,
                position,
            })
    }

    /// Operand id produced at output `position` of operation `index`.
    pub fn operation_output(&self, index: usize, position: usize) -> Result<u32, ModelError> {
        self.operation(index)?
            .outputs
            .get(position)
            .copied()
            .ok_or(ModelError::MissingOperationOutput {
                operation: index,
                position,
            })
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Operand id of model input `i`.
    pub fn model_input(&self, i: usize) -> Option<u32> {
        self.inputs.get(i).copied()
    }

    /// Operand id of model output `i`.
    pub fn model_output(&self, i: usize) -> Option<u32> {
        self.outputs.get(i).copied()
    }

    pub fn inputs(&self) -> &[u32] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[u32] {
        &self.outputs
    }

    /// Raw bytes of a constant operand.
    pub fn constant_bytes(&self, id: u32) -> Result<&[u8], ModelError> {
        let operand = self.operand(id)?;
        match &operand.value {
            Some(OperandValue::Inline(bytes)) => Ok(bytes),
            Some(OperandValue::Pool(loc)) => {
                let start = loc.offset as usize;
                let end = start + loc.length as usize;
                self.pools
                    .get(loc.pool_index as usize)
                    .and_then(|pool| pool.get(start..end))
                    .ok_or(ModelError::ConstantOutOfBounds { operand: id })
            }
            None => Err(ModelError::NotConstant { operand: id }),
        }
    }

    /// True if the operand was omitted by the model author.
    pub fn is_omitted(&self, id: u32) -> bool {
        self.operand(id)
            .map(|op| op.lifetime == Lifetime::NoValue)
            .unwrap_or(true)
    }

    pub fn scalar_i32(&self, id: u32) -> Result<i32, ModelError> {
        self.expect_type(id, &[OperandType::Int32, OperandType::Uint32], "INT32")?;
        let bytes = self.first_bytes::<4>(id)?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Float scalar; FLOAT16 scalars are widened.
    pub fn scalar_f32(&self, id: u32) -> Result<f32, ModelError> {
        match self.operand_type(id)? {
            OperandType::Float16 => {
                let bytes = self.first_bytes::<2>(id)?;
                Ok(f16::from_le_bytes(bytes).to_f32())
            }
            _ => {
                self.expect_type(id, &[OperandType::Float32], "FLOAT32")?;
                Ok(f32::from_le_bytes(self.first_bytes::<4>(id)?))
            }
        }
    }

    pub fn scalar_bool(&self, id: u32) -> Result<bool, ModelError> {
        self.expect_type(id, &[OperandType::Bool], "BOOL")?;
        Ok(self.first_bytes::<1>(id)?[0] != 0)
    }

    pub fn vector_i32(&self, id: u32) -> Result<Vec<i32>, ModelError> {
        self.expect_type(id, &[OperandType::TensorInt32], "TENSOR_INT32")?;
        Ok(self
            .constant_bytes(id)?
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn vector_f32(&self, id: u32) -> Result<Vec<f32>, ModelError> {
        match self.operand_type(id)? {
            OperandType::TensorFloat16 => Ok(self
                .constant_bytes(id)?
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect()),
            _ => {
                self.expect_type(id, &[OperandType::TensorFloat32], "TENSOR_FLOAT32")?;
                Ok(self
                    .constant_bytes(id)?
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect())
            }
        }
    }

    fn expect_type(
        &self,
        id: u32,
        allowed: &[OperandType],
        expected: &'static str,
    ) -> Result<(), ModelError> {
        let actual = self.operand_type(id)?;
        if allowed.contains(&actual) {
            Ok(())
        } else {
            Err(ModelError::TypeMismatch {
                operand: id,
                expected,
                actual,
            })
        }
    }

    fn first_bytes<const N: usize>(&self, id: u32) -> Result<[u8; N], ModelError> {
        self.constant_bytes(id)?
            .get(..N)
            .and_then(|b| b.try_into().ok())
            .ok_or(ModelError::ConstantOutOfBounds { operand: id })
    }
}

fn validate_quantization(id: u32, operand: &Operand) -> Result<(), ModelError> {
    let invalid = |reason: &str| ModelError::InvalidQuantization {
        operand: id,
        reason: reason.to_string(),
    };
    let ty = operand.operand_type;
    match (&operand.quantization, ty) {
        (Quantization::PerChannel { scales, channel_dim }, OperandType::TensorQuant8SymmPerChannel) => {
            let dim = operand
                .dimensions
                .get(*channel_dim)
                .ok_or_else(|| invalid("channel dimension out of range"))?;
            if *dim != 0 && scales.len() != *dim as usize {
                return Err(invalid("scale count differs from channel extent"));
            }
            if scales.iter().any(|s| *s <= 0.0) {
                return Err(invalid("non-positive channel scale"));
            }
            Ok(())
        }
        (Quantization::PerChannel { .. }, _) => {
            Err(invalid("per-channel parameters on a non per-channel type"))
        }
        (_, OperandType::TensorQuant8SymmPerChannel) => {
            Err(invalid("per-channel type without channel parameters"))
        }
        (Quantization::Scalar { scale, zero_point }, _) if ty.is_quantized() => {
            if *scale <= 0.0 {
                return Err(invalid("non-positive scale"));
            }
            if let Some((min, max)) = ty.quant_range() {
                if *zero_point < min || *zero_point > max {
                    return Err(invalid("zero point outside the representable range"));
                }
            }
            if !ty.is_asymmetric() && *zero_point != 0 {
                return Err(invalid("symmetric type with non-zero zero point"));
            }
            Ok(())
        }
        (Quantization::None, _) if ty.is_quantized() => Err(invalid("quantized type without a scale")),
        _ => Ok(()),
    }
}

/// Incremental model construction.
#[derive(Debug, Default)]
pub struct ModelBuilder {
    operands: Vec<Operand>,
    operations: Vec<Operation>,
    inputs: Vec<u32>,
    outputs: Vec<u32>,
    pools: Vec<Vec<u8>>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operand and return its id.
    pub fn operand(&mut self, operand: Operand) -> u32 {
        self.operands.push(operand);
        (self.operands.len() - 1) as u32
    }

    /// Add a model input operand.
    pub fn input(&mut self, mut operand: Operand) -> u32 {
        operand.lifetime = Lifetime::ModelInput;
        let id = self.operand(operand);
        self.inputs.push(id);
        id
    }

    /// Add a model output operand.
    pub fn output(&mut self, mut operand: Operand) -> u32 {
        operand.lifetime = Lifetime::ModelOutput;
        let id = self.operand(operand);
        self.outputs.push(id);
        id
    }

    /// Add a constant pool and return its index.
    pub fn pool(&mut self, bytes: Vec<u8>) -> u32 {
        self.pools.push(bytes);
        (self.pools.len() - 1) as u32
    }

    pub fn operation(&mut self, kind: OperationKind, inputs: &[u32], outputs: &[u32]) -> &mut Self {
        self.operations.push(Operation::new(kind, inputs, outputs));
        self
    }

    pub fn build(self) -> Result<Model, ModelError> {
        Model::new(
            self.operands,
            self.operations,
            self.inputs,
            self.outputs,
            self.pools,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataLocation;

    fn add_model() -> ModelBuilder {
        let mut b = ModelBuilder::new();
        let a = b.input(Operand::tensor(OperandType::TensorFloat32, &[2]));
        let c = b.operand(Operand::const_f32(&[2], &[1.0, 2.0]));
        let act = b.operand(Operand::scalar_i32(0));
        let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[2]));
        b.operation(OperationKind::Add, &[a, c, act], &[out]);
        b
    }

    #[test]
    fn test_valid_model_lookups() {
        let model = add_model().build().unwrap();
        assert_eq!(model.input_count(), 1);
        assert_eq!(model.model_output(0), Some(3));
        assert_eq!(model.operation_input(0, 1).unwrap(), 1);
        assert_eq!(model.vector_f32(1).unwrap(), vec![1.0, 2.0]);
        assert_eq!(model.scalar_i32(2).unwrap(), 0);
        assert!(model.operation_input(0, 5).is_err());
    }

    #[test]
    fn test_second_producer_rejected() {
        let mut b = add_model();
        b.operation(OperationKind::Relu, &[0], &[3]);
        let err = b.build().unwrap_err();
        assert!(matches!(
            err,
            ModelError::MultipleProducers { operand: 3, first: 0, second: 1 }
        ));
    }

    #[test]
    fn test_out_of_range_operand_rejected() {
        let mut b = add_model();
        b.operation(OperationKind::Relu, &[42], &[]);
        assert!(matches!(
            b.build(),
            Err(ModelError::OperandOutOfRange { operand: 42, .. })
        ));
    }

    #[test]
    fn test_quantized_operand_requires_scale() {
        let mut b = ModelBuilder::new();
        b.input(Operand::tensor(OperandType::TensorQuant8Asymm, &[4]));
        assert!(matches!(
            b.build(),
            Err(ModelError::InvalidQuantization { .. })
        ));
    }

    #[test]
    fn test_per_channel_scale_count_checked() {
        let mut b = ModelBuilder::new();
        b.operand(Operand::per_channel(&[3, 1, 1, 1], vec![0.1, 0.2], 0));
        assert!(b.build().is_err());

        let mut b = ModelBuilder::new();
        b.operand(Operand::per_channel(&[2, 1, 1, 1], vec![0.1, 0.2], 0));
        assert!(b.build().is_ok());
    }

    #[test]
    fn test_symmetric_zero_point_must_be_zero() {
        let mut b = ModelBuilder::new();
        b.operand(Operand::quantized(OperandType::TensorQuant8Symm, &[2], 0.5, 3));
        assert!(b.build().is_err());
    }

    #[test]
    fn test_pool_constants_are_read() {
        let mut b = ModelBuilder::new();
        let pool = b.pool([7i32, 9].iter().flat_map(|v| v.to_le_bytes()).collect());
        let id = b.operand(
            Operand::tensor(OperandType::TensorInt32, &[1]).with_pool_value(DataLocation {
                pool_index: pool,
                offset: 4,
                length: 4,
            }),
        );
        let model = b.build().unwrap();
        assert_eq!(model.vector_i32(id).unwrap(), vec![9]);
    }

    #[test]
    fn test_pool_constant_bounds_checked() {
        let mut b = ModelBuilder::new();
        let pool = b.pool(vec![0; 4]);
        b.operand(
            Operand::tensor(OperandType::TensorInt32, &[1]).with_pool_value(DataLocation {
                pool_index: pool,
                offset: 2,
                length: 4,
            }),
        );
        assert!(matches!(
            b.build(),
            Err(ModelError::ConstantOutOfBounds { operand: 0 })
        ));
    }

    #[test]
    fn test_scalar_type_checked() {
        let model = add_model().build().unwrap();
        assert!(matches!(
            model.scalar_bool(2),
            Err(ModelError::TypeMismatch { operand: 2, .. })
        ));
    }
}
