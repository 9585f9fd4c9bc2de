//! Operand descriptions: element encodings, quantization metadata and lifetimes.

use serde::{Deserialize, Serialize};

use crate::backend::ElementType;

/// Element encoding of an operand.
///
/// The first five variants are scalars; the rest are tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandType {
    Float32,
    Int32,
    Uint32,
    Bool,
    Float16,
    TensorFloat32,
    TensorFloat16,
    TensorInt32,
    TensorBool8,
    TensorQuant8Asymm,
    TensorQuant8AsymmSigned,
    TensorQuant8Symm,
    TensorQuant8SymmPerChannel,
    TensorQuant16Asymm,
    TensorQuant16Symm,
}

impl OperandType {
    /// Bytes per element.
    pub fn element_size(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 | Self::Uint32 => 4,
            Self::TensorFloat32 | Self::TensorInt32 => 4,
            Self::Float16 | Self::TensorFloat16 => 2,
            Self::TensorQuant16Asymm | Self::TensorQuant16Symm => 2,
            Self::Bool | Self::TensorBool8 => 1,
            Self::TensorQuant8Asymm
            | Self::TensorQuant8AsymmSigned
            | Self::TensorQuant8Symm
            | Self::TensorQuant8SymmPerChannel => 1,
        }
    }

    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Self::Float32 | Self::Int32 | Self::Uint32 | Self::Bool | Self::Float16
        )
    }

    /// True for the quantized tensor encodings (integer storage with a real-valued scale).
    pub fn is_quantized(self) -> bool {
        matches!(
            self,
            Self::TensorQuant8Asymm
                | Self::TensorQuant8AsymmSigned
                | Self::TensorQuant8Symm
                | Self::TensorQuant8SymmPerChannel
                | Self::TensorQuant16Asymm
                | Self::TensorQuant16Symm
        )
    }

    /// True when dequantization subtracts a zero point.
    pub fn is_asymmetric(self) -> bool {
        matches!(
            self,
            Self::TensorQuant8Asymm | Self::TensorQuant8AsymmSigned | Self::TensorQuant16Asymm
        )
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            Self::Float32 | Self::Float16 | Self::TensorFloat32 | Self::TensorFloat16
        )
    }

    /// Backend element type with the same bit layout.
    pub fn element_type(self) -> ElementType {
        match self {
            Self::Float32 | Self::TensorFloat32 => ElementType::F32,
            Self::Float16 | Self::TensorFloat16 => ElementType::F16,
            Self::Int32 | Self::TensorInt32 => ElementType::I32,
            Self::Uint32 => ElementType::U32,
            Self::Bool | Self::TensorBool8 => ElementType::Boolean,
            Self::TensorQuant8Asymm => ElementType::U8,
            Self::TensorQuant8AsymmSigned
            | Self::TensorQuant8Symm
            | Self::TensorQuant8SymmPerChannel => ElementType::I8,
            Self::TensorQuant16Asymm => ElementType::U16,
            Self::TensorQuant16Symm => ElementType::I16,
        }
    }

    /// Representable integer range of a quantized encoding.
    pub fn quant_range(self) -> Option<(i32, i32)> {
        match self {
            Self::TensorQuant8Asymm => Some((0, 255)),
            Self::TensorQuant8AsymmSigned
            | Self::TensorQuant8Symm
            | Self::TensorQuant8SymmPerChannel => Some((-128, 127)),
            Self::TensorQuant16Asymm => Some((0, 65535)),
            Self::TensorQuant16Symm => Some((-32768, 32767)),
            _ => None,
        }
    }
}

/// Quantization parameters. A quantized operand carries exactly one form.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Quantization {
    #[default]
    None,
    Scalar { scale: f32, zero_point: i32 },
    PerChannel { scales: Vec<f32>, channel_dim: usize },
}

/// How long an operand's value lives and who supplies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lifetime {
    #[default]
    TemporaryVariable,
    ModelInput,
    ModelOutput,
    ConstantCopy,
    ConstantReference,
    NoValue,
}

/// Byte range inside one of the model's constant pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLocation {
    pub pool_index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Where a constant operand's bytes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperandValue {
    Inline(Vec<u8>),
    Pool(DataLocation),
}

/// A typed value slot in the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    pub operand_type: OperandType,
    pub dimensions: Vec<u32>,
    pub quantization: Quantization,
    pub lifetime: Lifetime,
    pub value: Option<OperandValue>,
}

impl Operand {
    /// A temporary tensor operand.
    pub fn tensor(operand_type: OperandType, dimensions: &[u32]) -> Self {
        Self {
            operand_type,
            dimensions: dimensions.to_vec(),
            quantization: Quantization::None,
            lifetime: Lifetime::TemporaryVariable,
            value: None,
        }
    }

    /// A quantized tensor operand with a scalar scale and zero point.
    pub fn quantized(
        operand_type: OperandType,
        dimensions: &[u32],
        scale: f32,
        zero_point: i32,
    ) -> Self {
        Self {
            quantization: Quantization::Scalar { scale, zero_point },
            ..Self::tensor(operand_type, dimensions)
        }
    }

    /// A per-channel symmetric quantized tensor.
    pub fn per_channel(dimensions: &[u32], scales: Vec<f32>, channel_dim: usize) -> Self {
        Self {
            quantization: Quantization::PerChannel { scales, channel_dim },
            ..Self::tensor(OperandType::TensorQuant8SymmPerChannel, dimensions)
        }
    }

    /// Attach inline constant bytes.
    pub fn with_value(mut self, bytes: Vec<u8>) -> Self {
        self.lifetime = Lifetime::ConstantCopy;
        self.value = Some(OperandValue::Inline(bytes));
        self
    }

    /// Point the operand at a range of a model constant pool.
    pub fn with_pool_value(mut self, location: DataLocation) -> Self {
        self.lifetime = Lifetime::ConstantReference;
        self.value = Some(OperandValue::Pool(location));
        self
    }

    pub fn scalar_i32(value: i32) -> Self {
        Self::tensor(OperandType::Int32, &[]).with_value(value.to_le_bytes().to_vec())
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self::tensor(OperandType::Float32, &[]).with_value(value.to_le_bytes().to_vec())
    }

    pub fn scalar_bool(value: bool) -> Self {
        Self::tensor(OperandType::Bool, &[]).with_value(vec![u8::from(value)])
    }

    pub fn const_f32(dimensions: &[u32], values: &[f32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::tensor(OperandType::TensorFloat32, dimensions).with_value(bytes)
    }

    pub fn const_i32(dimensions: &[u32], values: &[i32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::tensor(OperandType::TensorInt32, dimensions).with_value(bytes)
    }

    /// An omitted optional operand.
    pub fn no_value(operand_type: OperandType) -> Self {
        Self {
            lifetime: Lifetime::NoValue,
            ..Self::tensor(operand_type, &[])
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(
            self.lifetime,
            Lifetime::ConstantCopy | Lifetime::ConstantReference
        )
    }

    /// Number of elements, or `None` when any dimension is unknown (zero).
    pub fn element_count(&self) -> Option<usize> {
        if self.operand_type.is_scalar() {
            return Some(1);
        }
        self.dimensions
            .iter()
            .try_fold(1usize, |acc, &d| (d != 0).then(|| acc * d as usize))
    }

    /// True when every dimension is known.
    pub fn is_fully_specified(&self) -> bool {
        self.element_count().is_some()
    }

    /// Byte size for fully specified operands.
    pub fn byte_size(&self) -> Option<usize> {
        self.element_count()
            .map(|n| n * self.operand_type.element_size())
    }

    pub fn scale(&self) -> f32 {
        match &self.quantization {
            Quantization::Scalar { scale, .. } => *scale,
            _ => 0.0,
        }
    }

    pub fn zero_point(&self) -> i32 {
        match &self.quantization {
            Quantization::Scalar { zero_point, .. } => *zero_point,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(OperandType::TensorFloat32.element_size(), 4);
        assert_eq!(OperandType::TensorFloat16.element_size(), 2);
        assert_eq!(OperandType::TensorQuant16Symm.element_size(), 2);
        assert_eq!(OperandType::TensorQuant8AsymmSigned.element_size(), 1);
        assert_eq!(OperandType::Bool.element_size(), 1);
    }

    #[test]
    fn test_quantized_encodings_map_to_narrow_types() {
        assert_eq!(OperandType::TensorQuant8Asymm.element_type(), ElementType::U8);
        assert_eq!(OperandType::TensorQuant8Symm.element_type(), ElementType::I8);
        assert_eq!(
            OperandType::TensorQuant8SymmPerChannel.element_type(),
            ElementType::I8
        );
        assert_eq!(OperandType::TensorQuant16Asymm.element_type(), ElementType::U16);
        assert_eq!(OperandType::TensorQuant16Symm.element_type(), ElementType::I16);
        assert!(!OperandType::TensorInt32.is_quantized());
    }

    #[test]
    fn test_byte_size_needs_known_dims() {
        let op = Operand::tensor(OperandType::TensorFloat32, &[1, 2, 3]);
        assert_eq!(op.byte_size(), Some(24));

        let unknown = Operand::tensor(OperandType::TensorFloat32, &[0, 2]);
        assert_eq!(unknown.byte_size(), None);
        assert!(!unknown.is_fully_specified());

        assert_eq!(Operand::scalar_i32(3).byte_size(), Some(4));
    }
}
