//! Host-resident tensors bound to compiled-graph inputs and outputs.

use super::element::ElementType;

/// A dense, row-major tensor stored as raw little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    element_type: ElementType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl HostTensor {
    pub fn zeroed(element_type: ElementType, shape: &[usize]) -> Self {
        let len = shape.iter().product::<usize>() * element_type.size();
        Self {
            element_type,
            shape: shape.to_vec(),
            data: vec![0; len],
        }
    }

    pub fn from_values(element_type: ElementType, shape: &[usize], values: &[f64]) -> Self {
        Self {
            element_type,
            shape: shape.to_vec(),
            data: element_type.encode(values),
        }
    }

    pub fn from_f32(shape: &[usize], values: &[f32]) -> Self {
        Self {
            element_type: ElementType::F32,
            shape: shape.to_vec(),
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn from_i32(shape: &[usize], values: &[i32]) -> Self {
        Self {
            element_type: ElementType::I32,
            shape: shape.to_vec(),
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Wrap raw bytes. Returns `None` if the length does not match the shape.
    pub fn from_bytes(element_type: ElementType, shape: &[usize], data: Vec<u8>) -> Option<Self> {
        let expected = shape.iter().product::<usize>() * element_type.size();
        (data.len() == expected).then(|| Self {
            element_type,
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace contents with a freshly produced value of possibly different shape.
    pub(crate) fn replace(&mut self, shape: Vec<usize>, data: Vec<u8>) {
        self.shape = shape;
        self.data = data;
    }

    pub fn values(&self) -> Vec<f64> {
        self.element_type.decode(&self.data)
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.values().into_iter().map(|v| v as f32).collect()
    }
}
