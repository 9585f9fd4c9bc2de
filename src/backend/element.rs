//! Backend element types and their byte encodings.

use half::f16;
use serde::{Deserialize, Serialize};

/// Storage type of a graph tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    F32,
    F16,
    I32,
    U32,
    U8,
    I8,
    U16,
    I16,
    Boolean,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F16 | Self::U16 | Self::I16 => 2,
            Self::U8 | Self::I8 | Self::Boolean => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16)
    }

    /// Round-trip a wide value through this type's value set.
    ///
    /// Float-to-integer narrowing truncates toward zero and saturates.
    pub fn narrow(self, v: f64) -> f64 {
        match self {
            Self::F32 => v as f32 as f64,
            Self::F16 => f16::from_f64(v).to_f64(),
            Self::I32 => v as i32 as f64,
            Self::U32 => v as u32 as f64,
            Self::U8 => v as u8 as f64,
            Self::I8 => v as i8 as f64,
            Self::U16 => v as u16 as f64,
            Self::I16 => v as i16 as f64,
            Self::Boolean => {
                if v != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Decode little-endian bytes into wide values.
    pub fn decode(self, bytes: &[u8]) -> Vec<f64> {
        match self {
            Self::F32 => chunks::<4>(bytes).map(|b| f32::from_le_bytes(b) as f64).collect(),
            Self::F16 => chunks::<2>(bytes).map(|b| f16::from_le_bytes(b).to_f64()).collect(),
            Self::I32 => chunks::<4>(bytes).map(|b| i32::from_le_bytes(b) as f64).collect(),
            Self::U32 => chunks::<4>(bytes).map(|b| u32::from_le_bytes(b) as f64).collect(),
            Self::U16 => chunks::<2>(bytes).map(|b| u16::from_le_bytes(b) as f64).collect(),
            Self::I16 => chunks::<2>(bytes).map(|b| i16::from_le_bytes(b) as f64).collect(),
            Self::U8 => bytes.iter().map(|&b| b as f64).collect(),
            Self::I8 => bytes.iter().map(|&b| b as i8 as f64).collect(),
            Self::Boolean => bytes.iter().map(|&b| if b != 0 { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Encode wide values as little-endian bytes of this type.
    pub fn encode(self, values: &[f64]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * self.size());
        for &v in values {
            match self {
                Self::F32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
                Self::F16 => out.extend_from_slice(&f16::from_f64(v).to_le_bytes()),
                Self::I32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
                Self::U32 => out.extend_from_slice(&(v as u32).to_le_bytes()),
                Self::U16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
                Self::I16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
                Self::U8 => out.push(v as u8),
                Self::I8 => out.push(v as i8 as u8),
                Self::Boolean => out.push(u8::from(v != 0.0)),
            }
        }
        out
    }
}

fn chunks<const N: usize>(bytes: &[u8]) -> impl Iterator<Item = [u8; N]> + '_ {
    bytes.chunks_exact(N).map(|c| {
        let mut buf = [0u8; N];
        buf.copy_from_slice(c);
        buf
    })
}
