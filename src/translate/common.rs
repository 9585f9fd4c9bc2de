//! Layout conversions, padding arithmetic and fused activations shared by
//! the translator families.

/// Axis permutations between operand layouts and the backend's NCHW/OIHW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutConversion {
    NhwcToNchw,
    NchwToNhwc,
    /// Depthwise filter `[1, kh, kw, out]` to `[out, 1, kh, kw]`.
    IhwoToOihw,
    /// Regular filter `[out, kh, kw, in]` to `[out, in, kh, kw]`.
    OhwiToOihw,
}

impl LayoutConversion {
    pub fn order(self) -> [usize; 4] {
        match self {
            Self::NhwcToNchw => [0, 3, 1, 2],
            Self::NchwToNhwc => [0, 2, 3, 1],
            Self::IhwoToOihw => [3, 0, 1, 2],
            Self::OhwiToOihw => [0, 3, 1, 2],
        }
    }
}

/// Fused activation codes carried as an INT32 scalar operand.
pub const ACTIVATION_NONE: i32 = 0;
pub const ACTIVATION_RELU: i32 = 1;
pub const ACTIVATION_RELU1: i32 = 2;
pub const ACTIVATION_RELU6: i32 = 3;

/// Implicit padding scheme codes.
pub const PADDING_SAME: i32 = 1;
pub const PADDING_VALID: i32 = 2;

pub fn is_padding_scheme(code: i32) -> bool {
    matches!(code, PADDING_SAME | PADDING_VALID)
}

/// Head/tail padding that makes `out = ceil(in / stride)` ("SAME").
///
/// Dilation is not considered.
pub fn calculate_explicit_padding(input: usize, stride: usize, kernel: usize) -> (usize, usize) {
    let stride = stride.max(1);
    let out = input.div_ceil(stride);
    let needed = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(input);
    let head = needed / 2;
    (head, needed - head)
}

/// Real-valued scale of a per-channel quantized bias: `input_scale * filter_scale[c]`.
pub fn per_channel_bias_scales(input_scale: f32, filter_scales: &[f32]) -> Vec<f32> {
    filter_scales.iter().map(|s| s * input_scale).collect()
}

/// Resolve a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i32, rank: usize) -> Option<usize> {
    let rank_i = rank as i32;
    let resolved = if axis < 0 { axis + rank_i } else { axis };
    (0..rank_i).contains(&resolved).then_some(resolved as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_padding_stride_one() {
        // 3x3 kernel keeps a 5-wide input at 5: one cell each side
        assert_eq!(calculate_explicit_padding(5, 1, 3), (1, 1));
    }

    #[test]
    fn test_same_padding_uneven_split_goes_to_tail() {
        // out = ceil(6/2) = 3, needed = 2*2 + 3 - 6 = 1
        assert_eq!(calculate_explicit_padding(6, 2, 3), (0, 1));
        // out = ceil(7/2) = 4, needed = 3*2 + 4 - 7 = 3
        assert_eq!(calculate_explicit_padding(7, 2, 4), (1, 2));
    }

    #[test]
    fn test_same_padding_never_negative() {
        assert_eq!(calculate_explicit_padding(8, 4, 1), (0, 0));
    }

    #[test]
    fn test_per_channel_bias_scales() {
        let scales = per_channel_bias_scales(0.5, &[0.1, 0.2]);
        assert!((scales[0] - 0.05).abs() < 1e-7);
        assert!((scales[1] - 0.1).abs() < 1e-7);
    }

    #[test]
    fn test_layout_orders() {
        assert_eq!(LayoutConversion::NhwcToNchw.order(), [0, 3, 1, 2]);
        assert_eq!(LayoutConversion::NchwToNhwc.order(), [0, 2, 3, 1]);
        assert_eq!(LayoutConversion::IhwoToOihw.order(), [3, 0, 1, 2]);
    }

    #[test]
    fn test_normalize_axis() {
        assert_eq!(normalize_axis(-1, 4), Some(3));
        assert_eq!(normalize_axis(2, 4), Some(2));
        assert_eq!(normalize_axis(4, 4), None);
        assert_eq!(normalize_axis(-5, 4), None);
    }
}
