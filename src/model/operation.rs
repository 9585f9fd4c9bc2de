//! Operation vocabulary and operation records.

use serde::{Deserialize, Serialize};

macro_rules! operation_kinds {
    ($($variant:ident => $name:literal,)*) => {
        /// Every operation kind a model may declare.
        ///
        /// Kinds without a registered translator are reported unsupported.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum OperationKind {
            $($variant,)*
        }

        impl OperationKind {
            pub const ALL: &'static [OperationKind] = &[$(OperationKind::$variant,)*];

            /// Canonical upper-case name used in logs.
            pub fn name(self) -> &'static str {
                match self {
                    $(OperationKind::$variant => $name,)*
                }
            }
        }
    };
}

operation_kinds! {
    Add => "ADD",
    AveragePool2d => "AVERAGE_POOL_2D",
    Concatenation => "CONCATENATION",
    Conv2d => "CONV_2D",
    DepthwiseConv2d => "DEPTHWISE_CONV_2D",
    DepthToSpace => "DEPTH_TO_SPACE",
    Dequantize => "DEQUANTIZE",
    EmbeddingLookup => "EMBEDDING_LOOKUP",
    Floor => "FLOOR",
    FullyConnected => "FULLY_CONNECTED",
    HashtableLookup => "HASHTABLE_LOOKUP",
    L2Normalization => "L2_NORMALIZATION",
    L2Pool2d => "L2_POOL_2D",
    LocalResponseNormalization => "LOCAL_RESPONSE_NORMALIZATION",
    Logistic => "LOGISTIC",
    LshProjection => "LSH_PROJECTION",
    Lstm => "LSTM",
    MaxPool2d => "MAX_POOL_2D",
    Mul => "MUL",
    Relu => "RELU",
    Relu1 => "RELU1",
    Relu6 => "RELU6",
    Reshape => "RESHAPE",
    ResizeBilinear => "RESIZE_BILINEAR",
    Rnn => "RNN",
    Softmax => "SOFTMAX",
    SpaceToDepth => "SPACE_TO_DEPTH",
    Svdf => "SVDF",
    Tanh => "TANH",
    BatchToSpaceNd => "BATCH_TO_SPACE_ND",
    Div => "DIV",
    Mean => "MEAN",
    Pad => "PAD",
    SpaceToBatchNd => "SPACE_TO_BATCH_ND",
    Squeeze => "SQUEEZE",
    StridedSlice => "STRIDED_SLICE",
    Sub => "SUB",
    Transpose => "TRANSPOSE",
    Abs => "ABS",
    ArgMax => "ARGMAX",
    ArgMin => "ARGMIN",
    AxisAlignedBboxTransform => "AXIS_ALIGNED_BBOX_TRANSFORM",
    BidirectionalSequenceLstm => "BIDIRECTIONAL_SEQUENCE_LSTM",
    BidirectionalSequenceRnn => "BIDIRECTIONAL_SEQUENCE_RNN",
    BoxWithNmsLimit => "BOX_WITH_NMS_LIMIT",
    Cast => "CAST",
    ChannelShuffle => "CHANNEL_SHUFFLE",
    DetectionPostprocessing => "DETECTION_POSTPROCESSING",
    Equal => "EQUAL",
    Exp => "EXP",
    ExpandDims => "EXPAND_DIMS",
    Gather => "GATHER",
    GenerateProposals => "GENERATE_PROPOSALS",
    Greater => "GREATER",
    GreaterEqual => "GREATER_EQUAL",
    GroupedConv2d => "GROUPED_CONV_2D",
    HeatmapMaxKeypoint => "HEATMAP_MAX_KEYPOINT",
    InstanceNormalization => "INSTANCE_NORMALIZATION",
    Less => "LESS",
    LessEqual => "LESS_EQUAL",
    Log => "LOG",
    LogicalAnd => "LOGICAL_AND",
    LogicalNot => "LOGICAL_NOT",
    LogicalOr => "LOGICAL_OR",
    LogSoftmax => "LOG_SOFTMAX",
    Maximum => "MAXIMUM",
    Minimum => "MINIMUM",
    Neg => "NEG",
    NotEqual => "NOT_EQUAL",
    PadV2 => "PAD_V2",
    Pow => "POW",
    Prelu => "PRELU",
    Quantize => "QUANTIZE",
    Quantized16BitLstm => "QUANTIZED_16BIT_LSTM",
    RandomMultinomial => "RANDOM_MULTINOMIAL",
    ReduceAll => "REDUCE_ALL",
    ReduceAny => "REDUCE_ANY",
    ReduceMax => "REDUCE_MAX",
    ReduceMin => "REDUCE_MIN",
    ReduceProd => "REDUCE_PROD",
    ReduceSum => "REDUCE_SUM",
    RoiAlign => "ROI_ALIGN",
    RoiPooling => "ROI_POOLING",
    Rsqrt => "RSQRT",
    Select => "SELECT",
    Sin => "SIN",
    Slice => "SLICE",
    Split => "SPLIT",
    Sqrt => "SQRT",
    Tile => "TILE",
    TopkV2 => "TOPK_V2",
    TransposeConv2d => "TRANSPOSE_CONV_2D",
    UnidirectionalSequenceLstm => "UNIDIRECTIONAL_SEQUENCE_LSTM",
    UnidirectionalSequenceRnn => "UNIDIRECTIONAL_SEQUENCE_RNN",
    ResizeNearestNeighbor => "RESIZE_NEAREST_NEIGHBOR",
    QuantizedLstm => "QUANTIZED_LSTM",
    If => "IF",
    While => "WHILE",
    Elu => "ELU",
    HardSwish => "HARD_SWISH",
    Fill => "FILL",
    Rank => "RANK",
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One node of the declared model graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
}

impl Operation {
    pub fn new(kind: OperationKind, inputs: &[u32], outputs: &[u32]) -> Self {
        Self {
            kind,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_vocabulary_names_are_unique() {
        let names: HashSet<_> = OperationKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names.len(), OperationKind::ALL.len());
        assert!(OperationKind::ALL.len() >= 100);
    }

    #[test]
    fn test_display_uses_canonical_name() {
        assert_eq!(OperationKind::DepthwiseConv2d.to_string(), "DEPTHWISE_CONV_2D");
    }
}
