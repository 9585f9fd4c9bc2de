use thiserror::Error;

use crate::backend::GraphError;
use crate::model::{ModelError, OperandType, OperationKind};

/// Errors raised while translating operations into graph nodes.
///
/// Any of these discards the partially built graph.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("No translator registered for operation {index} ({kind})")]
    MissingTranslator { index: usize, kind: OperationKind },

    #[error("Operation {index} ({kind}) is not supported")]
    Unsupported { index: usize, kind: OperationKind },

    #[error("Operation {index}: operand {operand} has no graph node")]
    MissingNode { index: usize, operand: u32 },

    #[error("Operation {index}: {detail}")]
    InvalidParameter { index: usize, detail: String },

    #[error("Operand {operand}: unsupported input encoding {operand_type:?}")]
    UnsupportedInputType {
        operand: u32,
        operand_type: OperandType,
    },

    #[error("Operation {index}: operand {operand} built as {built:?}, declared {declared:?}")]
    ShapeMismatch {
        index: usize,
        operand: u32,
        built: Vec<usize>,
        declared: Vec<u32>,
    },

    #[error("Model output {operand} was never produced")]
    UnwiredOutput { operand: u32 },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
}
