//! Operand store: the declarative tensor-operation graph handed to the compiler.
//!
//! A [`Model`] is validated once at construction and is immutable afterwards.
//! Per-request state (output shapes, timings) never lives here.

mod operand;
mod operation;
mod store;

pub use operand::{DataLocation, Lifetime, Operand, OperandType, OperandValue, Quantization};
pub use operation::{Operation, OperationKind};
pub use store::{Model, ModelBuilder, ModelError};
