//! Execution requests and their structural validation.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use super::fence::Fence;
use crate::memory::MemoryPool;
use crate::model::{Model, Operand};

/// Where one input or output lives in the request's pools.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestArgument {
    pub has_no_value: bool,
    pub pool_index: u32,
    pub offset: u32,
    pub length: u32,
    /// Overrides the operand's dimensions when non-empty. Zero entries mean
    /// "as declared".
    pub dimensions: Vec<u32>,
}

impl RequestArgument {
    pub fn new(pool_index: u32, offset: u32, length: u32) -> Self {
        Self {
            pool_index,
            offset,
            length,
            ..Self::default()
        }
    }

    pub fn no_value() -> Self {
        Self {
            has_no_value: true,
            ..Self::default()
        }
    }

    pub fn with_dimensions(mut self, dimensions: &[u32]) -> Self {
        self.dimensions = dimensions.to_vec();
        self
    }
}

/// One inference request.
#[derive(Clone, Default)]
pub struct Request {
    pub inputs: Vec<RequestArgument>,
    pub outputs: Vec<RequestArgument>,
    pub pools: Vec<Arc<dyn MemoryPool>>,
    /// Report timing instead of the unknown sentinel.
    pub measure: bool,
    pub deadline: Option<Instant>,
    /// Fenced executions wait on these before dispatching.
    pub wait_for: Vec<Arc<dyn Fence>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("pools", &self.pools.len())
            .field("measure", &self.measure)
            .field("deadline", &self.deadline)
            .field("wait_for", &self.wait_for.len())
            .finish()
    }
}

impl Request {
    pub fn new(inputs: Vec<RequestArgument>, outputs: Vec<RequestArgument>) -> Self {
        Self {
            inputs,
            outputs,
            ..Self::default()
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn MemoryPool>) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn with_measure(mut self, measure: bool) -> Self {
        self.measure = measure;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_fence(mut self, fence: Arc<dyn Fence>) -> Self {
        self.wait_for.push(fence);
        self
    }
}

/// Structural problems with a request. All map to `InvalidArgument`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("Expected {expected} {kind} arguments, got {actual}")]
    ArgumentCount {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{kind} {index} names pool {pool}, request has {pools}")]
    PoolIndex {
        kind: &'static str,
        index: usize,
        pool: u32,
        pools: usize,
    },

    #[error("{kind} {index} range {offset}+{length} exceeds pool size {size}")]
    PoolBounds {
        kind: &'static str,
        index: usize,
        offset: u32,
        length: u32,
        size: usize,
    },

    #[error("{kind} {index} dimensions {actual:?} incompatible with {declared:?}")]
    Dimensions {
        kind: &'static str,
        index: usize,
        declared: Vec<u32>,
        actual: Vec<u32>,
    },

    #[error("Input {index} has {actual} bytes, expected {expected}")]
    InputLength { index: usize, expected: usize, actual: u32 },

    #[error("Input {index} has no value")]
    MissingInput { index: usize },

    #[error("Asynchronous execution requires a callback")]
    MissingCallback,

    #[error("Model has no {kind} {index}")]
    UnknownOperand { kind: &'static str, index: usize },
}

/// True when the operand would not become a graph parameter.
pub(crate) fn is_zero_sized(operand: &Operand) -> bool {
    operand.dimensions.is_empty() || operand.dimensions.contains(&0)
}

/// Dimensions the request binds: the override where given, else declared.
pub(crate) fn effective_dimensions(declared: &[u32], requested: &[u32]) -> Vec<u32> {
    if requested.is_empty() {
        return declared.to_vec();
    }
    requested
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            if d == 0 {
                declared.get(i).copied().unwrap_or(0)
            } else {
                d
            }
        })
        .collect()
}

fn dimensions_compatible(declared: &[u32], requested: &[u32]) -> bool {
    if requested.is_empty() || declared.is_empty() {
        return true;
    }
    requested.len() == declared.len()
        && declared
            .iter()
            .zip(requested)
            .all(|(&d, &r)| d == 0 || r == 0 || d == r)
}

fn check_location(
    kind: &'static str,
    index: usize,
    arg: &RequestArgument,
    pools: &[Arc<dyn MemoryPool>],
) -> Result<(), RequestError> {
    if arg.has_no_value {
        return Ok(());
    }
    let pool = pools
        .get(arg.pool_index as usize)
        .ok_or(RequestError::PoolIndex {
            kind,
            index,
            pool: arg.pool_index,
            pools: pools.len(),
        })?;
    let end = arg.offset as usize + arg.length as usize;
    if end > pool.size() {
        return Err(RequestError::PoolBounds {
            kind,
            index,
            offset: arg.offset,
            length: arg.length,
            size: pool.size(),
        });
    }
    Ok(())
}

/// Check a request against the model's declared signature before any work.
pub fn validate_request(request: &Request, model: &Model) -> Result<(), RequestError> {
    if request.inputs.len() != model.input_count() {
        return Err(RequestError::ArgumentCount {
            kind: "input",
            expected: model.input_count(),
            actual: request.inputs.len(),
        });
    }
    if request.outputs.len() != model.output_count() {
        return Err(RequestError::ArgumentCount {
            kind: "output",
            expected: model.output_count(),
            actual: request.outputs.len(),
        });
    }

    for (index, (arg, &id)) in request.inputs.iter().zip(model.inputs()).enumerate() {
        let operand = model
            .operand(id)
            .map_err(|_| RequestError::UnknownOperand { kind: "input", index })?;
        check_location("Input", index, arg, &request.pools)?;
        if is_zero_sized(operand) {
            continue;
        }
        if arg.has_no_value {
            return Err(RequestError::MissingInput { index });
        }
        if !dimensions_compatible(&operand.dimensions, &arg.dimensions) {
            return Err(RequestError::Dimensions {
                kind: "Input",
                index,
                declared: operand.dimensions.clone(),
                actual: arg.dimensions.clone(),
            });
        }
        let dims = effective_dimensions(&operand.dimensions, &arg.dimensions);
        let expected = dims.iter().map(|&d| d as usize).product::<usize>() * operand.operand_type.element_size();
        if arg.length as usize != expected {
            return Err(RequestError::InputLength {
                index,
                expected,
                actual: arg.length,
            });
        }
    }

    for (index, (arg, &id)) in request.outputs.iter().zip(model.outputs()).enumerate() {
        let operand = model
            .operand(id)
            .map_err(|_| RequestError::UnknownOperand { kind: "output", index })?;
        check_location("Output", index, arg, &request.pools)?;
        if !dimensions_compatible(&operand.dimensions, &arg.dimensions) {
            return Err(RequestError::Dimensions {
                kind: "Output",
                index,
                declared: operand.dimensions.clone(),
                actual: arg.dimensions.clone(),
            });
        }
    }
    Ok(())
}
