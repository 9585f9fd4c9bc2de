//! Compiled graphs and the inference contexts bound to them.
//!
//! An [`InferenceContext`] owns one set of input/output tensors. Contexts are
//! not shared: concurrent requests each check one out of a [`ContextPool`]
//! for the whole bind, invoke and read span.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::exec::{BackendError, Executor};
use super::graph::{Graph, GraphError, TensorDesc};
use super::tensor::HostTensor;

/// An executable graph and the executor that runs it.
#[derive(Clone)]
pub struct CompiledGraph {
    graph: Arc<Graph>,
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.graph.nodes().len())
            .field("executor", &self.executor.name())
            .finish()
    }
}

impl CompiledGraph {
    pub fn new(graph: Graph, executor: Arc<dyn Executor>) -> Self {
        Self {
            graph: Arc::new(graph),
            executor,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    pub fn input_count(&self) -> usize {
        self.graph.parameters().len()
    }

    pub fn output_count(&self) -> usize {
        self.graph.results().len()
    }

    pub fn input_desc(&self, index: usize) -> Option<&TensorDesc> {
        self.graph.parameter_desc(index)
    }

    pub fn output_desc(&self, index: usize) -> Option<&TensorDesc> {
        self.graph.result_desc(index)
    }

    /// Serialized (graph, weights) blobs for shipping to another executor.
    pub fn export(&self) -> Result<(Vec<u8>, Vec<u8>), GraphError> {
        self.graph.to_blobs()
    }

    pub fn create_context(&self) -> InferenceContext {
        let inputs = (0..self.input_count())
            .filter_map(|i| self.input_desc(i))
            .map(|d| HostTensor::zeroed(d.element_type, &d.shape))
            .collect();
        let outputs = (0..self.output_count())
            .filter_map(|i| self.output_desc(i))
            .map(|d| HostTensor::zeroed(d.element_type, &d.shape))
            .collect();
        InferenceContext {
            graph: Arc::clone(&self.graph),
            executor: Arc::clone(&self.executor),
            inputs,
            outputs,
        }
    }
}

/// Bound input/output tensors for one in-flight inference.
pub struct InferenceContext {
    graph: Arc<Graph>,
    executor: Arc<dyn Executor>,
    inputs: Vec<HostTensor>,
    outputs: Vec<HostTensor>,
}

impl InferenceContext {
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_tensor(&self, index: usize) -> Result<&HostTensor, BackendError> {
        self.inputs
            .get(index)
            .ok_or(BackendError::TensorUnavailable { index })
    }

    pub fn input_tensor_mut(&mut self, index: usize) -> Result<&mut HostTensor, BackendError> {
        self.inputs
            .get_mut(index)
            .ok_or(BackendError::TensorUnavailable { index })
    }

    pub fn output_tensor(&self, index: usize) -> Result<&HostTensor, BackendError> {
        self.outputs
            .get(index)
            .ok_or(BackendError::TensorUnavailable { index })
    }

    /// Same graph and executor, no tensors. Left behind in a guard whose
    /// context went back to the pool.
    fn hollow(&self) -> Self {
        Self {
            graph: Arc::clone(&self.graph),
            executor: Arc::clone(&self.executor),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Run the graph over the bound inputs, replacing the output tensors.
    pub fn infer(&mut self) -> Result<(), BackendError> {
        let produced = self.executor.execute(&self.graph, &self.inputs)?;
        if produced.len() != self.outputs.len() {
            return Err(BackendError::Fault(format!(
                "executor produced {} outputs, graph declares {}",
                produced.len(),
                self.outputs.len()
            )));
        }
        for (slot, tensor) in self.outputs.iter_mut().zip(produced) {
            let shape = tensor.shape().to_vec();
            slot.replace(shape, tensor.as_bytes().to_vec());
        }
        Ok(())
    }
}

/// Fixed set of inference contexts handed out one request at a time.
pub struct ContextPool {
    idle: Mutex<Vec<InferenceContext>>,
    returned: Condvar,
    capacity: usize,
}

impl ContextPool {
    /// Create `capacity` contexts (at least one).
    pub fn new(compiled: &CompiledGraph, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let idle = (0..capacity).map(|_| compiled.create_context()).collect();
        Self {
            idle: Mutex::new(idle),
            returned: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of contexts not currently checked out.
    pub fn available(&self) -> usize {
        self.idle.lock().len()
    }

    /// Block until a context is free and check it out.
    pub fn checkout(&self) -> ContextGuard<'_> {
        let mut idle = self.idle.lock();
        loop {
            if let Some(context) = idle.pop() {
                return ContextGuard { context, pool: self };
            }
            self.returned.wait(&mut idle);
        }
    }
}

/// A checked-out context, returned to its pool on drop.
pub struct ContextGuard<'a> {
    context: InferenceContext,
    pool: &'a ContextPool,
}

impl Deref for ContextGuard<'_> {
    type Target = InferenceContext;

    fn deref(&self) -> &InferenceContext {
        &self.context
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut InferenceContext {
        &mut self.context
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let hollow = self.context.hollow();
        let context = mem::replace(&mut self.context, hollow);
        self.pool.idle.lock().push(context);
        self.pool.returned.notify_one();
    }
}
