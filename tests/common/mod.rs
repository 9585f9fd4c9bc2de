//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nnrt_core::backend::{BackendError, ElementType, Executor, Graph, HostTensor, ReferenceExecutor};
use nnrt_core::config::RuntimeConfig;
use nnrt_core::execution::{Request, RequestArgument};
use nnrt_core::memory::{HostMemory, MappedPool, MemoryError, MemoryPool};
use nnrt_core::model::{Model, ModelBuilder, Operand, OperandType, OperationKind};
use nnrt_core::remote::{DelegateConnector, Endpoint, RemoteConnectionManager, RemoteDelegate, RemoteError};
use nnrt_core::translate::TranslatorRegistry;
use nnrt_core::Driver;

pub fn config(contexts: usize) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.worker_pool.num_threads = 4;
    config.inference_contexts = contexts;
    config
}

pub fn local_driver() -> Driver {
    driver_with(Arc::new(ReferenceExecutor::new()), Arc::new(RemoteConnectionManager::disabled()), 1)
}

pub fn driver_with(executor: Arc<dyn Executor>, remote: Arc<RemoteConnectionManager>, contexts: usize) -> Driver {
    Driver::with_parts(&config(contexts), TranslatorRegistry::standard(), executor, remote).unwrap()
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn bytes_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// `relu(x + [1, -5, 0.5, 0])` over a `[2, 2]` FP32 input.
pub fn add_relu_model() -> Arc<Model> {
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[2, 2]));
    let c = b.operand(Operand::const_f32(&[2, 2], &[1.0, -5.0, 0.5, 0.0]));
    let act = b.operand(Operand::scalar_i32(0));
    let sum = b.operand(Operand::tensor(OperandType::TensorFloat32, &[2, 2]));
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[2, 2]));
    b.operation(OperationKind::Add, &[x, c, act], &[sum]);
    b.operation(OperationKind::Relu, &[sum], &[out]);
    Arc::new(b.build().unwrap())
}

pub fn add_relu_expected(input: &[f32]) -> Vec<f32> {
    input
        .iter()
        .zip([1.0, -5.0, 0.5, 0.0])
        .map(|(x, c)| (x + c).max(0.0))
        .collect()
}

/// One pool: 16 input bytes at 0, `output_len` output bytes at 16.
pub fn add_relu_request(input: &[f32], output_len: u32) -> (Request, HostMemory) {
    let memory = HostMemory::new(16 + output_len as usize);
    memory.write_at(0, &f32_bytes(input)).unwrap();
    let request = Request::new(
        vec![RequestArgument::new(0, 0, 16)],
        vec![RequestArgument::new(0, 16, output_len)],
    )
    .with_pool(Arc::new(memory.clone()));
    (request, memory)
}

pub fn output_f32(memory: &HostMemory, offset: usize, count: usize) -> Vec<f32> {
    bytes_f32(&memory.read_at(offset, count * 4).unwrap())
}

/// A pool whose mapping always fails.
pub struct UnmappablePool;

impl MemoryPool for UnmappablePool {
    fn size(&self) -> usize {
        1024
    }

    fn map(&self) -> Result<Box<dyn MappedPool>, MemoryError> {
        Err(MemoryError::Map("device gone".into()))
    }
}

/// Host memory whose mappings fail to flush.
pub struct UnflushablePool {
    pub inner: HostMemory,
    pub flushes: Arc<AtomicUsize>,
}

struct UnflushableMapping {
    inner: Box<dyn MappedPool>,
    flushes: Arc<AtomicUsize>,
}

impl MemoryPool for UnflushablePool {
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn map(&self) -> Result<Box<dyn MappedPool>, MemoryError> {
        Ok(Box::new(UnflushableMapping {
            inner: self.inner.map()?,
            flushes: Arc::clone(&self.flushes),
        }))
    }
}

impl MappedPool for UnflushableMapping {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn read(&self, offset: usize, dest: &mut [u8]) -> Result<(), MemoryError> {
        self.inner.read(offset, dest)
    }

    fn write(&mut self, offset: usize, src: &[u8]) -> Result<(), MemoryError> {
        self.inner.write(offset, src)
    }

    fn flush(&mut self) -> Result<(), MemoryError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Err(MemoryError::Flush("read-only mapping".into()))
    }
}

/// An executor that always faults.
pub struct FaultyExecutor;

impl Executor for FaultyExecutor {
    fn name(&self) -> &str {
        "faulty"
    }

    fn execute(&self, _: &Graph, _: &[HostTensor]) -> Result<Vec<HostTensor>, BackendError> {
        Err(BackendError::Fault("device lost".into()))
    }
}

/// An executor that panics mid-inference.
pub struct PanickingExecutor;

impl Executor for PanickingExecutor {
    fn name(&self) -> &str {
        "panicking"
    }

    fn execute(&self, _: &Graph, _: &[HostTensor]) -> Result<Vec<HostTensor>, BackendError> {
        panic!("kernel assertion failed")
    }
}

/// How a scripted delegate behaves on `run_inference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateMode {
    /// Run the uploaded graph on the reference executor.
    Compute,
    /// Reply, but report failure through `status`.
    ReportFailure,
}

#[derive(Default)]
pub struct DelegateStats {
    pub runs: AtomicUsize,
    pub uploads: AtomicUsize,
    pub clears: AtomicUsize,
}

/// In-process delegate running uploaded graphs with the reference executor.
pub struct ScriptedDelegate {
    mode: DelegateMode,
    stats: Arc<DelegateStats>,
    graph: Option<Graph>,
    inputs: Vec<Option<HostTensor>>,
    outputs: Vec<HostTensor>,
    ok: bool,
}

impl RemoteDelegate for ScriptedDelegate {
    fn prepare(&mut self) -> Result<String, RemoteError> {
        Ok("scripted".into())
    }

    fn send_model(&mut self, graph: &[u8], weights: &[u8]) -> Result<(), RemoteError> {
        self.stats.uploads.fetch_add(1, Ordering::SeqCst);
        self.graph = Some(Graph::from_blobs(graph, weights).map_err(|e| RemoteError::Protocol(e.to_string()))?);
        Ok(())
    }

    fn add_input(
        &mut self,
        index: usize,
        data: &[u8],
        shape: &[usize],
        element_type: ElementType,
    ) -> Result<(), RemoteError> {
        if self.inputs.len() <= index {
            self.inputs.resize(index + 1, None);
        }
        self.inputs[index] = HostTensor::from_bytes(element_type, shape, data.to_vec());
        Ok(())
    }

    fn run_inference(&mut self) -> Result<String, RemoteError> {
        self.stats.runs.fetch_add(1, Ordering::SeqCst);
        if self.mode == DelegateMode::ReportFailure {
            self.ok = false;
            return Ok("failed".into());
        }
        let graph = self
            .graph
            .as_ref()
            .ok_or_else(|| RemoteError::Protocol("no model".into()))?;
        let inputs: Vec<HostTensor> = self.inputs.iter().flatten().cloned().collect();
        self.outputs = ReferenceExecutor::new()
            .execute(graph, &inputs)
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        self.ok = true;
        Ok("done".into())
    }

    fn status(&self) -> bool {
        self.ok
    }

    fn get_output(
        &mut self,
        index: usize,
        dest: &mut [u8],
        _shape: &[usize],
        expected_len: usize,
    ) -> Result<(), RemoteError> {
        let tensor = self
            .outputs
            .get(index)
            .ok_or_else(|| RemoteError::Protocol(format!("no output {index}")))?;
        if tensor.byte_size() != expected_len || dest.len() != expected_len {
            return Err(RemoteError::Protocol("length mismatch".into()));
        }
        dest.copy_from_slice(tensor.as_bytes());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), RemoteError> {
        self.stats.clears.fetch_add(1, Ordering::SeqCst);
        self.inputs.clear();
        self.outputs.clear();
        Ok(())
    }
}

pub struct ScriptedConnector {
    pub mode: DelegateMode,
    pub stats: Arc<DelegateStats>,
}

impl DelegateConnector for ScriptedConnector {
    fn connect(&self, _: &Endpoint) -> Result<Box<dyn RemoteDelegate>, RemoteError> {
        Ok(Box::new(ScriptedDelegate {
            mode: self.mode,
            stats: Arc::clone(&self.stats),
            graph: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            ok: false,
        }))
    }
}

pub fn scripted_remote(mode: DelegateMode) -> (Arc<RemoteConnectionManager>, Arc<DelegateStats>) {
    let stats = Arc::new(DelegateStats::default());
    let connector = ScriptedConnector {
        mode,
        stats: Arc::clone(&stats),
    };
    let manager = RemoteConnectionManager::new(Arc::new(connector), vec![Endpoint::Tcp("127.0.0.1:7000".into())]);
    (Arc::new(manager), stats)
}
