//! A compiled model ready to serve execution requests.
//!
//! Each request runs the same dispatch path whether it arrives
//! synchronously, through the worker pool or behind fences:
//! map pools, check out an inference context, bind inputs, infer remotely or
//! locally, copy outputs back, flush pools and report once.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn, Span};

use super::fence::SyncFence;
use super::marshal::{read_argument, write_argument, ScalarShapePolicy};
use super::request::{validate_request, Request, RequestError};
use super::state::{RequestState, StateTracker};
use super::status::{ErrorStatus, ExecutionResult, OutputShape, Timing};
use super::worker::{panic_message, WorkerPool};
use crate::backend::{BackendError, CompiledGraph, ContextPool, Executor, HostTensor, InferenceContext};
use crate::compile::BuiltNetwork;
use crate::memory::MappedPool;
use crate::model::Model;
use crate::remote::{RemoteConnectionManager, RemoteError, RemoteSession};
use crate::telemetry::{ExecutionSpan, SpanExt};
use crate::translate::BuildError;

/// Receives the result of an asynchronous execution, exactly once.
pub trait ExecutionCallback: Send + Sync {
    fn notify(&self, result: &ExecutionResult);
}

impl<F> ExecutionCallback for F
where
    F: Fn(&ExecutionResult) + Send + Sync,
{
    fn notify(&self, result: &ExecutionResult) {
        self(result)
    }
}

#[derive(Error, Debug)]
pub enum PrepareError {
    #[error("Graph build failed: {0}")]
    Build(#[from] BuildError),
}

/// Shared services a prepared model dispatches through.
#[derive(Clone)]
pub struct DispatchEnv {
    pub executor: Arc<dyn Executor>,
    pub remote: Arc<RemoteConnectionManager>,
    pub workers: Arc<WorkerPool>,
    pub inference_contexts: usize,
    pub scalar_shape: ScalarShapePolicy,
}

pub struct PreparedModel {
    id: u64,
    model: Arc<Model>,
    input_bindings: Vec<bool>,
    output_bindings: Vec<bool>,
    compiled: CompiledGraph,
    contexts: ContextPool,
    remote: Arc<RemoteConnectionManager>,
    /// Exported graph and weights, kept while remote routing is possible.
    remote_blobs: Option<(Vec<u8>, Vec<u8>)>,
    workers: Arc<WorkerPool>,
    scalar_shape: ScalarShapePolicy,
}

impl std::fmt::Debug for PreparedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedModel")
            .field("id", &self.id)
            .field("compiled", &self.compiled)
            .field("contexts", &self.contexts.capacity())
            .field("remote", &self.remote_blobs.is_some())
            .finish()
    }
}

/// Outputs produced by the delegate, in compiled-output order.
type RemoteOutputs = Vec<HostTensor>;

impl PreparedModel {
    /// Wrap a built network. Connects to the remote delegate and uploads the
    /// model to it when one is reachable.
    pub fn prepare(id: u64, model: Arc<Model>, network: BuiltNetwork, env: DispatchEnv) -> Arc<Self> {
        let BuiltNetwork {
            graph,
            input_bindings,
            output_bindings,
            ..
        } = network;
        let compiled = CompiledGraph::new(graph, Arc::clone(&env.executor));
        let contexts = ContextPool::new(&compiled, env.inference_contexts);

        let remote_blobs = if env.remote.connect() {
            match compiled.export() {
                Ok((graph, weights)) if env.remote.load_model(id, &graph, &weights) => Some((graph, weights)),
                Ok(_) => None,
                Err(e) => {
                    warn!(model_id = id, error = %e, "Graph export failed, remote inference skipped");
                    None
                }
            }
        } else {
            None
        };

        info!(
            model_id = id,
            inputs = compiled.input_count(),
            outputs = compiled.output_count(),
            contexts = contexts.capacity(),
            executor = compiled.executor_name(),
            remote = remote_blobs.is_some(),
            "Model prepared"
        );
        Arc::new(Self {
            id,
            model,
            input_bindings,
            output_bindings,
            compiled,
            contexts,
            remote: env.remote,
            remote_blobs,
            workers: env.workers,
            scalar_shape: env.scalar_shape,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn compiled(&self) -> &CompiledGraph {
        &self.compiled
    }

    pub fn input_bindings(&self) -> &[bool] {
        &self.input_bindings
    }

    pub fn output_bindings(&self) -> &[bool] {
        &self.output_bindings
    }

    /// Run a request on the calling thread.
    pub fn execute_sync(&self, request: Request) -> ExecutionResult {
        let span = ExecutionSpan::new(self.id, "sync");
        let _entered = span.enter();
        let mut tracker = StateTracker::new();
        if let Err(e) = self.validate(&request) {
            return self.reject(&span, &mut tracker, e);
        }
        tracker.advance(RequestState::Validated);
        let result = self.dispatch(&request, &mut tracker);
        record(&span, &result);
        result
    }

    /// Validate, then run the request on the worker pool.
    ///
    /// The callback, if any, and the returned handle both receive the
    /// result. A missing callback is an invalid argument.
    pub fn execute_async(
        self: &Arc<Self>,
        request: Request,
        callback: Option<Arc<dyn ExecutionCallback>>,
    ) -> ExecutionHandle {
        let span = ExecutionSpan::new(self.id, "async");
        let (tx, rx) = oneshot::channel();
        let handle = ExecutionHandle { rx };

        let mut tracker = StateTracker::new();
        let Some(callback) = callback else {
            let _entered = span.enter();
            let result = self.reject(&span, &mut tracker, RequestError::MissingCallback);
            let _ = tx.send(result);
            return handle;
        };
        if let Err(e) = self.validate(&request) {
            let _entered = span.enter();
            let result = self.reject(&span, &mut tracker, e);
            callback.notify(&result);
            let _ = tx.send(result);
            return handle;
        }
        tracker.advance(RequestState::Validated);

        // The job carries its own result path so a rejected submission can
        // still report through the callback below.
        let slot = Arc::new(parking_lot::Mutex::new(Some((tx, Arc::clone(&callback)))));
        let job = {
            let this = Arc::clone(self);
            let slot = Arc::clone(&slot);
            let span = span.clone();
            Box::new(move || {
                let _entered = span.enter();
                let result = this.dispatch(&request, &mut tracker);
                record(&span, &result);
                if let Some((tx, callback)) = slot.lock().take() {
                    callback.notify(&result);
                    let _ = tx.send(result);
                }
            })
        };
        if let Err(e) = self.workers.submit(job) {
            let _entered = span.enter();
            warn!(error = %e, "Asynchronous execution not accepted");
            let result = ExecutionResult::failed(ErrorStatus::GeneralFailure);
            record(&span, &result);
            if let Some((tx, callback)) = slot.lock().take() {
                callback.notify(&result);
                let _ = tx.send(result);
            }
        }
        handle
    }

    /// Wait on the request's fences, then run it on the calling thread.
    ///
    /// A deadline that has passed, before or after the wait, or a failed
    /// fence ends the request with `MissedDeadlinePersistent` before the
    /// model is touched.
    pub fn execute_fenced(&self, request: Request) -> FencedExecution {
        let launched = Instant::now();
        let span = ExecutionSpan::new(self.id, "fenced");
        let _entered = span.enter();
        let mut tracker = StateTracker::new();

        if let Err(e) = self.validate(&request) {
            let result = self.reject(&span, &mut tracker, e);
            return FencedExecution::finished(result.status, Vec::new(), Timing::NONE, Timing::NONE);
        }
        tracker.advance(RequestState::Validated);

        let missed = |tracker: &mut StateTracker, why: &str| {
            warn!(reason = why, "Fenced execution abandoned");
            let status = tracker.fail(ErrorStatus::MissedDeadlinePersistent);
            record(&span, &ExecutionResult::failed(status));
            FencedExecution::finished(status, Vec::new(), Timing::NONE, Timing::NONE)
        };
        if deadline_passed(request.deadline) {
            return missed(&mut tracker, "deadline passed before fences");
        }
        for (i, fence) in request.wait_for.iter().enumerate() {
            if !fence.wait() {
                debug!(fence = i, "Fence signaled failure");
                return missed(&mut tracker, "fence failed");
            }
        }
        if deadline_passed(request.deadline) {
            return missed(&mut tracker, "deadline passed after fences");
        }
        let fenced = Instant::now();

        let result = self.dispatch(&request, &mut tracker);
        record(&span, &result);
        let (since_launch, since_fenced) = if request.measure && result.timing.is_measured() {
            let device = Duration::from_micros(result.timing.time_on_device);
            (
                Timing::from_durations(device, launched.elapsed()),
                Timing::from_durations(device, fenced.elapsed()),
            )
        } else {
            (Timing::NONE, Timing::NONE)
        };
        FencedExecution::finished(result.status, result.output_shapes, since_launch, since_fenced)
    }

    fn validate(&self, request: &Request) -> Result<(), RequestError> {
        validate_request(request, &self.model)
    }

    fn reject(&self, span: &Span, tracker: &mut StateTracker, error: RequestError) -> ExecutionResult {
        warn!(error = %error, "Request rejected");
        let result = ExecutionResult::failed(tracker.fail(ErrorStatus::InvalidArgument));
        record(span, &result);
        result
    }

    /// Everything after validation. A panic below this point, from the
    /// executor or a delegate, ends the request with `GeneralFailure`.
    fn dispatch(&self, request: &Request, tracker: &mut StateTracker) -> ExecutionResult {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run(request, tracker))) {
            Ok(result) => result,
            Err(payload) => {
                warn!(panic = panic_message(payload.as_ref()), "Dispatch panicked");
                if tracker.state().is_terminal() {
                    return ExecutionResult::failed(ErrorStatus::GeneralFailure);
                }
                ExecutionResult::failed(tracker.fail(ErrorStatus::GeneralFailure))
            }
        }
    }

    fn run(&self, request: &Request, tracker: &mut StateTracker) -> ExecutionResult {
        let started = Instant::now();

        let mut pools: Vec<Box<dyn MappedPool>> = Vec::with_capacity(request.pools.len());
        for (index, pool) in request.pools.iter().enumerate() {
            match pool.map() {
                Ok(mapped) => pools.push(mapped),
                Err(e) => {
                    warn!(pool = index, error = %e, "Pool mapping failed");
                    return ExecutionResult::failed(tracker.fail(ErrorStatus::GeneralFailure));
                }
            }
        }
        tracker.advance(RequestState::PoolsMapped);

        let mut context = self.contexts.checkout();
        let mut session = self.remote_session();

        if let Err(status) = self.bind_inputs(request, &pools, &mut context) {
            return ExecutionResult::failed(tracker.fail(status));
        }
        tracker.advance(RequestState::InputsMarshaled);

        let device_started = Instant::now();
        let remote_outputs = match session.as_mut() {
            Some(session) => {
                tracker.advance(RequestState::RemoteInfer);
                self.infer_remote(session, &context)
            }
            None => None,
        };
        if remote_outputs.is_none() {
            tracker.advance(RequestState::LocalInfer);
            if let Err(e) = context.infer() {
                warn!(error = %e, "Inference failed");
                clear_remote(session.as_mut());
                return ExecutionResult::failed(tracker.fail(ErrorStatus::GeneralFailure));
            }
        }
        let device = device_started.elapsed();

        let (status, output_shapes) = self.copy_outputs(request, &mut pools, &context, remote_outputs.as_deref());
        clear_remote(session.as_mut());
        drop(session);
        drop(context);

        for (index, pool) in pools.iter_mut().enumerate() {
            if let Err(e) = pool.flush() {
                warn!(pool = index, error = %e, "Pool flush failed after execution");
            }
        }

        if status != ErrorStatus::None {
            tracker.fail(status);
            return ExecutionResult {
                status,
                output_shapes,
                timing: Timing::NONE,
            };
        }
        tracker.advance(RequestState::OutputsMarshaled);
        drop(pools);
        tracker.advance(RequestState::PoolsUnmapped);
        tracker.advance(RequestState::Completed);

        let timing = if request.measure {
            Timing::from_durations(device, started.elapsed())
        } else {
            Timing::NONE
        };
        ExecutionResult {
            status: ErrorStatus::None,
            output_shapes,
            timing,
        }
    }

    /// The locked delegate with this model loaded, if remote routing applies.
    fn remote_session(&self) -> Option<RemoteSession<'_>> {
        let (graph, weights) = self.remote_blobs.as_ref()?;
        let mut session = self.remote.lock()?;
        session.ensure_model(self.id, graph, weights).then_some(session)
    }

    /// Copy each bound input into the next compiled input tensor.
    fn bind_inputs(
        &self,
        request: &Request,
        pools: &[Box<dyn MappedPool>],
        context: &mut InferenceContext,
    ) -> Result<(), ErrorStatus> {
        let bound = request
            .inputs
            .iter()
            .zip(&self.input_bindings)
            .filter_map(|(arg, &bound)| bound.then_some(arg));
        for (slot, arg) in bound.enumerate() {
            let tensor = context.input_tensor_mut(slot).map_err(|e| {
                warn!(input = slot, error = %e, "Input tensor unavailable");
                ErrorStatus::GeneralFailure
            })?;
            read_argument(pools, arg, tensor.as_bytes_mut()).map_err(|e| {
                warn!(input = slot, error = %e, "Input marshaling failed");
                ErrorStatus::GeneralFailure
            })?;
        }
        Ok(())
    }

    /// Forward the bound inputs, run and fetch every output. `None` sends
    /// the request to local inference.
    fn infer_remote(&self, session: &mut RemoteSession<'_>, context: &InferenceContext) -> Option<RemoteOutputs> {
        match self.try_infer_remote(session, context) {
            Ok(Some(outputs)) => Some(outputs),
            Ok(None) => {
                info!("Remote inference reported failure, running locally");
                None
            }
            Err(e) => {
                warn!(error = %e, "Remote inference failed, running locally");
                None
            }
        }
    }

    fn try_infer_remote(
        &self,
        session: &mut RemoteSession<'_>,
        context: &InferenceContext,
    ) -> Result<Option<RemoteOutputs>, RemoteError> {
        for index in 0..context.input_count() {
            let tensor = context
                .input_tensor(index)
                .map_err(|e| RemoteError::Protocol(e.to_string()))?;
            session.add_input(index, tensor.as_bytes(), tensor.shape(), tensor.element_type())?;
        }
        let reply = session.run_inference()?;
        debug!(reply = %reply, "Remote inference finished");
        if !session.status() {
            return Ok(None);
        }

        let mut outputs = Vec::with_capacity(self.compiled.output_count());
        for index in 0..self.compiled.output_count() {
            let desc = self
                .compiled
                .output_desc(index)
                .ok_or_else(|| RemoteError::Protocol(format!("no output {index}")))?;
            let expected_len = desc.byte_size();
            let mut bytes = vec![0u8; expected_len];
            session.get_output(index, &mut bytes, &desc.shape, expected_len)?;
            let tensor = HostTensor::from_bytes(desc.element_type, &desc.shape, bytes)
                .ok_or_else(|| RemoteError::Protocol(format!("output {index} has the wrong length")))?;
            outputs.push(tensor);
        }
        Ok(Some(outputs))
    }

    /// Copy produced outputs back to the request, stopping at the first
    /// argument that cannot hold its output.
    fn copy_outputs(
        &self,
        request: &Request,
        pools: &mut [Box<dyn MappedPool>],
        context: &InferenceContext,
        remote: Option<&[HostTensor]>,
    ) -> (ErrorStatus, Vec<OutputShape>) {
        let declared = |i: usize| {
            self.model
                .model_output(i)
                .and_then(|id| self.model.dimensions(id).ok())
                .map(<[u32]>::to_vec)
                .unwrap_or_default()
        };

        let mut shapes = Vec::with_capacity(request.outputs.len());
        let mut slot = 0;
        for (index, (arg, &bound)) in request.outputs.iter().zip(&self.output_bindings).enumerate() {
            if !bound {
                debug!(output = index, "Output has no graph result");
                shapes.push(OutputShape::new(declared(index), true));
                continue;
            }
            let produced = match remote {
                Some(outputs) => outputs.get(slot).ok_or(BackendError::TensorUnavailable { index: slot }),
                None => context.output_tensor(slot),
            };
            slot += 1;
            let tensor = match produced {
                Ok(tensor) => tensor,
                Err(e) => {
                    warn!(output = index, error = %e, "Output tensor unavailable");
                    return (ErrorStatus::GeneralFailure, shapes);
                }
            };

            let dimensions = self.scalar_shape.report(tensor.shape(), tensor.byte_size());
            if arg.has_no_value {
                shapes.push(OutputShape::new(dimensions, true));
                continue;
            }
            if tensor.byte_size() != arg.length as usize {
                warn!(
                    output = index,
                    produced = tensor.byte_size(),
                    provided = arg.length,
                    "Output buffer size mismatch"
                );
                shapes.push(OutputShape::new(dimensions, false));
                shapes.extend((index + 1..request.outputs.len()).map(|i| OutputShape::new(declared(i), true)));
                return (ErrorStatus::OutputInsufficientSize, shapes);
            }
            if let Err(e) = write_argument(pools, arg, tensor.as_bytes()) {
                warn!(output = index, error = %e, "Output marshaling failed");
                return (ErrorStatus::GeneralFailure, shapes);
            }
            shapes.push(OutputShape::new(dimensions, true));
        }
        (ErrorStatus::None, shapes)
    }
}

fn clear_remote(session: Option<&mut RemoteSession<'_>>) {
    if let Some(session) = session {
        if let Err(e) = session.clear() {
            debug!(error = %e, "Remote clear failed");
        }
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn record(span: &Span, result: &ExecutionResult) {
    if result.status.is_ok() {
        span.record_result(&Ok::<(), ErrorStatus>(()));
    } else {
        span.record_result(&Err::<(), ErrorStatus>(result.status));
    }
    if result.timing.is_measured() {
        span.record_timing(
            Duration::from_micros(result.timing.time_on_device),
            Duration::from_micros(result.timing.time_in_driver),
        );
    }
}

/// Result channel of an asynchronous execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    rx: oneshot::Receiver<ExecutionResult>,
}

impl ExecutionHandle {
    /// Block until the result arrives. Must not be called from inside an
    /// async runtime; use [`result`](Self::result) there.
    pub fn wait(self) -> ExecutionResult {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| ExecutionResult::failed(ErrorStatus::GeneralFailure))
    }

    pub async fn result(self) -> ExecutionResult {
        self.rx
            .await
            .unwrap_or_else(|_| ExecutionResult::failed(ErrorStatus::GeneralFailure))
    }
}

/// Status and timings of a fenced execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FencedExecutionCallback {
    status: ErrorStatus,
    timing_launched: Timing,
    timing_fenced: Timing,
}

impl FencedExecutionCallback {
    /// Status, timing since launch, timing since the fences were satisfied.
    pub fn execution_info(&self) -> (ErrorStatus, Timing, Timing) {
        (self.status, self.timing_launched, self.timing_fenced)
    }
}

/// Handle returned by [`PreparedModel::execute_fenced`].
#[derive(Debug)]
pub struct FencedExecution {
    /// Signaled when execution finished; `false` on failure.
    pub fence: Arc<SyncFence>,
    pub callback: FencedExecutionCallback,
    pub output_shapes: Vec<OutputShape>,
}

impl FencedExecution {
    fn finished(status: ErrorStatus, output_shapes: Vec<OutputShape>, launched: Timing, fenced: Timing) -> Self {
        Self {
            fence: Arc::new(SyncFence::signaled(status.is_ok())),
            callback: FencedExecutionCallback {
                status,
                timing_launched: launched,
                timing_fenced: fenced,
            },
            output_shapes,
        }
    }

    pub fn status(&self) -> ErrorStatus {
        self.callback.status
    }
}
