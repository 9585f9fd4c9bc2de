//! Execution dispatcher.
//!
//! [`PreparedModel`] serves synchronous, asynchronous and fenced requests
//! against one compiled graph. Requests are validated against the model
//! signature, marshaled through caller-supplied memory pools and run either
//! on the remote delegate or locally.

mod fence;
mod marshal;
mod prepared;
mod request;
mod state;
mod status;
mod worker;

pub use fence::{Fence, SyncFence};
pub use marshal::{MarshalError, ScalarShapePolicy};
pub use prepared::{
    DispatchEnv, ExecutionCallback, ExecutionHandle, FencedExecution, FencedExecutionCallback,
    PrepareError, PreparedModel,
};
pub use request::{validate_request, Request, RequestArgument, RequestError};
pub use state::RequestState;
pub use status::{ErrorStatus, ExecutionResult, OutputShape, Timing};
pub use worker::{Job, WorkerPool, WorkerPoolConfig, WorkerPoolError};
