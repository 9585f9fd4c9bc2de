//! NNRT CORE
//!
//! Compiles declarative tensor-operation models into executable graphs and
//! dispatches inference requests against them.
//!
//! # Pipeline
//!
//! - **Model**: typed operands and ordered operations ([`model`])
//! - **Translate**: one translator per operation kind ([`translate`])
//! - **Compile**: wire translators in declaration order ([`compile`])
//! - **Execute**: marshal requests, route local or remote, report ([`execution`])
//!
//! A [`Driver`] ties these together from a [`config::RuntimeConfig`].

pub mod backend;
pub mod compile;
pub mod config;
pub mod execution;
pub mod memory;
pub mod model;
pub mod remote;
pub mod telemetry;
pub mod translate;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use backend::{Executor, ReferenceExecutor};
use compile::NetworkCreator;
use config::RuntimeConfig;
use execution::{DispatchEnv, PrepareError, PreparedModel, WorkerPool, WorkerPoolError};
use model::Model;
use remote::RemoteConnectionManager;
use translate::TranslatorRegistry;

/// Entry point: capability queries and model preparation.
pub struct Driver {
    registry: TranslatorRegistry,
    env: DispatchEnv,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("registry", &self.registry)
            .field("executor", &self.env.executor.name())
            .field("remote", &self.env.remote)
            .field("workers", &self.env.workers)
            .finish()
    }
}

impl Driver {
    /// Standard translators, the reference executor and the configured remote endpoints.
    pub fn new(config: &RuntimeConfig) -> Result<Self, WorkerPoolError> {
        let remote = Arc::new(RemoteConnectionManager::from_config(&config.remote));
        Self::with_parts(
            config,
            TranslatorRegistry::standard(),
            Arc::new(ReferenceExecutor::new()),
            remote,
        )
    }

    pub fn with_parts(
        config: &RuntimeConfig,
        registry: TranslatorRegistry,
        executor: Arc<dyn Executor>,
        remote: Arc<RemoteConnectionManager>,
    ) -> Result<Self, WorkerPoolError> {
        let workers = Arc::new(WorkerPool::new(config.worker_pool.clone())?);
        info!(config = ?config.effective_config(), "Driver created");
        Ok(Self {
            registry,
            env: DispatchEnv {
                executor,
                remote,
                workers,
                inference_contexts: config.inference_contexts,
                scalar_shape: config.scalar_shape,
            },
            next_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &TranslatorRegistry {
        &self.registry
    }

    /// Per-operation support for `model`.
    pub fn supported_operations(&self, model: &Model) -> Vec<bool> {
        NetworkCreator::new(model, &self.registry).supported_operations()
    }

    /// Build the model's graph and make it ready for execution.
    pub fn prepare_model(&self, model: Arc<Model>) -> Result<Arc<PreparedModel>, PrepareError> {
        let network = {
            let creator = NetworkCreator::new(&model, &self.registry);
            creator.validate_operations()?;
            creator.build()?
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(model_id = id, operations = network.trace.len(), "Network ready");
        Ok(PreparedModel::prepare(id, model, network, self.env.clone()))
    }
}
