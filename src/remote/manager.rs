//! One delegate connection, established once and shared by every request.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::delegate::{DelegateConnector, Endpoint, RemoteDelegate};
use super::stream::StreamConnector;
use crate::config::RemoteConfig;

struct DelegateSlot {
    delegate: Box<dyn RemoteDelegate>,
    /// Id of the model last uploaded.
    loaded: Option<u64>,
}

/// Owns the delegate connection.
///
/// The first call to [`connect`](Self::connect) tries each endpoint in order and
/// keeps the first one whose handshake succeeds. The outcome is fixed for the
/// manager's lifetime: a failed attempt is never retried, and a delegate that
/// fails to load a model stays disabled.
pub struct RemoteConnectionManager {
    connector: Option<Arc<dyn DelegateConnector>>,
    endpoints: Vec<Endpoint>,
    slot: OnceLock<Option<Mutex<DelegateSlot>>>,
    enabled: AtomicBool,
}

impl std::fmt::Debug for RemoteConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnectionManager")
            .field("endpoints", &self.endpoints)
            .field("attempted", &self.slot.get().is_some())
            .field("available", &self.is_available())
            .finish()
    }
}

impl RemoteConnectionManager {
    pub fn new(connector: Arc<dyn DelegateConnector>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            connector: Some(connector),
            endpoints,
            slot: OnceLock::new(),
            enabled: AtomicBool::new(true),
        }
    }

    /// A manager that never routes remotely.
    pub fn disabled() -> Self {
        Self {
            connector: None,
            endpoints: Vec::new(),
            slot: OnceLock::new(),
            enabled: AtomicBool::new(false),
        }
    }

    /// Stream transport to the configured TCP address, then Unix socket.
    pub fn from_config(config: &RemoteConfig) -> Self {
        let mut endpoints = Vec::new();
        if let Some(addr) = &config.tcp_address {
            endpoints.push(Endpoint::Tcp(addr.clone()));
        }
        if let Some(path) = &config.socket_path {
            endpoints.push(Endpoint::Unix(path.clone()));
        }
        if endpoints.is_empty() {
            return Self::disabled();
        }
        let connector = StreamConnector::new(
            Duration::from_millis(config.timeout_ms),
            config.frame_limit,
        );
        Self::new(Arc::new(connector), endpoints)
    }

    /// Connect on first call; later calls return the cached outcome.
    pub fn connect(&self) -> bool {
        self.slot.get_or_init(|| self.connect_first()).is_some() && self.is_available()
    }

    fn connect_first(&self) -> Option<Mutex<DelegateSlot>> {
        let connector = self.connector.as_ref()?;
        for endpoint in &self.endpoints {
            let mut delegate = match connector.connect(endpoint) {
                Ok(delegate) => delegate,
                Err(e) => {
                    debug!(%endpoint, error = %e, "Remote endpoint unreachable");
                    continue;
                }
            };
            match delegate.prepare() {
                Ok(reply) => {
                    info!(%endpoint, reply = %reply, "Remote delegate connected");
                    return Some(Mutex::new(DelegateSlot {
                        delegate,
                        loaded: None,
                    }));
                }
                Err(e) => debug!(%endpoint, error = %e, "Remote handshake failed"),
            }
        }
        info!("Remote delegate unavailable, using local inference only");
        None
    }

    /// True once a connection succeeded and no model upload has failed.
    pub fn is_available(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && matches!(self.slot.get(), Some(Some(_)))
    }

    /// Upload a model under `model_id`. Failure disables remote routing.
    pub fn load_model(&self, model_id: u64, graph: &[u8], weights: &[u8]) -> bool {
        let Some(mut session) = self.lock() else {
            return false;
        };
        session.ensure_model(model_id, graph, weights)
    }

    /// Exclusive access to the delegate, if remote routing is available.
    pub fn lock(&self) -> Option<RemoteSession<'_>> {
        if !self.is_available() {
            return None;
        }
        let slot = self.slot.get()?.as_ref()?;
        Some(RemoteSession {
            guard: slot.lock(),
            enabled: &self.enabled,
        })
    }
}

/// A locked delegate. Held for the bind, run and read span of one request.
pub struct RemoteSession<'a> {
    guard: MutexGuard<'a, DelegateSlot>,
    enabled: &'a AtomicBool,
}

impl RemoteSession<'_> {
    /// Make `model_id` the delegate's current model, uploading it if needed.
    pub fn ensure_model(&mut self, model_id: u64, graph: &[u8], weights: &[u8]) -> bool {
        if self.guard.loaded == Some(model_id) {
            return true;
        }
        match self.guard.delegate.send_model(graph, weights) {
            Ok(()) => {
                debug!(model_id, graph_bytes = graph.len(), weights_bytes = weights.len(), "Remote model loaded");
                self.guard.loaded = Some(model_id);
                true
            }
            Err(e) => {
                warn!(model_id, error = %e, "Remote model load failed, disabling remote inference");
                self.guard.loaded = None;
                self.enabled.store(false, Ordering::Release);
                false
            }
        }
    }
}

impl Deref for RemoteSession<'_> {
    type Target = dyn RemoteDelegate;

    fn deref(&self) -> &Self::Target {
        self.guard.delegate.as_ref()
    }
}

impl DerefMut for RemoteSession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.delegate.as_mut()
    }
}
