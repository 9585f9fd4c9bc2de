use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::ElementType;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {size} bytes exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Delegate rejected {operation}: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },

    #[error("Endpoint unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Protocol(err.to_string())
    }
}

/// Where a delegate listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// An out-of-process executor that runs the same compiled graph.
///
/// Calls are made with the session lock held, one request at a time.
pub trait RemoteDelegate: Send {
    /// Handshake. Returns the delegate's reply text.
    fn prepare(&mut self) -> Result<String, RemoteError>;

    /// Upload an exported graph and its weights.
    fn send_model(&mut self, graph: &[u8], weights: &[u8]) -> Result<(), RemoteError>;

    fn add_input(
        &mut self,
        index: usize,
        data: &[u8],
        shape: &[usize],
        element_type: ElementType,
    ) -> Result<(), RemoteError>;

    /// Run with the staged inputs. Returns the delegate's reply text.
    fn run_inference(&mut self) -> Result<String, RemoteError>;

    /// Whether the last inference succeeded.
    fn status(&self) -> bool;

    /// Copy output `index` into `dest`, which holds `expected_len` bytes.
    fn get_output(
        &mut self,
        index: usize,
        dest: &mut [u8],
        shape: &[usize],
        expected_len: usize,
    ) -> Result<(), RemoteError>;

    /// Drop staged inputs and outputs.
    fn clear(&mut self) -> Result<(), RemoteError>;
}

/// Opens delegate connections.
pub trait DelegateConnector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn RemoteDelegate>, RemoteError>;
}
