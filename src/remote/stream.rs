//! Length-prefixed stream transport for remote delegates.
//!
//! Frame: `[u32 le header len][JSON header][u32 le payload len][payload]`.
//! Every request is answered by one [`DelegateReply`] frame.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::delegate::{DelegateConnector, Endpoint, RemoteDelegate, RemoteError};
use crate::backend::ElementType;

/// Largest header or payload accepted by default (256 MB).
pub const DEFAULT_FRAME_LIMIT: usize = 256 * 1024 * 1024;

/// Request header. Bulk data travels in the frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DelegateRequest {
    Prepare,
    /// Payload: graph blob followed by weights.
    SendModel { graph_len: usize },
    /// Payload: input bytes.
    AddInput {
        index: usize,
        shape: Vec<usize>,
        element_type: ElementType,
    },
    RunInference,
    GetOutput {
        index: usize,
        shape: Vec<usize>,
        expected_len: usize,
    },
    Clear,
}

impl DelegateRequest {
    fn name(&self) -> &'static str {
        match self {
            DelegateRequest::Prepare => "prepare",
            DelegateRequest::SendModel { .. } => "send_model",
            DelegateRequest::AddInput { .. } => "add_input",
            DelegateRequest::RunInference => "run_inference",
            DelegateRequest::GetOutput { .. } => "get_output",
            DelegateRequest::Clear => "clear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

fn read_len(reader: &mut impl Read, limit: usize) -> Result<usize, RemoteError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > limit {
        return Err(RemoteError::FrameTooLarge { size: len, limit });
    }
    Ok(len)
}

fn write_len(writer: &mut impl Write, len: usize) -> Result<(), RemoteError> {
    let len = u32::try_from(len).map_err(|_| RemoteError::FrameTooLarge {
        size: len,
        limit: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_le_bytes())?;
    Ok(())
}

/// Write one frame.
pub fn write_frame<H: Serialize>(writer: &mut impl Write, header: &H, payload: &[u8]) -> Result<(), RemoteError> {
    let header = serde_json::to_vec(header)?;
    write_len(writer, header.len())?;
    writer.write_all(&header)?;
    write_len(writer, payload.len())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Lengths are checked against `limit` before allocating.
pub fn read_frame<H: for<'de> Deserialize<'de>>(
    reader: &mut impl Read,
    limit: usize,
) -> Result<(H, Vec<u8>), RemoteError> {
    let len = read_len(reader, limit)?;
    let mut header = vec![0u8; len];
    reader.read_exact(&mut header)?;
    let header = serde_json::from_slice(&header)?;
    let len = read_len(reader, limit)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok((header, payload))
}

pub(crate) trait Stream: Read + Write + Send {}

impl<T: Read + Write + Send> Stream for T {}

/// Delegate client over any byte stream.
pub struct StreamDelegate {
    stream: Box<dyn Stream>,
    frame_limit: usize,
    last_status: bool,
    /// Set by the first transport failure. The stream may then be part way
    /// through a frame, so every later call fails without touching it.
    broken: bool,
}

impl StreamDelegate {
    pub fn new<S: Read + Write + Send + 'static>(stream: S, frame_limit: usize) -> Self {
        Self {
            stream: Box::new(stream),
            frame_limit,
            last_status: false,
            broken: false,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn call(&mut self, request: &DelegateRequest, payload: &[u8]) -> Result<(DelegateReply, Vec<u8>), RemoteError> {
        if self.broken {
            return Err(RemoteError::Unavailable(format!(
                "{} skipped: stream lost frame sync",
                request.name()
            )));
        }
        trace!(op = request.name(), payload = payload.len(), "Delegate request");
        let exchanged = write_frame(&mut self.stream, request, payload)
            .and_then(|()| read_frame(&mut self.stream, self.frame_limit));
        if let Err(e) = &exchanged {
            warn!(op = request.name(), error = %e, "Delegate stream failed, disabling it");
            self.broken = true;
        }
        exchanged
    }

    /// Call and require `success`.
    fn expect(&mut self, request: &DelegateRequest, payload: &[u8]) -> Result<(DelegateReply, Vec<u8>), RemoteError> {
        let (reply, data) = self.call(request, payload)?;
        if !reply.success {
            return Err(RemoteError::Rejected {
                operation: request.name(),
                message: reply.message,
            });
        }
        Ok((reply, data))
    }
}

impl RemoteDelegate for StreamDelegate {
    fn prepare(&mut self) -> Result<String, RemoteError> {
        let (reply, _) = self.expect(&DelegateRequest::Prepare, &[])?;
        Ok(reply.message)
    }

    fn send_model(&mut self, graph: &[u8], weights: &[u8]) -> Result<(), RemoteError> {
        let mut payload = Vec::with_capacity(graph.len() + weights.len());
        payload.extend_from_slice(graph);
        payload.extend_from_slice(weights);
        let request = DelegateRequest::SendModel {
            graph_len: graph.len(),
        };
        self.expect(&request, &payload)?;
        Ok(())
    }

    fn add_input(
        &mut self,
        index: usize,
        data: &[u8],
        shape: &[usize],
        element_type: ElementType,
    ) -> Result<(), RemoteError> {
        let request = DelegateRequest::AddInput {
            index,
            shape: shape.to_vec(),
            element_type,
        };
        self.expect(&request, data)?;
        Ok(())
    }

    fn run_inference(&mut self) -> Result<String, RemoteError> {
        let (reply, _) = self.call(&DelegateRequest::RunInference, &[])?;
        self.last_status = reply.success;
        Ok(reply.message)
    }

    fn status(&self) -> bool {
        self.last_status
    }

    fn get_output(
        &mut self,
        index: usize,
        dest: &mut [u8],
        shape: &[usize],
        expected_len: usize,
    ) -> Result<(), RemoteError> {
        let request = DelegateRequest::GetOutput {
            index,
            shape: shape.to_vec(),
            expected_len,
        };
        let (_, data) = self.expect(&request, &[])?;
        if data.len() != expected_len || dest.len() < expected_len {
            return Err(RemoteError::Protocol(format!(
                "output {index}: got {} bytes, expected {expected_len}",
                data.len()
            )));
        }
        dest[..expected_len].copy_from_slice(&data);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), RemoteError> {
        self.last_status = false;
        self.expect(&DelegateRequest::Clear, &[])?;
        Ok(())
    }
}

/// Connects [`StreamDelegate`]s with an I/O timeout.
#[derive(Debug, Clone)]
pub struct StreamConnector {
    timeout: Duration,
    frame_limit: usize,
}

impl StreamConnector {
    pub fn new(timeout: Duration, frame_limit: usize) -> Self {
        Self {
            timeout,
            frame_limit,
        }
    }

    fn tcp(&self, addr: &str) -> Result<Box<dyn RemoteDelegate>, RemoteError> {
        let target = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RemoteError::Unavailable(format!("{addr} did not resolve")))?;
        let stream = TcpStream::connect_timeout(&target, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(StreamDelegate::new(stream, self.frame_limit)))
    }

    #[cfg(unix)]
    fn unix(&self, path: &std::path::Path) -> Result<Box<dyn RemoteDelegate>, RemoteError> {
        let stream = std::os::unix::net::UnixStream::connect(path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(Box::new(StreamDelegate::new(stream, self.frame_limit)))
    }

    #[cfg(not(unix))]
    fn unix(&self, path: &std::path::Path) -> Result<Box<dyn RemoteDelegate>, RemoteError> {
        Err(RemoteError::Unavailable(format!(
            "unix sockets unsupported on this platform: {}",
            path.display()
        )))
    }
}

impl Default for StreamConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), DEFAULT_FRAME_LIMIT)
    }
}

impl DelegateConnector for StreamConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn RemoteDelegate>, RemoteError> {
        match endpoint {
            Endpoint::Tcp(addr) => self.tcp(addr),
            Endpoint::Unix(path) => self.unix(path),
        }
    }
}
