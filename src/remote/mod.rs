//! Remote delegate routing.
//!
//! A [`RemoteConnectionManager`] connects to a delegate once and hands out a
//! locked session per request. [`StreamDelegate`] speaks a length-prefixed
//! JSON-header protocol over TCP or Unix sockets.

mod delegate;
mod manager;
mod stream;

pub use delegate::{DelegateConnector, Endpoint, RemoteDelegate, RemoteError};
pub use manager::{RemoteConnectionManager, RemoteSession};
pub use stream::{
    read_frame, write_frame, DelegateReply, DelegateRequest, StreamConnector, StreamDelegate,
    DEFAULT_FRAME_LIMIT,
};
