//! Error types shared by the wire codec, connections, clients and servers.

use std::io;

use thiserror::Error;

/// Result type for client and server setup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while packing or unpacking a message body or frame header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// A pop asked for more bytes than the body holds.
    #[error("body underflow: need {needed} bytes, have {available}")]
    Underflow { needed: usize, available: usize },

    /// A popped string was not valid UTF-8.
    #[error("string field is not valid utf-8")]
    InvalidUtf8,

    /// The body is longer than the configured frame limit.
    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: u32 },

    /// The header carried a kind tag the application does not know.
    #[error("unknown message kind tag {0}")]
    UnknownKind(u32),
}

/// Setup errors for clients and servers.
///
/// These are the "fatal" tier: nothing is retried, and the demo binary exits
/// when it sees one. Steady-state I/O failures never surface here; they end
/// the affected connection and are reported through the handler callbacks.
#[derive(Debug, Error)]
pub enum Error {
    /// Host name resolution failed.
    #[error("cannot resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },

    /// Resolution succeeded but produced no usable address.
    #[error("no address found for {0}")]
    NoAddress(String),

    /// Binding the listening socket failed.
    #[error("cannot bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    /// Connecting to the server failed.
    #[error("cannot connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    /// `connect` was called on a client that already owns a connection.
    #[error("client is already connected")]
    AlreadyConnected,

    /// A worker thread could not be spawned.
    #[error("failed to spawn thread: {0}")]
    Spawn(io::Error),

    /// Any other socket error during setup.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Wire codec error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}
