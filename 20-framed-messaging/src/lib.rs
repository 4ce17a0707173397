//! Bidirectional TCP messaging over typed, length-framed binary messages.
//!
//! Applications plug a handler into a [`Client`] or a [`Server`] and exchange
//! [`Message`]s whose kinds come from an application-defined enum. Each
//! module focuses on one concern:
//!
//! - [`message`] defines the frame header and stack-discipline body packing.
//! - [`queue`] provides the mutex-guarded FIFO behind every inbound and
//!   outbound queue.
//! - [`connection`] owns one socket and the thread that moves frames between
//!   it and the queues, and announces peer loss.
//! - [`client`] holds at most one connection and a watcher thread that reacts
//!   when the server goes away.
//! - [`server`] accepts connections into an id-keyed registry and reaps the
//!   ones that close.
//! - [`config`] and [`error`] hold the builder-style settings and error types.
//! - [`chat`] is the demo relay protocol used by the binary, and [`cli`]
//!   parses its command line.
//!
//! # Threading
//!
//! Every connection runs its own I/O thread. A server adds a listener thread
//! and a reaper thread; a client adds a watcher thread. Inbound messages are
//! only dispatched when the application calls `process_message`, on whatever
//! thread it likes. Handler callbacks are serialized behind one mutex per
//! client or server, so they never run concurrently with each other.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod chat;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod queue;
pub mod server;

pub use client::{Client, ClientHandle, ClientHandler};
pub use config::{ClientConfig, IoConfig, ServerConfig};
pub use connection::{Connection, ConnectionId, Role};
pub use error::{Error, Result, WireError};
pub use message::{Header, Message, MessageKind, OwnedMessage, WireValue};
pub use queue::MessageQueue;
pub use server::{Server, ServerHandle, ServerHandler};

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
