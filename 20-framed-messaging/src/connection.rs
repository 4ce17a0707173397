//! A single peer connection and the I/O thread that drives it.
//!
//! Each [`Connection`] owns one non-blocking socket and one thread. Every
//! iteration of that thread writes at most one queued outbound frame and then
//! tries to read one inbound frame:
//!
//! - an outbound frame is written completely (header, then body), retrying on
//!   would-block until every byte is out;
//! - a read that finds no data at a frame boundary yields to the next
//!   iteration, while a frame that has started arriving is read to completion;
//! - end-of-stream, a socket error, or a malformed header ends the connection.
//!
//! A connection being finished stops reading and flushes its queue, but gives
//! up on whatever is left once the peer has refused writes for longer than
//! [`IoConfig::drain_timeout`].
//!
//! When the thread notices the loss it flips `open` to false exactly once and
//! sends a [`Wakeup::ConnectionLost`] to the owner's watcher or reaper.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::IoConfig;
use crate::error::WireError;
use crate::message::{HEADER_LEN, Header, Message, MessageKind, OwnedMessage};
use crate::queue::MessageQueue;

/// Identifies a connection within one server. Clients use id 0.
pub type ConnectionId = u32;

/// Shared inbound queue every connection of one client or server feeds.
pub(crate) type Inbox<T> = Arc<MessageQueue<OwnedMessage<T>>>;

/// Which side of the link a connection lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Events that wake a client's watcher or a server's reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    ConnectionLost(ConnectionId),
    Shutdown,
}

/// Why an I/O loop stopped.
#[derive(Debug, Error)]
enum LinkError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("connection closed locally")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

struct State<T> {
    id: ConnectionId,
    role: Role,
    peer: SocketAddr,
    open: AtomicBool,
    /// Server connections only start reading once the handler admits them.
    reading: AtomicBool,
    /// Flush the outbound queue, then close without reading further.
    draining: AtomicBool,
    outbound: MessageQueue<Message<T>>,
}

impl<T> State<T> {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_reading(&self) -> bool {
        self.is_open() && self.reading.load(Ordering::Acquire) && !self.is_draining()
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

/// One open socket to a peer.
///
/// Dropping a connection closes it: the I/O thread is stopped and joined,
/// which releases the socket.
pub struct Connection<T> {
    state: Arc<State<T>>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: MessageKind> Connection<T> {
    /// Takes ownership of a connected socket and starts its I/O thread.
    ///
    /// Client connections read immediately; server connections wait for
    /// [`Connection::admit`].
    pub(crate) fn spawn(
        role: Role,
        id: ConnectionId,
        stream: TcpStream,
        inbox: Inbox<T>,
        wakeups: Sender<Wakeup>,
        io: IoConfig,
    ) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        if let Err(error) = stream.set_nodelay(true) {
            debug!(id, ?error, "failed to disable nagle");
        }

        let state = Arc::new(State {
            id,
            role,
            peer,
            open: AtomicBool::new(true),
            reading: AtomicBool::new(role == Role::Client),
            draining: AtomicBool::new(false),
            outbound: MessageQueue::new(),
        });

        let io_loop = IoLoop {
            stream,
            state: Arc::clone(&state),
            inbox,
            wakeups,
            io,
            drain_started: None,
        };
        let handle = thread::Builder::new()
            .name(format!("conn-{id}"))
            .spawn(move || io_loop.run())?;

        Ok(Self {
            state,
            io_thread: Mutex::new(Some(handle)),
        })
    }

    /// Queues a message for sending. Silently dropped once the connection is closed.
    pub fn send(&self, message: Message<T>) {
        if self.is_open() && !self.state.is_draining() {
            self.state.outbound.enqueue(message);
        } else {
            trace!(id = self.state.id, kind = ?message.kind(), "dropping message for closed connection");
        }
    }
}

impl<T> Connection<T> {
    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    pub fn role(&self) -> Role {
        self.state.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.state.peer
    }

    /// Remote host as text, e.g. `127.0.0.1` or `::1`.
    pub fn host(&self) -> String {
        self.state.peer.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.state.peer.port()
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Lets a server connection start delivering inbound messages.
    pub(crate) fn admit(&self) {
        self.state.reading.store(true, Ordering::Release);
    }

    /// Closes the connection: stops the I/O thread, joins it, releases the socket.
    ///
    /// Idempotent and callable from any thread other than the I/O thread.
    /// Closing locally never emits a [`Wakeup`].
    pub fn close(&self) {
        self.state.open.store(false, Ordering::Release);
        self.join();
    }

    /// Writes everything already queued, then closes.
    pub(crate) fn finish(&self) {
        self.state.draining.store(true, Ordering::Release);
        self.join();
    }

    fn join(&self) {
        let handle = crate::lock(&self.io_thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(id = self.state.id, "connection i/o thread panicked");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_outbound(&self) -> usize {
        self.state.outbound.size()
    }
}

impl<T> Drop for Connection<T> {
    fn drop(&mut self) {
        self.close();
    }
}

struct IoLoop<T> {
    stream: TcpStream,
    state: Arc<State<T>>,
    inbox: Inbox<T>,
    wakeups: Sender<Wakeup>,
    io: IoConfig,
    drain_started: Option<Instant>,
}

impl<T: MessageKind> IoLoop<T> {
    fn run(mut self) {
        match self.pump() {
            Ok(()) | Err(LinkError::Closed) => {
                self.state.open.store(false, Ordering::Release);
                trace!(id = self.state.id, "i/o loop finished");
            }
            Err(reason) => self.mark_lost(reason),
        }
    }

    fn pump(&mut self) -> Result<(), LinkError> {
        while self.state.is_open() {
            let mut busy = false;

            if let Some(message) = self.state.outbound.dequeue() {
                self.write_message(&message)?;
                busy = true;
            }

            if self.state.is_draining() {
                if self.state.outbound.is_empty() || self.drain_expired() {
                    self.state.open.store(false, Ordering::Release);
                }
                continue;
            }

            if self.state.is_reading() {
                if let Some(message) = self.read_message()? {
                    self.deliver(message);
                    busy = true;
                }
            }

            if !busy {
                self.backoff();
            }
        }
        Ok(())
    }

    fn mark_lost(&self, reason: LinkError) {
        // Only the first transition to closed announces the loss.
        if !self.state.open.swap(false, Ordering::AcqRel) {
            return;
        }
        match &reason {
            LinkError::PeerClosed => debug!(id = self.state.id, peer = %self.state.peer, "peer closed connection"),
            other => warn!(id = self.state.id, peer = %self.state.peer, error = %other, "connection failed"),
        }
        if self
            .wakeups
            .send(Wakeup::ConnectionLost(self.state.id))
            .is_err()
        {
            trace!(id = self.state.id, "owner no longer listening for connection loss");
        }
    }

    fn deliver(&self, message: Message<T>) {
        let sender = match self.state.role {
            Role::Server => Some(self.state.id),
            Role::Client => None,
        };
        self.inbox.enqueue(OwnedMessage::new(sender, message));
    }

    fn write_message(&mut self, message: &Message<T>) -> Result<(), LinkError> {
        let header = match message.header(self.io.max_body_len) {
            Ok(header) => header,
            Err(error) => {
                warn!(id = self.state.id, kind = ?message.kind(), %error, "dropping outbound message");
                return Ok(());
            }
        };
        self.write_fully(&header.encode())?;
        self.write_fully(message.body())
    }

    fn write_fully(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        let mut written = 0;
        while written < buf.len() {
            if !self.state.is_open() {
                return Err(LinkError::Closed);
            }
            match self.stream.write(&buf[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.drain_expired() {
                        debug!(
                            id = self.state.id,
                            unsent = self.state.outbound.size() + 1,
                            "drain timed out, dropping unsent messages"
                        );
                        return Err(LinkError::Closed);
                    }
                    self.backoff();
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Whether a drain in progress has run past its deadline. The clock starts
    /// the first time a draining loop asks.
    fn drain_expired(&mut self) -> bool {
        if !self.state.is_draining() {
            return false;
        }
        let started = *self.drain_started.get_or_insert_with(Instant::now);
        started.elapsed() >= self.io.drain_timeout
    }

    /// Reads one whole frame, or returns `None` if nothing has arrived yet.
    fn read_message(&mut self) -> Result<Option<Message<T>>, LinkError> {
        let mut raw_header = [0u8; HEADER_LEN];
        if !self.read_fully(&mut raw_header, true)? {
            return Ok(None);
        }

        let header = Header::decode(&raw_header);
        if header.size > self.io.max_body_len {
            return Err(WireError::BodyTooLarge {
                size: header.size as usize,
                max: self.io.max_body_len,
            }
            .into());
        }

        let mut body = vec![0u8; header.size as usize];
        self.read_fully(&mut body, false)?;
        Ok(Some(Message::from_wire(header, body)?))
    }

    /// Fills `buf` completely.
    ///
    /// With `at_boundary` set, a would-block before the first byte returns
    /// `Ok(false)` so the loop can go back to writing. Once any byte of a
    /// frame has arrived, would-block is retried until the frame is complete.
    fn read_fully(&mut self, buf: &mut [u8], at_boundary: bool) -> Result<bool, LinkError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(LinkError::PeerClosed),
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if filled == 0 && at_boundary {
                        return Ok(false);
                    }
                    if !self.state.is_reading() {
                        return Err(LinkError::Closed);
                    }
                    self.backoff();
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn backoff(&self) {
        if !self.io.idle_backoff.is_zero() {
            thread::sleep(self.io.idle_backoff);
        }
    }
}
