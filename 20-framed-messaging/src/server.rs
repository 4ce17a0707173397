//! Server side: accept loop, connection registry and reaper.
//!
//! Three kinds of threads touch a running server:
//!
//! - the **listener** accepts sockets, asks the handler whether to keep each
//!   one, and registers the accepted ones;
//! - the **reaper** wakes whenever a connection reports loss, rescans the
//!   whole registry and removes every closed connection;
//! - the **application** thread calls [`Server::process_message`] and the
//!   send methods.
//!
//! The registry lock is never held while a handler callback runs, so
//! callbacks are free to send.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId, Inbox, Role, Wakeup};
use crate::error::{Error, Result};
use crate::message::{Message, MessageKind};
use crate::queue::MessageQueue;

/// Callbacks a [`Server`] invokes.
///
/// Calls are serialized behind one mutex. Lifecycle callbacks arrive from
/// the listener and reaper threads, `on_message` from whichever thread calls
/// [`Server::process_message`].
pub trait ServerHandler<T: MessageKind>: Send + 'static {
    /// [`Server::start`] is about to spawn its threads.
    fn on_start(&mut self, _server: &ServerHandle<T>) {}

    /// The listener thread is up and accepting on `addr`.
    fn on_listen(&mut self, _server: &ServerHandle<T>, _addr: SocketAddr) {}

    /// Accept or refuse a new connection.
    ///
    /// Messages sent to `connection` here are still delivered when it is
    /// refused; the connection is then flushed, closed and never registered.
    fn on_client_connect(&mut self, _server: &ServerHandle<T>, _connection: &Connection<T>) -> bool {
        true
    }

    /// An accepted connection has been registered.
    fn on_client_accepted(&mut self, _server: &ServerHandle<T>, _connection: &Connection<T>) {}

    /// A registered connection closed and is being removed.
    fn on_client_disconnect(&mut self, _server: &ServerHandle<T>, _connection: &Connection<T>) {}

    fn on_message(&mut self, server: &ServerHandle<T>, sender: ConnectionId, message: Message<T>);
}

type Registry<T> = BTreeMap<ConnectionId, Arc<Connection<T>>>;

struct ServerShared<T> {
    registry: Mutex<Registry<T>>,
    inbox: Inbox<T>,
    wakeups: Sender<Wakeup>,
    running: AtomicBool,
}

/// Cheap, cloneable access to a server's registry from inside its callbacks.
pub struct ServerHandle<T> {
    shared: Arc<ServerShared<T>>,
}

impl<T> Clone for ServerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: MessageKind> ServerHandle<T> {
    /// Queues `message` on the registered connection with `id`.
    ///
    /// Returns whether such a connection exists.
    pub fn send(&self, id: ConnectionId, message: Message<T>) -> bool {
        match crate::lock(&self.shared.registry).get(&id) {
            Some(connection) => {
                connection.send(message);
                true
            }
            None => {
                debug!(id, "no connection to send to");
                false
            }
        }
    }

    /// Queues `message` directly on `connection` if it is still open.
    pub fn send_to(&self, connection: &Connection<T>, message: Message<T>) {
        if connection.is_open() {
            connection.send(message);
        }
    }

    /// Queues `message` on every open registered connection except `ignore`.
    pub fn send_all(&self, message: &Message<T>, ignore: Option<ConnectionId>) {
        let registry = crate::lock(&self.shared.registry);
        for (id, connection) in registry.iter() {
            if Some(*id) != ignore && connection.is_open() {
                connection.send(message.clone());
            }
        }
    }

    /// Closes the connection with `id` and lets the reaper remove it.
    ///
    /// `on_client_disconnect` follows from the reaper thread. Returns whether
    /// such a connection was registered.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let connection = crate::lock(&self.shared.registry).get(&id).cloned();
        match connection {
            Some(connection) => {
                connection.close();
                let _ = self.shared.wakeups.send(Wakeup::ConnectionLost(id));
                true
            }
            None => false,
        }
    }
}

impl<T> ServerHandle<T> {
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        crate::lock(&self.shared.registry).len()
    }

    /// Ids of the registered connections in accept order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        crate::lock(&self.shared.registry).keys().copied().collect()
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        crate::lock(&self.shared.registry).contains_key(&id)
    }
}

/// A messaging server.
///
/// Binding happens in [`Server::bind`]; threads only run between
/// [`Server::start`] and [`Server::stop`]. Dropping the server stops it.
pub struct Server<T: MessageKind, H: ServerHandler<T>> {
    handle: ServerHandle<T>,
    handler: Arc<Mutex<H>>,
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    wakeup_rx: Receiver<Wakeup>,
    next_id: Arc<AtomicU32>,
    config: ServerConfig,
    listener_thread: Option<JoinHandle<()>>,
    reaper_thread: Option<JoinHandle<()>>,
}

impl<T: MessageKind, H: ServerHandler<T>> Server<T, H> {
    /// Resolves and binds `config.bind_addr`.
    pub fn bind(config: ServerConfig, handler: H) -> Result<Self> {
        let listener = bind_listener(&config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "server bound");

        let (wakeup_tx, wakeup_rx) = unbounded();
        Ok(Self {
            handle: ServerHandle {
                shared: Arc::new(ServerShared {
                    registry: Mutex::new(BTreeMap::new()),
                    inbox: Arc::new(MessageQueue::new()),
                    wakeups: wakeup_tx,
                    running: AtomicBool::new(false),
                }),
            },
            handler: Arc::new(Mutex::new(handler)),
            listener: Arc::new(listener),
            local_addr,
            wakeup_rx,
            next_id: Arc::new(AtomicU32::new(config.first_connection_id)),
            config,
            listener_thread: None,
            reaper_thread: None,
        })
    }

    /// Calls `on_start`, then spawns the listener and reaper threads.
    ///
    /// Does nothing if the server is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        crate::lock(&self.handler).on_start(&self.handle);

        let reaper = Reaper {
            handle: self.handle.clone(),
            handler: Arc::clone(&self.handler),
            wakeups: self.wakeup_rx.clone(),
        };
        let reaper_thread = thread::Builder::new()
            .name("server-reaper".to_string())
            .spawn(move || reaper.run());
        match reaper_thread {
            Ok(thread) => self.reaper_thread = Some(thread),
            Err(err) => {
                self.handle.shared.running.store(false, Ordering::Release);
                return Err(Error::Spawn(err));
            }
        }

        let acceptor = Acceptor {
            handle: self.handle.clone(),
            handler: Arc::clone(&self.handler),
            listener: Arc::clone(&self.listener),
            local_addr: self.local_addr,
            next_id: Arc::clone(&self.next_id),
            config: self.config.clone(),
        };
        let listener_thread = thread::Builder::new()
            .name("server-listener".to_string())
            .spawn(move || acceptor.run());
        match listener_thread {
            Ok(thread) => self.listener_thread = Some(thread),
            Err(err) => {
                self.stop();
                return Err(Error::Spawn(err));
            }
        }

        Ok(())
    }

    /// Stops accepting, closes every connection and joins both threads.
    ///
    /// Each registered connection gets exactly one `on_client_disconnect`
    /// from the reaper's final sweep.
    pub fn stop(&mut self) {
        if !self.handle.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(thread) = self.listener_thread.take() {
            if thread.join().is_err() {
                warn!("server listener thread panicked");
            }
        }

        let connections: Vec<_> = crate::lock(&self.handle.shared.registry)
            .values()
            .cloned()
            .collect();
        for connection in connections {
            connection.close();
        }

        let _ = self.handle.shared.wakeups.send(Wakeup::Shutdown);
        if let Some(thread) = self.reaper_thread.take() {
            if thread.join().is_err() {
                warn!("server reaper thread panicked");
            }
        }
        info!(addr = %self.local_addr, "server stopped");
    }

    /// See [`ServerHandle::send`].
    pub fn send(&self, id: ConnectionId, message: Message<T>) -> bool {
        self.handle.send(id, message)
    }

    /// See [`ServerHandle::send_to`].
    pub fn send_to(&self, connection: &Connection<T>, message: Message<T>) {
        self.handle.send_to(connection, message);
    }

    /// See [`ServerHandle::send_all`].
    pub fn send_all(&self, message: &Message<T>, ignore: Option<ConnectionId>) {
        self.handle.send_all(message, ignore);
    }

    /// See [`ServerHandle::disconnect`].
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.handle.disconnect(id)
    }

    /// Whether an inbound message is waiting.
    pub fn available(&self) -> bool {
        !self.handle.shared.inbox.is_empty()
    }

    /// Dispatches one inbound message to `on_message`.
    ///
    /// Returns `false` when the inbound queue was empty.
    pub fn process_message(&self) -> bool {
        let Some(owned) = self.handle.shared.inbox.dequeue() else {
            return false;
        };
        match owned.into_parts() {
            (Some(sender), message) => {
                crate::lock(&self.handler).on_message(&self.handle, sender, message);
            }
            (None, message) => warn!(kind = ?message.kind(), "dropping inbound message without sender"),
        }
        true
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn host(&self) -> String {
        self.local_addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    pub fn handle(&self) -> &ServerHandle<T> {
        &self.handle
    }

    /// Runs `f` with exclusive access to the handler.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut crate::lock(&self.handler))
    }
}

impl<T: MessageKind, H: ServerHandler<T>> Drop for Server<T, H> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_listener(bind_addr: &str) -> Result<TcpListener> {
    let addrs: Vec<SocketAddr> = bind_addr
        .to_socket_addrs()
        .map_err(|source| Error::Resolve {
            addr: bind_addr.to_string(),
            source,
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpListener::bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(err) => last_error = Some(err),
        }
    }

    match last_error {
        Some(source) => Err(Error::Bind {
            addr: bind_addr.to_string(),
            source,
        }),
        None => Err(Error::NoAddress(bind_addr.to_string())),
    }
}

struct Acceptor<T, H> {
    handle: ServerHandle<T>,
    handler: Arc<Mutex<H>>,
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    next_id: Arc<AtomicU32>,
    config: ServerConfig,
}

impl<T: MessageKind, H: ServerHandler<T>> Acceptor<T, H> {
    fn run(self) {
        info!(addr = %self.local_addr, "server listening");
        crate::lock(&self.handler).on_listen(&self.handle, self.local_addr);

        while self.handle.is_running() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.accept_poll_interval);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(error = ?err, "failed to accept connection");
                    thread::sleep(self.config.accept_poll_interval);
                }
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = match Connection::spawn(
            Role::Server,
            id,
            stream,
            Arc::clone(&self.handle.shared.inbox),
            self.handle.shared.wakeups.clone(),
            self.config.io,
        ) {
            Ok(connection) => Arc::new(connection),
            Err(err) => {
                warn!(%peer, error = ?err, "failed to set up connection");
                return;
            }
        };

        // Holding the handler across registration keeps `on_client_accepted`
        // ahead of any `on_client_disconnect` for the same connection.
        let mut handler = crate::lock(&self.handler);
        if !handler.on_client_connect(&self.handle, &connection) {
            drop(handler);
            info!(id, %peer, "connection refused");
            connection.finish();
            return;
        }

        // Registered before it starts reading, so any loss it reports finds
        // it in the registry.
        crate::lock(&self.handle.shared.registry).insert(id, Arc::clone(&connection));
        connection.admit();
        if !connection.is_open() {
            // Failed while `on_client_connect` was writing to it.
            let _ = self.handle.shared.wakeups.send(Wakeup::ConnectionLost(id));
        }
        info!(id, %peer, "connection accepted");
        handler.on_client_accepted(&self.handle, &connection);
    }
}

struct Reaper<T, H> {
    handle: ServerHandle<T>,
    handler: Arc<Mutex<H>>,
    wakeups: Receiver<Wakeup>,
}

impl<T: MessageKind, H: ServerHandler<T>> Reaper<T, H> {
    fn run(self) {
        loop {
            let shutdown = !matches!(self.wakeups.recv(), Ok(Wakeup::ConnectionLost(_)));
            self.sweep();
            if shutdown {
                break;
            }
        }
    }

    /// Removes every closed connection, whichever one triggered the wakeup.
    fn sweep(&self) {
        let closed: Vec<Arc<Connection<T>>> = {
            let mut registry = crate::lock(&self.handle.shared.registry);
            let ids: Vec<ConnectionId> = registry
                .iter()
                .filter(|(_, connection)| !connection.is_open())
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| registry.remove(id)).collect()
        };

        for connection in closed {
            info!(id = connection.id(), peer = %connection.peer_addr(), "connection removed");
            crate::lock(&self.handler).on_client_disconnect(&self.handle, &connection);
            connection.close();
        }
    }
}
