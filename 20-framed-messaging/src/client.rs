//! Client side: one connection to a server plus a watcher for its loss.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{Connection, Inbox, Role, Wakeup};
use crate::error::{Error, Result};
use crate::message::{Message, MessageKind};
use crate::queue::MessageQueue;

/// Callbacks a [`Client`] invokes.
///
/// Calls are serialized: the handler sits behind one mutex, so no two
/// callbacks of the same client ever overlap, even though
/// `on_connection_lost` runs on the watcher thread.
pub trait ClientHandler<T: MessageKind>: Send + 'static {
    /// The connection is up.
    fn on_connect(&mut self, _client: &ClientHandle<T>, _host: &str, _port: u16) {}

    /// The connection was closed locally, by [`Client::disconnect`],
    /// [`ClientHandle::disconnect`] or by dropping the client.
    ///
    /// Runs on the watcher thread. [`Client::disconnect`] returns after it.
    fn on_disconnect(&mut self, _client: &ClientHandle<T>) {}

    /// The server closed the connection or the socket failed.
    fn on_connection_lost(&mut self, _client: &ClientHandle<T>) {}

    /// A message was pulled off the inbound queue by [`Client::process_message`].
    fn on_message(&mut self, client: &ClientHandle<T>, message: Message<T>);
}

struct Link<T> {
    connection: Connection<T>,
    wakeups: Sender<Wakeup>,
}

struct ClientShared<T> {
    link: Mutex<Option<Link<T>>>,
    inbox: Inbox<T>,
    id: AtomicU32,
}

/// Cheap, cloneable access to a client from inside its callbacks.
pub struct ClientHandle<T> {
    shared: Arc<ClientShared<T>>,
}

impl<T> Clone for ClientHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: MessageKind> ClientHandle<T> {
    /// Queues a message for the server. Does nothing while disconnected.
    pub fn send(&self, message: Message<T>) {
        if let Some(link) = crate::lock(&self.shared.link).as_ref() {
            link.connection.send(message);
        }
    }
}

impl<T> ClientHandle<T> {
    pub fn is_connected(&self) -> bool {
        crate::lock(&self.shared.link).is_some()
    }

    /// Application-assigned id, typically handed out by the server.
    pub fn id(&self) -> u32 {
        self.shared.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u32) {
        self.shared.id.store(id, Ordering::Relaxed);
    }

    /// Closes the connection and wakes the watcher without waiting for it.
    ///
    /// Safe to call from any callback; the watcher delivers `on_disconnect`
    /// once the callback returns. Returns whether a connection was open.
    pub fn disconnect(&self) -> bool {
        let link = crate::lock(&self.shared.link).take();
        match link {
            Some(link) => {
                link.connection.close();
                // The watcher holds the receiver until it exits.
                let _ = link.wakeups.send(Wakeup::Shutdown);
                true
            }
            None => false,
        }
    }
}

/// A messaging client holding at most one connection.
pub struct Client<T: MessageKind, H: ClientHandler<T>> {
    handle: ClientHandle<T>,
    handler: Arc<Mutex<H>>,
    watcher: Option<JoinHandle<()>>,
    config: ClientConfig,
}

impl<T: MessageKind, H: ClientHandler<T>> Client<T, H> {
    pub fn new(handler: H) -> Self {
        Self::with_config(handler, ClientConfig::default())
    }

    pub fn with_config(handler: H, config: ClientConfig) -> Self {
        Self {
            handle: ClientHandle {
                shared: Arc::new(ClientShared {
                    link: Mutex::new(None),
                    inbox: Arc::new(MessageQueue::new()),
                    id: AtomicU32::new(0),
                }),
            },
            handler: Arc::new(Mutex::new(handler)),
            watcher: None,
            config,
        }
    }

    /// Resolves `host:port`, connects, starts the watcher, then calls `on_connect`.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        // A watcher left over from a lost connection has already finished.
        self.join_watcher();

        let stream = open_stream(host, port, &self.config)?;
        let (wakeup_tx, wakeup_rx) = unbounded();
        let connection = Connection::spawn(
            Role::Client,
            0,
            stream,
            Arc::clone(&self.handle.shared.inbox),
            wakeup_tx.clone(),
            self.config.io,
        )?;
        let peer_host = connection.host();
        let peer_port = connection.port();

        *crate::lock(&self.handle.shared.link) = Some(Link {
            connection,
            wakeups: wakeup_tx,
        });

        // Held until `on_connect` has run, so the watcher cannot report a
        // loss ahead of it.
        let mut handler = crate::lock(&self.handler);

        let handle = self.handle.clone();
        let shared_handler = Arc::clone(&self.handler);
        let watcher = thread::Builder::new()
            .name("client-watcher".to_string())
            .spawn(move || watch_connection(handle, shared_handler, wakeup_rx));
        match watcher {
            Ok(watcher) => self.watcher = Some(watcher),
            Err(err) => {
                drop(handler);
                self.handle.disconnect();
                return Err(Error::Spawn(err));
            }
        }

        info!(host = %peer_host, port = peer_port, "connected to server");
        handler.on_connect(&self.handle, &peer_host, peer_port);
        Ok(())
    }

    /// Closes the connection, if any, and waits for the watcher to exit.
    ///
    /// `on_disconnect` has run by the time this returns, when a connection
    /// was actually closed.
    pub fn disconnect(&mut self) {
        self.handle.disconnect();
        self.join_watcher();
    }

    /// Queues a message for the server. Does nothing while disconnected.
    pub fn send(&self, message: Message<T>) {
        self.handle.send(message);
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
        let (_, message) = owned.into_parts();
        crate::lock(&self.handler).on_message(&self.handle, message);
        true
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    pub fn handle(&self) -> &ClientHandle<T> {
        &self.handle
    }

    /// Runs `f` with exclusive access to the handler.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut crate::lock(&self.handler))
    }

    fn join_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            if watcher.join().is_err() {
                warn!("client watcher thread panicked");
            }
        }
    }
}

impl<T: MessageKind, H: ClientHandler<T>> Drop for Client<T, H> {
    fn drop(&mut self) {
        self.handle.disconnect();
        self.join_watcher();
    }
}

fn open_stream(host: &str, port: u16, config: &ClientConfig) -> Result<TcpStream> {
    let target = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::Resolve {
            addr: target.clone(),
            source,
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        let attempt = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(%addr, error = %err, "connect attempt failed");
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(source) => Err(Error::Connect {
            addr: target,
            source,
        }),
        None => Err(Error::NoAddress(target)),
    }
}

enum LinkEnd<T> {
    Disconnected,
    Lost(Link<T>),
}

/// Waits until the connection is gone or closed by the peer, then reports
/// which of the two happened.
///
/// Every wakeup re-checks the link, so stray or duplicate events are harmless.
fn watch_connection<T, H>(handle: ClientHandle<T>, handler: Arc<Mutex<H>>, wakeups: Receiver<Wakeup>)
where
    T: MessageKind,
    H: ClientHandler<T>,
{
    loop {
        let event = wakeups.recv();

        let end = {
            let mut link = crate::lock(&handle.shared.link);
            match link.as_ref() {
                // Only `ClientHandle::disconnect` clears the link behind our back.
                None => Some(LinkEnd::Disconnected),
                Some(current) if !current.connection.is_open() => link.take().map(LinkEnd::Lost),
                Some(_) => None,
            }
        };

        match end {
            Some(LinkEnd::Disconnected) => {
                info!("disconnected from server");
                crate::lock(&handler).on_disconnect(&handle);
                return;
            }
            Some(LinkEnd::Lost(link)) => {
                link.connection.close();
                info!("lost connection with server");
                crate::lock(&handler).on_connection_lost(&handle);
                return;
            }
            None => {}
        }

        if event.is_err() {
            return;
        }
    }
}
