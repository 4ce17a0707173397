//! Client, server and per-connection configuration.

use std::time::Duration;

/// Port the demo relay listens on when none is given.
pub const DEFAULT_PORT: u16 = 60005;

/// Id handed to the first connection a server accepts.
pub const FIRST_CONNECTION_ID: u32 = 1000;

/// Largest body accepted on receive and sent on transmit (16 MiB).
pub const DEFAULT_MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(1);
const DEFAULT_ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for a single connection's I/O loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoConfig {
    /// Sleep after an iteration that neither sent nor received anything, and
    /// between would-block retries in the middle of a frame. Zero means pure
    /// busy-polling.
    pub idle_backoff: Duration,
    /// Frames declaring a larger body end the connection on receive and are
    /// dropped on send.
    pub max_body_len: u32,
    /// How long a connection being finished may wait on a peer that stops
    /// reading before the unsent frames are abandoned.
    pub drain_timeout: Duration,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            max_body_len: DEFAULT_MAX_BODY_LEN,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl IoConfig {
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    pub fn with_max_body_len(mut self, max: u32) -> Self {
        self.max_body_len = max;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `127.0.0.1:60005`. Port 0 picks an ephemeral port.
    pub bind_addr: String,
    /// How often the listener checks for new connections and for shutdown.
    pub accept_poll_interval: Duration,
    /// Id of the first accepted connection; later ones count up from here.
    pub first_connection_id: u32,
    /// I/O settings applied to every accepted connection.
    pub io: IoConfig,
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_accept_poll_interval(mut self, interval: Duration) -> Self {
        self.accept_poll_interval = interval;
        self
    }

    pub fn with_first_connection_id(mut self, id: u32) -> Self {
        self.first_connection_id = id;
        self
    }

    pub fn with_io(mut self, io: IoConfig) -> Self {
        self.io = io;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            accept_poll_interval: DEFAULT_ACCEPT_POLL_INTERVAL,
            first_connection_id: FIRST_CONNECTION_ID,
            io: IoConfig::default(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Upper bound for each connect attempt. `None` blocks until the OS gives up.
    pub connect_timeout: Option<Duration>,
    pub io: IoConfig,
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_io(mut self, io: IoConfig) -> Self {
        self.io = io;
        self
    }
}
