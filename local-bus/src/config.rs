use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BusError;
use crate::name::BusName;

/// Environment variable that overrides the default socket directory.
pub const DIR_ENV: &str = "LOCAL_BUS_DIR";

/// What decides the outcome of an election.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ElectionGate {
    /// An exclusive advisory lock on `<dir>/<name>.lock` picks the hub; the
    /// socket only carries data.
    #[default]
    LockFile,
    /// Whoever binds the socket is hub. A refused connect is taken to mean the
    /// socket file is stale and it gets removed.
    Endpoint,
}

/// Configuration for [`Bus::board`](crate::Bus::board).
///
/// ```rust
/// use std::time::Duration;
/// use local_bus::{BusConfig, ElectionGate};
///
/// let config = BusConfig::new("demo")?
///     .gate(ElectionGate::Endpoint)
///     .retry_backoff(Duration::from_millis(20));
/// assert_eq!(config.name().as_str(), "demo");
/// # Ok::<(), local_bus::BusError>(())
/// ```
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub(crate) name: BusName,
    pub(crate) socket_dir: PathBuf,
    pub(crate) gate: ElectionGate,
    /// Pause before re-running a failed election.
    pub(crate) retry_backoff: Duration,
    /// Longest frame a link accepts before it is dropped.
    pub(crate) max_frame_len: usize,
    /// Outgoing frames buffered per link.
    pub(crate) link_buffer: usize,
    /// How long a hub waits on a full spoke queue before cutting the spoke off.
    pub(crate) stall_timeout: Duration,
    /// Capacity of the event broadcast channel.
    pub(crate) event_buffer: usize,
    pub(crate) query_messages: bool,
}

impl BusConfig {
    /// Defaults for the bus `name`.
    ///
    /// Sockets go to the system temp directory unless `LOCAL_BUS_DIR` is set.
    pub fn new(name: impl Into<String>) -> Result<Self, BusError> {
        let socket_dir = std::env::var_os(DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        Ok(Self {
            name: BusName::new(name)?,
            socket_dir,
            gate: ElectionGate::default(),
            retry_backoff: Duration::from_millis(10),
            max_frame_len: 1024 * 1024, // 1 MiB
            link_buffer: 256,
            stall_timeout: Duration::from_secs(5),
            event_buffer: 1024,
            query_messages: false,
        })
    }

    /// Directory holding the socket and lock files.
    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn gate(mut self, gate: ElectionGate) -> Self {
        self.gate = gate;
        self
    }

    /// Pause before retrying an election that ended in a refused connect
    /// (default: 10 ms).
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Maximum frame length in bytes (default: 1 MiB).
    pub fn max_frame_len(mut self, bytes: usize) -> Self {
        self.max_frame_len = bytes;
        self
    }

    /// Outgoing frames buffered per link (default: 256). Senders wait while
    /// the buffer is full.
    pub fn link_buffer(mut self, capacity: usize) -> Self {
        self.link_buffer = capacity.max(1);
        self
    }

    /// How long the hub waits for a spoke whose buffer stays full before it
    /// closes that spoke's link (default: 5 s). The spoke sees the disconnect
    /// and re-elects. A spoke waits on its hub link for as long as it takes.
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Events buffered for each subscriber (default: 1024).
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Also surface query and response frames as plain messages.
    pub fn query_messages(mut self, enabled: bool) -> Self {
        self.query_messages = enabled;
        self
    }

    pub fn name(&self) -> &BusName {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.socket_dir
    }

    pub(crate) fn socket_path(&self) -> Result<PathBuf, BusError> {
        self.name.socket_path(&self.socket_dir)
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.name.lock_path(&self.socket_dir)
    }
}
