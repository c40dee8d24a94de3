//! Server and client configuration
//!
//! Plain structs with builder-style construction; loading these from files or
//! CLI flags is the application's business.

use std::path::PathBuf;

use crate::buffer::BufferProvider;

/// Floor for the per-connection static buffer: one frame header plus a full
/// control payload must always fit contiguously.
pub(crate) const MIN_CONNECTION_BUFFER: usize = 256;

/// Which worker model drives accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    /// One OS thread per connection, blocking reads.
    Blocking,
    /// One reactor thread (epoll/kqueue) plus a bounded thread pool.
    #[default]
    NonBlocking,
}

/// Handshake limits and pooling.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Seconds a connection may spend in the handshake; `None` is unbounded.
    pub timeout: Option<u64>,
    /// Cap on the buffered request, in bytes.
    pub max_size: usize,
    /// Cap on the number of request headers.
    pub max_headers: usize,
    /// Preallocated handshake states shared across connections.
    pub pool_count: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            max_size: 1024,
            max_headers: 10,
            pool_count: 32,
        }
    }
}

/// Pool of large buffers for messages that outgrow the static buffer.
#[derive(Debug, Clone)]
pub struct LargeBufferConfig {
    /// Number of pooled buffers.
    pub count: usize,
    /// Size of each pooled buffer; `None` derives it from
    /// `max_message_size`.
    pub size: Option<usize>,
}

impl Default for LargeBufferConfig {
    fn default() -> Self {
        Self {
            count: 8,
            size: None,
        }
    }
}

/// Thread pool behind the nonblocking worker.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Worker thread count.
    pub count: usize,
    /// Bound on queued readiness events before the reactor blocks.
    pub backlog: usize,
    /// Scratch buffer handed to each worker for handshake reads.
    pub buffer_size: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            count: 4,
            backlog: 500,
            buffer_size: 32768,
        }
    }
}

/// What happens to live connections when the server shuts down.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Close the file descriptor.
    pub close_socket: bool,
    /// Send a going-away close frame first.
    pub notify_client: bool,
    /// Invoke the handler's close callback.
    pub notify_handler: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            close_socket: true,
            notify_client: true,
            notify_handler: true,
        }
    }
}

/// Server configuration
///
/// # Example
///
/// ```
/// use wharf_ws::{Config, WorkerMode};
///
/// let config = Config::builder()
///     .port(9223)
///     .max_message_size(1 << 20)
///     .worker_mode(WorkerMode::Blocking)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port; required unless `unix_path` is set.
    pub port: Option<u16>,
    /// Bind address, parsed as IPv4 or IPv6.
    pub address: String,
    /// Unix domain socket path, mutually exclusive with `port`.
    pub unix_path: Option<PathBuf>,
    /// Maximum assembled message size.
    pub max_message_size: usize,
    /// Per-connection static buffer size.
    pub connection_buffer_size: usize,
    /// Admission cap; accept pauses at this many live connections.
    pub max_conn: usize,
    /// Worker model for accepted connections.
    pub worker_mode: WorkerMode,
    /// Handshake limits.
    pub handshake: HandshakeConfig,
    /// Large-buffer pool.
    pub large_buffers: LargeBufferConfig,
    /// Thread pool for the nonblocking worker.
    pub thread_pool: ThreadPoolConfig,
    /// Shutdown policy.
    pub shutdown: ShutdownConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            address: "127.0.0.1".to_string(),
            unix_path: None,
            max_message_size: 65536,
            connection_buffer_size: 4096,
            max_conn: 16384,
            worker_mode: WorkerMode::default(),
            handshake: HandshakeConfig::default(),
            large_buffers: LargeBufferConfig::default(),
            thread_pool: ThreadPoolConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Resolved size of each pooled large buffer.
    ///
    /// Defaults to twice the maximum message size, capped at the maximum
    /// message size (a pooled buffer never usefully exceeds it).
    pub fn large_buffer_size(&self) -> usize {
        self.large_buffers
            .size
            .unwrap_or(self.max_message_size * 2)
            .min(self.max_message_size)
    }

    /// Static buffer size with the contiguity floor applied.
    pub(crate) fn effective_buffer_size(&self) -> usize {
        self.connection_buffer_size.max(MIN_CONNECTION_BUFFER)
    }

    /// Build the shared large-buffer provider for this config.
    pub(crate) fn buffer_provider(&self) -> BufferProvider {
        BufferProvider::new(
            self.large_buffers.count,
            self.large_buffer_size(),
            self.max_message_size,
        )
    }
}

/// Builder for server configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the TCP port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Set the bind address
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    /// Listen on a Unix domain socket instead of TCP
    pub fn unix_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.unix_path = Some(path.into());
        self
    }

    /// Set the maximum assembled message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the per-connection static buffer size
    pub fn connection_buffer_size(mut self, size: usize) -> Self {
        self.config.connection_buffer_size = size;
        self
    }

    /// Set the connection admission cap
    pub fn max_conn(mut self, max: usize) -> Self {
        self.config.max_conn = max;
        self
    }

    /// Select the worker model
    pub fn worker_mode(mut self, mode: WorkerMode) -> Self {
        self.config.worker_mode = mode;
        self
    }

    /// Set the handshake deadline in seconds
    pub fn handshake_timeout(mut self, seconds: u64) -> Self {
        self.config.handshake.timeout = Some(seconds);
        self
    }

    /// Set the handshake buffer cap
    pub fn handshake_max_size(mut self, size: usize) -> Self {
        self.config.handshake.max_size = size;
        self
    }

    /// Set the handshake header-count cap
    pub fn handshake_max_headers(mut self, count: usize) -> Self {
        self.config.handshake.max_headers = count;
        self
    }

    /// Set the handshake state pool size
    pub fn handshake_pool_count(mut self, count: usize) -> Self {
        self.config.handshake.pool_count = count;
        self
    }

    /// Set the large-buffer pool count
    pub fn large_buffer_count(mut self, count: usize) -> Self {
        self.config.large_buffers.count = count;
        self
    }

    /// Set the pooled large-buffer size
    pub fn large_buffer_size(mut self, size: usize) -> Self {
        self.config.large_buffers.size = Some(size);
        self
    }

    /// Set the nonblocking worker thread count
    pub fn thread_pool_count(mut self, count: usize) -> Self {
        self.config.thread_pool.count = count.max(1);
        self
    }

    /// Set the readiness queue bound
    pub fn thread_pool_backlog(mut self, backlog: usize) -> Self {
        self.config.thread_pool.backlog = backlog.max(1);
        self
    }

    /// Set the per-worker scratch buffer size
    pub fn thread_pool_buffer_size(mut self, size: usize) -> Self {
        self.config.thread_pool.buffer_size = size;
        self
    }

    /// Configure the shutdown policy
    pub fn shutdown(mut self, policy: ShutdownConfig) -> Self {
        self.config.shutdown = policy;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// Maximum assembled message size.
    pub max_size: usize,
    /// Static read buffer size.
    pub buffer_size: usize,
    /// Masking-key source; `None` uses a random key per frame. Fixing it is
    /// meant for tests and captures.
    pub mask_fn: Option<fn() -> [u8; 4]>,
    /// Handshake-key source; `None` draws 16 bytes from the OS RNG.
    pub key_fn: Option<fn() -> [u8; 16]>,
    /// Expect a TLS transport (supplied by the caller via
    /// [`Client::handshake_over`](crate::client::Client::handshake_over)).
    pub tls: bool,
    /// CA bundle path for the caller's TLS adapter.
    pub ca_bundle: Option<PathBuf>,
    /// Surface ping frames to the caller instead of auto-replying.
    pub handle_ping: bool,
    /// Surface pong frames to the caller instead of ignoring them.
    pub handle_pong: bool,
    /// Surface close frames to the caller instead of auto-replying.
    pub handle_close: bool,
    /// Share a large-buffer provider across clients.
    pub buffer_provider: Option<BufferProvider>,
}

impl ClientConfig {
    /// Defaults: 64 KiB messages, 4 KiB buffer, library-handled control frames.
    pub fn new() -> Self {
        Self {
            max_size: 65536,
            buffer_size: 4096,
            mask_fn: None,
            key_fn: None,
            tls: false,
            ca_bundle: None,
            handle_ping: false,
            handle_pong: false,
            handle_close: false,
            buffer_provider: None,
        }
    }

    pub(crate) fn effective_buffer_size(&self) -> usize {
        self.buffer_size.max(MIN_CONNECTION_BUFFER)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("max_size", &self.max_size)
            .field("buffer_size", &self.buffer_size)
            .field("tls", &self.tls)
            .field("handle_ping", &self.handle_ping)
            .field("handle_pong", &self.handle_pong)
            .field("handle_close", &self.handle_close)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.max_message_size, 65536);
        assert_eq!(c.connection_buffer_size, 4096);
        assert_eq!(c.handshake.max_size, 1024);
        assert_eq!(c.handshake.max_headers, 10);
        assert_eq!(c.handshake.pool_count, 32);
        assert!(c.handshake.timeout.is_none());
        assert_eq!(c.large_buffers.count, 8);
        assert_eq!(c.thread_pool.backlog, 500);
        assert_eq!(c.thread_pool.buffer_size, 32768);
        assert!(c.shutdown.close_socket);
        assert!(c.shutdown.notify_client);
        assert!(c.shutdown.notify_handler);
        assert_eq!(c.worker_mode, WorkerMode::NonBlocking);
    }

    #[test]
    fn large_buffer_size_is_capped() {
        let c = Config::default();
        assert_eq!(c.large_buffer_size(), c.max_message_size);

        let c = Config::builder()
            .max_message_size(1 << 20)
            .large_buffer_size(4096)
            .build();
        assert_eq!(c.large_buffer_size(), 4096);

        let c = Config::builder()
            .max_message_size(4096)
            .large_buffer_size(1 << 20)
            .build();
        assert_eq!(c.large_buffer_size(), 4096);
    }

    #[test]
    fn buffer_size_floor() {
        let c = Config::builder().connection_buffer_size(16).build();
        assert_eq!(c.effective_buffer_size(), MIN_CONNECTION_BUFFER);
    }

    #[test]
    fn builder_roundtrip() {
        let c = Config::builder()
            .port(8080)
            .address("0.0.0.0")
            .max_conn(100)
            .handshake_timeout(5)
            .worker_mode(WorkerMode::Blocking)
            .build();
        assert_eq!(c.port, Some(8080));
        assert_eq!(c.address, "0.0.0.0");
        assert_eq!(c.max_conn, 100);
        assert_eq!(c.handshake.timeout, Some(5));
        assert_eq!(c.worker_mode, WorkerMode::Blocking);
    }
}
