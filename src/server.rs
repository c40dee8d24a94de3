//! WebSocket server: bind, worker dispatch, shutdown
//!
//! [`Server::bind`] resolves the configured address (TCP by v4/v6 parse, or a
//! Unix socket path) and prepares the listening socket; [`Server::run`] hands
//! it to the configured worker model and blocks until shutdown. A cloneable
//! [`ShutdownHandle`] triggers the drain from any thread.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use polling::Poller;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::config::{Config, WorkerMode};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::stream::Listener;
use crate::worker;

/// Listen backlog for both TCP and Unix sockets.
const BACKLOG: i32 = 1024;

pub(crate) enum DialTarget {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

enum Waker {
    /// Wake a blocking accept loop by dialing it.
    Dial(DialTarget),
    /// Wake the readiness reactor.
    Poller(Arc<Poller>),
}

/// Shared shutdown latch: a monotonic flag plus a worker-specific wakeup.
pub(crate) struct ShutdownSignal {
    flag: AtomicBool,
    waker: Mutex<Waker>,
}

impl ShutdownSignal {
    fn new(target: DialTarget) -> Self {
        Self {
            flag: AtomicBool::new(false),
            waker: Mutex::new(Waker::Dial(target)),
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// The nonblocking worker swaps the dial wakeup for its poller.
    pub(crate) fn set_poller(&self, poller: Arc<Poller>) {
        *self.waker.lock() = Waker::Poller(poller);
    }

    pub(crate) fn trigger(&self) {
        if self.flag.swap(true, Ordering::AcqRel) {
            return;
        }
        match &*self.waker.lock() {
            Waker::Poller(poller) => {
                poller.notify().ok();
            }
            Waker::Dial(DialTarget::Tcp(addr)) => {
                let mut addr = *addr;
                if addr.ip().is_unspecified() {
                    let loopback: IpAddr = if addr.is_ipv4() {
                        IpAddr::from([127, 0, 0, 1])
                    } else {
                        IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1])
                    };
                    addr.set_ip(loopback);
                }
                TcpStream::connect_timeout(&addr, Duration::from_millis(500)).ok();
            }
            Waker::Dial(DialTarget::Unix(path)) => {
                UnixStream::connect(path).ok();
            }
        }
    }
}

/// Handle for stopping a running server from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    signal: Arc<ShutdownSignal>,
}

impl ShutdownHandle {
    /// Stop the accept loop and drain connections per the shutdown policy.
    pub fn shutdown(&self) {
        self.signal.trigger();
    }
}

/// A bound WebSocket server, parameterized over the application handler.
pub struct Server<H: Handler> {
    listener: Listener,
    config: Config,
    ctx: H::Ctx,
    signal: Arc<ShutdownSignal>,
}

impl<H: Handler> Server<H> {
    /// Bind the listening socket described by `config`.
    ///
    /// `ctx` is the application context handed to every `H::init`.
    pub fn bind(config: Config, ctx: H::Ctx) -> Result<Self> {
        let listener = bind_listener(&config)?;

        let target = match (&listener, &config.unix_path) {
            (Listener::Tcp(l), _) => DialTarget::Tcp(l.local_addr()?),
            (Listener::Unix(_), Some(path)) => DialTarget::Unix(path.clone()),
            (Listener::Unix(_), None) => {
                return Err(config_error("unix listener without a path"))
            }
        };

        Ok(Self {
            listener,
            config,
            ctx,
            signal: Arc::new(ShutdownSignal::new(target)),
        })
    }

    /// Actual bound TCP address (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for stopping the server.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            signal: Arc::clone(&self.signal),
        }
    }

    /// Run the accept loop until shutdown. Blocks the calling thread.
    pub fn run(self) -> Result<()> {
        let unix_path = self.config.unix_path.clone();
        match &self.listener {
            Listener::Tcp(l) => info!(addr = ?l.local_addr().ok(), "listening"),
            Listener::Unix(_) => info!(path = ?unix_path, "listening"),
        }

        let result = match self.config.worker_mode {
            WorkerMode::Blocking => {
                worker::blocking::run::<H>(self.listener, self.config, self.ctx, self.signal)
            }
            WorkerMode::NonBlocking => {
                worker::nonblocking::run::<H>(self.listener, self.config, self.ctx, self.signal)
            }
        };

        if let Some(path) = unix_path {
            std::fs::remove_file(path).ok();
        }
        result
    }
}

fn bind_listener(config: &Config) -> Result<Listener> {
    if let Some(path) = &config.unix_path {
        if config.port.is_some() {
            return Err(config_error("port and unix_path are mutually exclusive"));
        }
        // A stale socket file from a previous run would fail the bind.
        std::fs::remove_file(path).ok();

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.bind(&socket2::SockAddr::unix(path)?)?;
        socket.listen(BACKLOG)?;
        return Ok(Listener::Unix(socket.into()));
    }

    let port = config
        .port
        .ok_or_else(|| config_error("either port or unix_path is required"))?;
    let ip: IpAddr = config
        .address
        .parse()
        .map_err(|_| config_error("address must be an IPv4 or IPv6 literal"))?;
    let addr = SocketAddr::new(ip, port);

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    // Kernel load balancing across reuse-port listeners, where supported.
    socket.set_reuse_port(true).ok();
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(Listener::Tcp(socket.into()))
}

fn config_error(msg: &str) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))
}
