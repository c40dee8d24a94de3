//! Transport streams: TCP and Unix domain sockets behind one surface
//!
//! The core only needs read, write-all, timeouts, blocking-mode control, and
//! shutdown; [`Transport`] pins that down so a TLS adapter can wrap a raw
//! socket and plug in without the core seeing TLS specifics.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

/// The stream surface the endpoint core relies on.
///
/// Implemented by [`NetStream`] for plain TCP/Unix sockets; TLS wrappers
/// implement the same set over their inner socket.
pub trait Transport: Read + Write + Send {
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
    fn shutdown(&self) -> io::Result<()>;
}

/// A plain network stream: TCP (v4/v6) or Unix domain.
#[derive(Debug)]
pub enum NetStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl NetStream {
    /// Peer description for logging: socket address or unix peer.
    pub fn peer_desc(&self) -> String {
        match self {
            NetStream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            NetStream::Unix(_) => "unix".to_string(),
        }
    }

    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        match self {
            NetStream::Tcp(s) => s.set_read_timeout(dur),
            NetStream::Unix(s) => s.set_read_timeout(dur),
        }
    }

    pub fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        match self {
            NetStream::Tcp(s) => s.set_write_timeout(dur),
            NetStream::Unix(s) => s.set_write_timeout(dur),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            NetStream::Tcp(s) => s.set_nonblocking(nonblocking),
            NetStream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            NetStream::Tcp(s) => s.shutdown(Shutdown::Both),
            NetStream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self).flush()
    }
}

// TcpStream and UnixStream are readable/writable through shared references;
// forwarding that lets the reader and the connection object share one stream
// without a lock.
impl Read for &NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            NetStream::Tcp(s) => (&*s).read(buf),
            NetStream::Unix(s) => (&*s).read(buf),
        }
    }
}

impl Write for &NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            NetStream::Tcp(s) => (&*s).write(buf),
            NetStream::Unix(s) => (&*s).write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            NetStream::Tcp(s) => (&*s).flush(),
            NetStream::Unix(s) => (&*s).flush(),
        }
    }
}

impl Transport for NetStream {
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        NetStream::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        NetStream::set_write_timeout(self, dur)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        NetStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown(&self) -> io::Result<()> {
        NetStream::shutdown(self)
    }
}

impl AsRawFd for NetStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            NetStream::Tcp(s) => s.as_raw_fd(),
            NetStream::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl AsFd for NetStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            NetStream::Tcp(s) => s.as_fd(),
            NetStream::Unix(s) => s.as_fd(),
        }
    }
}

/// A bound listening socket: TCP or Unix domain.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Accept one connection.
    ///
    /// TCP streams get `TCP_NODELAY`; failures to set it are ignored.
    pub fn accept(&self) -> io::Result<NetStream> {
        match self {
            Listener::Tcp(l) => {
                let (stream, _) = l.accept()?;
                stream.set_nodelay(true).ok();
                Ok(NetStream::Tcp(stream))
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept()?;
                Ok(NetStream::Unix(stream))
            }
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(nonblocking),
            Listener::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }

    /// Local TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(l) => l.as_fd(),
            Listener::Unix(l) => l.as_fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_pair_reads_through_shared_ref() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = NetStream::Unix(a);
        let mut b = NetStream::Unix(b);

        (&a).write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn shutdown_ends_reads() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = NetStream::Unix(a);
        let mut b = NetStream::Unix(b);

        a.shutdown().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }
}
