//! Per-connection state and framed write helpers
//!
//! A [`Conn`] is a cheaply cloneable handle shared between the worker driving
//! the connection and the application handler. Server-side frames are emitted
//! unmasked, as RFC 6455 requires.
//!
//! Writes are not internally serialized: interleaving frame writes from
//! multiple application threads on one connection requires external
//! synchronization.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::frame::{close_payload, encode_frame, OpCode};
use crate::stream::NetStream;
use crate::MAX_CONTROL_PAYLOAD;

/// Canned close frame, code 1000 (normal closure), unmasked.
pub(crate) const CLOSE_NORMAL: [u8; 4] = [0x88, 0x02, 0x03, 0xE8];

/// Canned close frame, code 1002 (protocol error), unmasked.
pub(crate) const CLOSE_PROTOCOL_ERROR: [u8; 4] = [0x88, 0x02, 0x03, 0xEA];

/// Canned close frame, code 1007 (invalid payload data), unmasked.
pub(crate) const CLOSE_INVALID_PAYLOAD: [u8; 4] = [0x88, 0x02, 0x03, 0xEF];

struct Inner {
    stream: NetStream,
    /// Monotonic: flips to true exactly once.
    closed: AtomicBool,
    /// Current I/O mode of the underlying socket.
    nonblocking: AtomicBool,
    peer: String,
}

/// Handle to one server-side connection.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

impl Conn {
    pub(crate) fn new(stream: NetStream, nonblocking: bool) -> Self {
        let peer = stream.peer_desc();
        Self {
            inner: Arc::new(Inner {
                stream,
                closed: AtomicBool::new(false),
                nonblocking: AtomicBool::new(nonblocking),
                peer,
            }),
        }
    }

    /// Peer address description.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Send a text frame.
    pub fn write_text(&self, data: &[u8]) -> Result<()> {
        self.write_frame(OpCode::Text, data)
    }

    /// Send a binary frame.
    pub fn write_bin(&self, data: &[u8]) -> Result<()> {
        self.write_frame(OpCode::Binary, data)
    }

    /// Send a ping frame.
    pub fn write_ping(&self, data: &[u8]) -> Result<()> {
        self.write_frame(OpCode::Ping, data)
    }

    /// Send a pong frame.
    pub fn write_pong(&self, data: &[u8]) -> Result<()> {
        self.write_frame(OpCode::Pong, data)
    }

    /// Send a close frame with code 1000.
    pub fn write_close(&self) -> Result<()> {
        self.write_framed(&CLOSE_NORMAL)
    }

    /// Send a close frame with the given code.
    pub fn write_close_with_code(&self, code: u16) -> Result<()> {
        self.write_frame(OpCode::Close, &code.to_be_bytes())
    }

    /// Send a close frame with a code and UTF-8 reason.
    ///
    /// The reason is truncated at a character boundary so the control payload
    /// stays within 125 bytes.
    pub fn write_close_with(&self, code: u16, reason: &str) -> Result<()> {
        let max_reason = MAX_CONTROL_PAYLOAD - 2;
        let mut cut = reason.len().min(max_reason);
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        let payload = close_payload(code, &reason[..cut]);
        self.write_frame(OpCode::Close, &payload)
    }

    /// Send already-framed bytes verbatim (canned close responses).
    pub fn write_framed(&self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)
    }

    /// Frame and send a payload with the given opcode, unmasked.
    pub fn write_frame(&self, opcode: OpCode, data: &[u8]) -> Result<()> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, data, true, None);
        self.write_all(&buf)
    }

    /// Close the connection.
    ///
    /// Idempotent: the socket shutdown happens exactly once, no matter how
    /// many handles race here. Returns true for the call that won.
    pub fn close(&self) -> bool {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner.stream.shutdown().ok();
            true
        } else {
            false
        }
    }

    /// Monotonic closed check.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Switch the socket to blocking mode for a synchronous (pre-hand-off)
    /// reply. The flag swap guarantees one transition.
    pub fn blocking(&self) -> Result<()> {
        if self.inner.nonblocking.swap(false, Ordering::AcqRel) {
            self.inner.stream.set_nonblocking(false)?;
        }
        Ok(())
    }

    /// Best-effort write of a pre-upgrade HTTP reply: blocking mode, 5-second
    /// send timeout, errors swallowed.
    pub(crate) fn pre_handoff_write(&self, bytes: &[u8]) {
        if self.blocking().is_err() {
            return;
        }
        self.inner
            .stream
            .set_write_timeout(Some(std::time::Duration::from_secs(5)))
            .ok();
        let _ = self.write_all(bytes);
    }

    pub(crate) fn stream(&self) -> &NetStream {
        &self.inner.stream
    }

    fn write_all(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut flipped = false;
        let mut written = 0;
        let result = loop {
            if written == bytes.len() {
                break Ok(());
            }
            match (&self.inner.stream).write(&bytes[written..]) {
                Ok(0) => break Err(Error::BrokenPipe),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && !flipped => {
                    // Finish the frame synchronously rather than leave a
                    // partial header on the wire.
                    if self.inner.stream.set_nonblocking(false).is_err() {
                        break Err(Error::WouldBlock);
                    }
                    flipped = true;
                }
                Err(e) => break Err(e.into()),
            }
        };
        if flipped && self.inner.nonblocking.load(Ordering::Acquire) {
            self.inner.stream.set_nonblocking(true).ok();
        }
        result
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
