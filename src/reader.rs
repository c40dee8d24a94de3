//! Message reader: frames in, messages out
//!
//! The reader owns a per-connection static buffer and drives an incremental
//! state machine over it:
//!
//! - [`Reader::fill`] pulls bytes from the socket into the writable region,
//!   compacting leftovers from a previous message to the front first.
//! - [`Reader::read`] parses frames out of the buffered bytes and hands back
//!   complete messages. Control frames are delivered inline without
//!   disturbing a fragmented data message in progress.
//! - [`Reader::done`] releases whatever the delivered message borrowed — in
//!   particular any large buffer taken from the shared provider.
//!
//! Payload placement follows the message size: payloads that fit the static
//! buffer are delivered in place (single memmove for fragments, zero-copy for
//! whole frames); anything larger streams into a buffer borrowed from the
//! [`BufferProvider`], unmasked chunk by chunk as bytes arrive.

use std::io::Read;

use crate::buffer::{BorrowedBuffer, BufferProvider};
use crate::error::{Error, Result};
use crate::frame::{FrameHeader, OpCode};
use crate::mask::{apply_mask, apply_mask_offset};
use crate::{MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER_SIZE};

/// Space kept free above a static-buffer accumulation so a frame header and a
/// full control payload can always be parsed contiguously.
pub(crate) const CONTROL_HEADROOM: usize = MAX_FRAME_HEADER_SIZE + MAX_CONTROL_PAYLOAD;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client endpoint: masks outbound frames, expects unmasked inbound.
    Client,
    /// Server endpoint: expects masked inbound, sends unmasked.
    Server,
}

/// Kind of a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl MessageKind {
    /// True for ping/pong/close
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(self, MessageKind::Ping | MessageKind::Pong | MessageKind::Close)
    }
}

/// A complete message borrowed from the reader.
///
/// The payload points into the reader's buffers and is valid until
/// [`Reader::done`] is called. Text payloads have already been UTF-8
/// validated at message completion.
#[derive(Debug)]
pub struct Message<'a> {
    pub kind: MessageKind,
    pub data: &'a [u8],
}

impl<'a> Message<'a> {
    /// Payload as `&str` for text messages.
    pub fn as_text(&self) -> Option<&'a str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(self.data).ok(),
            _ => None,
        }
    }
}

/// An in-flight frame: header parsed, payload not yet fully consumed.
struct InFrame {
    opcode: OpCode,
    fin: bool,
    mask: Option<[u8; 4]>,
    /// Total payload length announced by the header.
    len: usize,
    /// Payload bytes already consumed (and unmasked).
    filled: usize,
    place: Place,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Place {
    /// Payload becomes contiguous in the static buffer and is delivered in
    /// place. Used for control frames and whole data messages that fit.
    Inline,
    /// Payload streams into the current message accumulator.
    Accum,
}

/// Accumulator for a message that spans frames or outgrows the static buffer.
struct Accum {
    kind: MessageKind,
    /// True while a continuation frame is still expected.
    open: bool,
    store: Store,
    len: usize,
}

enum Store {
    /// Accumulating at the front of the static buffer, below the parse region.
    Static,
    /// Accumulating in a borrowed large buffer.
    Large(BorrowedBuffer),
}

/// What a delivered message borrowed, so `done()` can release it.
enum Pending {
    None,
    /// Delivered in place; nothing to release.
    Inline,
    /// Delivered from the accumulator; release it (and any large buffer).
    Accum,
}

enum Progress {
    /// Frame payload incomplete; caller must `fill` again.
    NeedMore,
    /// A non-final fragment was absorbed; keep parsing.
    Fragment,
    /// In-place delivery from the static buffer.
    Inline {
        kind: MessageKind,
        from: usize,
        to: usize,
    },
    /// The accumulated message completed.
    Complete(MessageKind),
}

/// Per-connection message reader.
pub struct Reader {
    buf: Box<[u8]>,
    /// First unparsed byte.
    start: usize,
    /// One past the last valid byte; `fill` appends here.
    end: usize,
    inflight: Option<InFrame>,
    current: Option<Accum>,
    pending: Pending,
    expect_masked: bool,
    max_message_size: usize,
    provider: BufferProvider,
}

impl Reader {
    /// Create a reader with a static buffer of `buffer_size` bytes.
    pub fn new(
        buffer_size: usize,
        max_message_size: usize,
        provider: BufferProvider,
        role: Role,
    ) -> Self {
        debug_assert!(buffer_size > CONTROL_HEADROOM);
        Self {
            buf: BufferProvider::static_buffer(buffer_size),
            start: 0,
            end: 0,
            inflight: None,
            current: None,
            pending: Pending::None,
            expect_masked: role == Role::Server,
            max_message_size,
            provider,
        }
    }

    /// Bytes buffered but not yet parsed.
    ///
    /// After a handshake that overread into the first frame, this equals the
    /// number of seeded surplus bytes.
    pub fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// Seed the reader with bytes that arrived before its first `fill`
    /// (handshake overread).
    pub fn seed(&mut self, bytes: &[u8]) -> Result<()> {
        if self.end + bytes.len() > self.buf.len() {
            return Err(Error::RequestTooLarge);
        }
        self.buf[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        Ok(())
    }

    /// Read as much as the buffer can accept from `stream`.
    ///
    /// Returns the number of bytes read. A zero-byte read surfaces as
    /// [`Error::Closed`]; nonblocking sockets surface [`Error::WouldBlock`].
    pub fn fill<S: Read + ?Sized>(&mut self, stream: &mut S) -> Result<usize> {
        if self.end == self.buf.len() {
            self.compact();
        }
        if self.end == self.buf.len() {
            // The placement rules keep the parse region smaller than the
            // buffer; a full buffer here means the peer overran them.
            return Err(Error::MessageTooLarge);
        }
        let n = stream.read(&mut self.buf[self.end..])?;
        if n == 0 {
            return Err(Error::Closed);
        }
        self.end += n;
        Ok(n)
    }

    /// Parse frames out of the buffered bytes.
    ///
    /// Returns `(has_more, message)`: `message` is `None` when more bytes are
    /// needed, and `has_more` signals that further complete messages may
    /// already be buffered. Call [`Reader::done`] after consuming each
    /// delivered message.
    pub fn read(&mut self) -> Result<(bool, Option<Message<'_>>)> {
        debug_assert!(
            matches!(self.pending, Pending::None),
            "previous message not marked done"
        );

        loop {
            if self.inflight.is_none() {
                let region = &self.buf[self.start..self.end];
                match FrameHeader::parse(region, self.expect_masked)? {
                    None => return Ok((false, None)),
                    Some((header, consumed)) => {
                        self.start += consumed;
                        self.begin_frame(header)?;
                    }
                }
            }

            match self.advance()? {
                Progress::NeedMore => return Ok((false, None)),
                Progress::Fragment => continue,
                Progress::Inline { kind, from, to } => {
                    self.pending = Pending::Inline;
                    let has_more = self.start < self.end;
                    return Ok((
                        has_more,
                        Some(Message {
                            kind,
                            data: &self.buf[from..to],
                        }),
                    ));
                }
                Progress::Complete(kind) => {
                    self.pending = Pending::Accum;
                    let has_more = self.start < self.end;
                    let cur = self.current.as_ref().unwrap();
                    let data = match &cur.store {
                        Store::Static => &self.buf[..cur.len],
                        Store::Large(big) => &big.as_slice()[..cur.len],
                    };
                    return Ok((has_more, Some(Message { kind, data })));
                }
            }
        }
    }

    /// Signal that the delivered message has been consumed.
    ///
    /// Releases the accumulator for data messages — returning any borrowed
    /// large buffer to the pool — while leaving a fragmented message intact
    /// when the delivery was an interleaved control frame. Residual bytes
    /// belonging to the next frame are compacted on the next `fill`.
    pub fn done(&mut self) {
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::None | Pending::Inline => {}
            Pending::Accum => {
                self.current = None;
            }
        }
    }

    /// Validate the header against the fragmentation state and set up payload
    /// placement.
    fn begin_frame(&mut self, header: FrameHeader) -> Result<()> {
        let len = usize::try_from(header.payload_len).map_err(|_| Error::MessageTooLarge)?;

        let place = match header.opcode {
            OpCode::Close | OpCode::Ping | OpCode::Pong => Place::Inline,
            OpCode::Text | OpCode::Binary => {
                if self.current.is_some() {
                    return Err(Error::InvalidFragmentation("expected continuation frame"));
                }
                if len > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                if header.fin && len <= self.buf.len() {
                    Place::Inline
                } else {
                    let kind = if header.opcode == OpCode::Text {
                        MessageKind::Text
                    } else {
                        MessageKind::Binary
                    };
                    let store = if len + CONTROL_HEADROOM <= self.buf.len() {
                        Store::Static
                    } else {
                        Store::Large(self.provider.acquire(len)?)
                    };
                    self.current = Some(Accum {
                        kind,
                        open: !header.fin,
                        store,
                        len: 0,
                    });
                    Place::Accum
                }
            }
            OpCode::Continuation => {
                let projected = {
                    let cur = self
                        .current
                        .as_ref()
                        .filter(|c| c.open)
                        .ok_or(Error::InvalidFragmentation("unexpected continuation frame"))?;
                    cur.len + len
                };
                if projected > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }

                let cur = self.current.as_mut().unwrap();
                let spill = matches!(cur.store, Store::Static)
                    && projected + CONTROL_HEADROOM > self.buf.len();
                if spill {
                    // The message no longer fits beside the parse region;
                    // move it to a large buffer.
                    let mut big = self.provider.acquire(projected)?;
                    big.as_mut_slice()[..cur.len].copy_from_slice(&self.buf[..cur.len]);
                    cur.store = Store::Large(big);
                } else if let Store::Large(big) = &mut cur.store {
                    self.provider.grow(big, cur.len, projected)?;
                }
                Place::Accum
            }
        };

        self.inflight = Some(InFrame {
            opcode: header.opcode,
            fin: header.fin,
            mask: header.mask,
            len,
            filled: 0,
            place,
        });
        Ok(())
    }

    /// Move payload bytes for the in-flight frame and detect completion.
    fn advance(&mut self) -> Result<Progress> {
        let place = self.inflight.as_ref().unwrap().place;
        match place {
            Place::Inline => self.advance_inline(),
            Place::Accum => self.advance_accum(),
        }
    }

    fn advance_inline(&mut self) -> Result<Progress> {
        let (len, mask, opcode) = {
            let f = self.inflight.as_ref().unwrap();
            (f.len, f.mask, f.opcode)
        };

        if self.end - self.start < len {
            return Ok(Progress::NeedMore);
        }

        let (from, to) = (self.start, self.start + len);
        if let Some(m) = mask {
            apply_mask(&mut self.buf[from..to], m);
        }
        self.start = to;
        self.inflight = None;

        let kind = match opcode {
            OpCode::Text => MessageKind::Text,
            OpCode::Binary => MessageKind::Binary,
            OpCode::Ping => MessageKind::Ping,
            OpCode::Pong => MessageKind::Pong,
            OpCode::Close => MessageKind::Close,
            OpCode::Continuation => unreachable!("continuation is never placed inline"),
        };

        if kind == MessageKind::Text && simdutf8::basic::from_utf8(&self.buf[from..to]).is_err() {
            return Err(Error::InvalidUtf8);
        }

        Ok(Progress::Inline { kind, from, to })
    }

    fn advance_accum(&mut self) -> Result<Progress> {
        let f = self.inflight.as_mut().unwrap();
        let cur = self.current.as_mut().unwrap();

        let avail = (self.end - self.start).min(f.len - f.filled);
        if avail > 0 {
            let (dst_from, dst_to) = (cur.len, cur.len + avail);
            match &mut cur.store {
                Store::Static => {
                    self.buf.copy_within(self.start..self.start + avail, dst_from);
                    if let Some(m) = f.mask {
                        apply_mask_offset(&mut self.buf[dst_from..dst_to], m, f.filled);
                    }
                }
                Store::Large(big) => {
                    big.as_mut_slice()[dst_from..dst_to]
                        .copy_from_slice(&self.buf[self.start..self.start + avail]);
                    if let Some(m) = f.mask {
                        apply_mask_offset(&mut big.as_mut_slice()[dst_from..dst_to], m, f.filled);
                    }
                }
            }
            self.start += avail;
            f.filled += avail;
            cur.len += avail;
        }

        if f.filled < f.len {
            return Ok(Progress::NeedMore);
        }

        let fin = f.fin;
        self.inflight = None;

        if !fin {
            self.current.as_mut().unwrap().open = true;
            return Ok(Progress::Fragment);
        }

        let cur = self.current.as_mut().unwrap();
        cur.open = false;
        let kind = cur.kind;
        if kind == MessageKind::Text {
            let data = match &cur.store {
                Store::Static => &self.buf[..cur.len],
                Store::Large(big) => &big.as_slice()[..cur.len],
            };
            if simdutf8::basic::from_utf8(data).is_err() {
                return Err(Error::InvalidUtf8);
            }
        }
        Ok(Progress::Complete(kind))
    }

    /// Slide the parse region down over dead bytes, keeping a static-buffer
    /// accumulation in place below it.
    fn compact(&mut self) {
        let floor = match &self.current {
            Some(Accum {
                store: Store::Static,
                len,
                ..
            }) => *len,
            _ => 0,
        };
        if self.start > floor {
            self.buf.copy_within(self.start..self.end, floor);
            self.end -= self.start - floor;
            self.start = floor;
        }
    }
}
