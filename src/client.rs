//! WebSocket client: outbound connect, handshake, read loop, masked writes
//!
//! [`Client::connect`] dials TCP and upgrades; [`Client::handshake_over`]
//! performs the upgrade on any caller-supplied stream (a TLS adapter plugs in
//! here). Reading is pull-based — [`Client::read_message`] runs on the
//! caller's thread and, unless configured otherwise, handles control frames
//! itself: pings are answered, pongs swallowed, and a close frame is answered
//! and surfaced as [`Error::Closed`].

use std::io::{Read, Write};
use std::net::TcpStream;

use bytes::BytesMut;
use tracing::debug;

use crate::buffer::BufferProvider;
use crate::config::ClientConfig;
use crate::error::{close_code, Error, Result};
use crate::frame::{encode_frame, OpCode};
use crate::handshake::{self, accept_key};
use crate::mask::generate_mask;
use crate::reader::{MessageKind, Reader, Role};

/// Cap on the buffered handshake response.
const MAX_RESPONSE_SIZE: usize = 8192;

/// A message copied out of the read buffer for the caller to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMessage {
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

impl OwnedMessage {
    /// Payload as `&str` for text messages.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.data).ok(),
            _ => None,
        }
    }
}

enum Step {
    Fill,
    Deliver(MessageKind, Vec<u8>),
}

/// An established client session over stream `S`.
pub struct Client<S = TcpStream> {
    stream: S,
    reader: Reader,
    config: ClientConfig,
    closed: bool,
}

impl Client<TcpStream> {
    /// Connect over TCP and perform the upgrade handshake.
    pub fn connect(host: &str, port: u16, path: &str, config: ClientConfig) -> Result<Self> {
        if config.tls {
            return Err(Error::HandshakeFailed(
                "tls transport must be supplied via handshake_over",
            ));
        }
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true).ok();
        let host_header = format!("{}:{}", host, port);
        Self::handshake_over(stream, &host_header, path, &[], config)
    }
}

impl<S: Read + Write> Client<S> {
    /// Perform the upgrade handshake over an established stream.
    ///
    /// `extra_headers` are appended to the request verbatim. Any bytes the
    /// server sent past the response header are preserved for the reader;
    /// [`Client::pending`] reports how many.
    pub fn handshake_over(
        mut stream: S,
        host: &str,
        path: &str,
        extra_headers: &[(&str, &str)],
        config: ClientConfig,
    ) -> Result<Self> {
        let key = match config.key_fn {
            Some(f) => handshake::encode_key(f()),
            None => handshake::generate_key(),
        };
        let expected = accept_key(&key);

        let request = handshake::build_request(host, path, &key, extra_headers);
        stream.write_all(&request)?;
        stream.flush()?;

        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        let consumed = loop {
            if buf.len() > MAX_RESPONSE_SIZE {
                return Err(Error::RequestTooLarge);
            }
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                return Err(Error::Closed);
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(consumed) = handshake::parse_response(&buf, &expected)? {
                break consumed;
            }
        };

        let provider = config
            .buffer_provider
            .clone()
            .unwrap_or_else(|| BufferProvider::new(2, config.max_size, config.max_size));
        let mut reader = Reader::new(
            config.effective_buffer_size(),
            config.max_size,
            provider,
            Role::Client,
        );
        reader.seed(&buf[consumed..])?;

        debug!(host, path, "client session established");
        Ok(Self {
            stream,
            reader,
            config,
            closed: false,
        })
    }

    /// Bytes buffered past the handshake, waiting for the reader.
    pub fn pending(&self) -> usize {
        self.reader.buffered()
    }

    /// Read the next message, blocking on the stream as needed.
    ///
    /// Control frames are handled internally unless the corresponding
    /// `handle_*` config flag surfaces them. After a close frame is answered,
    /// this returns [`Error::Closed`].
    pub fn read_message(&mut self) -> Result<OwnedMessage> {
        if self.closed {
            return Err(Error::Closed);
        }

        loop {
            let step = {
                let (_, msg) = self.reader.read()?;
                match msg {
                    None => Step::Fill,
                    Some(m) => Step::Deliver(m.kind, m.data.to_vec()),
                }
            };

            match step {
                Step::Fill => {
                    self.reader.fill(&mut self.stream)?;
                }
                Step::Deliver(kind, data) => {
                    self.reader.done();
                    match kind {
                        MessageKind::Ping if !self.config.handle_ping => {
                            self.write_pong(&data)?;
                        }
                        MessageKind::Pong if !self.config.handle_pong => {}
                        MessageKind::Close if !self.config.handle_close => {
                            self.write_close_frame(close_code::NORMAL).ok();
                            self.closed = true;
                            return Err(Error::Closed);
                        }
                        _ => return Ok(OwnedMessage { kind, data }),
                    }
                }
            }
        }
    }

    /// Send a text frame.
    pub fn write_text(&mut self, data: &[u8]) -> Result<()> {
        self.write_frame(OpCode::Text, data)
    }

    /// Send a binary frame.
    pub fn write_bin(&mut self, data: &[u8]) -> Result<()> {
        self.write_frame(OpCode::Binary, data)
    }

    /// Send a ping frame.
    pub fn write_ping(&mut self, data: &[u8]) -> Result<()> {
        self.write_frame(OpCode::Ping, data)
    }

    /// Send a pong frame.
    pub fn write_pong(&mut self, data: &[u8]) -> Result<()> {
        self.write_frame(OpCode::Pong, data)
    }

    /// Send a close frame (code 1000) and mark the session closed.
    pub fn close(&mut self) -> Result<()> {
        self.close_with_code(close_code::NORMAL)
    }

    /// Send a close frame with the given code and mark the session closed.
    pub fn close_with_code(&mut self, code: u16) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.write_close_frame(code);
        self.closed = true;
        result
    }

    /// The underlying stream, e.g. to set socket timeouts.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    fn write_close_frame(&mut self, code: u16) -> Result<()> {
        self.write_frame(OpCode::Close, &code.to_be_bytes())
    }

    /// Frame, mask, and send a payload.
    fn write_frame(&mut self, opcode: OpCode, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let mask = match self.config.mask_fn {
            Some(f) => f(),
            None => generate_mask(),
        };
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, data, true, Some(mask));
        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(())
    }
}
