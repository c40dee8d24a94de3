//! # Wharf-WS: WebSocket endpoint library
//!
//! An RFC 6455 server and client built around three pieces of hard machinery:
//!
//! - **Protocol state machine**: incremental frame parsing with
//!   fragmentation, control-frame interleaving, and client-side masking
//! - **Buffer discipline**: per-connection static buffers, a recycled pool of
//!   large buffers for oversize messages, and a capped heap fallback
//! - **Dual worker model**: a blocking thread-per-connection worker and a
//!   readiness-driven (epoll/kqueue) worker backed by a thread pool, both
//!   driving the same reader and handler machinery
//!
//! TLS, signal handling, and configuration loading are deliberately outside
//! the core: streams plug in through the [`stream::Transport`] trait and
//! applications through the [`Handler`] trait.
//!
//! ## Server example
//!
//! ```ignore
//! use wharf_ws::{Config, Conn, Handler, HandshakeRequest, Message, Server};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     type Ctx = ();
//!
//!     fn init(_req: &HandshakeRequest, _conn: &Conn, _ctx: &()) -> wharf_ws::Result<Self> {
//!         Ok(Echo)
//!     }
//!
//!     fn handle_message(&mut self, conn: &Conn, msg: Message<'_>) -> wharf_ws::Result<()> {
//!         conn.write_text(msg.data)
//!     }
//! }
//!
//! let server = Server::<Echo>::bind(Config::builder().port(9223).build(), ())?;
//! server.run()?;
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod mask;
pub mod reader;
pub mod server;
pub mod stream;
pub mod worker;

pub use buffer::{BorrowedBuffer, BufferProvider};
pub use client::{Client, OwnedMessage};
pub use config::{ClientConfig, Config, ConfigBuilder, WorkerMode};
pub use conn::Conn;
pub use error::{Error, Result};
pub use frame::OpCode;
pub use handler::Handler;
pub use handshake::HandshakeRequest;
pub use reader::{Message, MessageKind, Reader, Role};
pub use server::{Server, ShutdownHandle};

/// WebSocket GUID appended to the key before hashing (RFC 6455 §1.3)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload expressible in the base length byte
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload expressible with the 16-bit extended length
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Maximum control-frame payload (RFC 6455 §5.5)
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::Client;
    pub use crate::config::{ClientConfig, Config, WorkerMode};
    pub use crate::conn::Conn;
    pub use crate::error::{Error, Result};
    pub use crate::handler::Handler;
    pub use crate::handshake::HandshakeRequest;
    pub use crate::reader::{Message, MessageKind};
    pub use crate::server::Server;
}
