//! Application handler trait and message dispatch
//!
//! A handler is constructed per connection once the upgrade completes.
//! `init` and `handle_message` are the required surface; the rest default to
//! the library's behavior and can be overridden piecemeal:
//!
//! - `handle_ping` defaults to echoing a pong with the same payload
//! - `handle_pong` defaults to ignoring the frame
//! - `handle_close` defaults to the close-code validation policy below;
//!   overriding it takes over the reply entirely. The connection is closed
//!   after a close frame either way.

use crate::conn::{Conn, CLOSE_INVALID_PAYLOAD, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR};
use crate::error::{Error, Result};
use crate::handshake::HandshakeRequest;
use crate::reader::{Message, MessageKind};

/// Per-connection application callbacks.
pub trait Handler: Send + Sized + 'static {
    /// Application context shared across connections (routing tables,
    /// metrics, database handles). Cloned nowhere; handed to `init` by
    /// reference.
    type Ctx: Send + Sync + 'static;

    /// Construct the handler for an accepted connection.
    ///
    /// An error rejects the upgrade: `handshake_error_response` may supply a
    /// custom HTTP reply, otherwise a generic 400 is sent.
    fn init(req: &HandshakeRequest, conn: &Conn, ctx: &Self::Ctx) -> Result<Self>;

    /// A complete text or binary message arrived.
    fn handle_message(&mut self, conn: &Conn, msg: Message<'_>) -> Result<()>;

    /// Called once after the upgrade reply is on the wire.
    fn after_init(&mut self, _conn: &Conn) -> Result<()> {
        Ok(())
    }

    /// A ping arrived. The default echoes the payload back as a pong.
    fn handle_ping(&mut self, conn: &Conn, data: &[u8]) -> Result<()> {
        conn.write_pong(data)
    }

    /// A pong arrived. Ignored by default.
    fn handle_pong(&mut self) -> Result<()> {
        Ok(())
    }

    /// A close frame arrived. The default validates the payload and replies
    /// per [`close_policy`]; the connection closes afterwards regardless.
    fn handle_close(&mut self, conn: &Conn, data: &[u8]) -> Result<()> {
        close_policy(conn, data)
    }

    /// The connection is going away; last chance to clean up.
    fn on_close(&mut self) {}

    /// Custom HTTP reply for a rejected upgrade (`init` returned an error).
    fn handshake_error_response(_err: &Error) -> Option<Vec<u8>> {
        None
    }
}

/// Route one delivered message to the handler.
///
/// Returns true when the connection must close (a close frame was handled).
pub(crate) fn dispatch<H: Handler>(
    handler: &mut H,
    conn: &Conn,
    msg: Message<'_>,
) -> Result<bool> {
    match msg.kind {
        MessageKind::Text | MessageKind::Binary => {
            handler.handle_message(conn, msg)?;
            Ok(false)
        }
        MessageKind::Ping => {
            handler.handle_ping(conn, msg.data)?;
            Ok(false)
        }
        MessageKind::Pong => {
            handler.handle_pong()?;
            Ok(false)
        }
        MessageKind::Close => {
            handler.handle_close(conn, msg.data)?;
            Ok(true)
        }
    }
}

/// Default close-frame policy (RFC 6455 §7.4, §5.5.1):
///
/// - empty payload → reply close 1000
/// - 1-byte payload → protocol error, reply close 1002
/// - code < 1000, code ∈ {1004, 1005, 1006}, or 1013 < code < 3000 → reply
///   close 1002
/// - non-UTF-8 reason text → reply close 1007
/// - otherwise → reply close 1000
pub fn close_policy(conn: &Conn, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return conn.write_framed(&CLOSE_NORMAL);
    }
    if payload.len() == 1 {
        return conn.write_framed(&CLOSE_PROTOCOL_ERROR);
    }

    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if !is_acceptable_close_code(code) {
        return conn.write_framed(&CLOSE_PROTOCOL_ERROR);
    }

    if payload.len() > 2 && simdutf8::basic::from_utf8(&payload[2..]).is_err() {
        return conn.write_framed(&CLOSE_INVALID_PAYLOAD);
    }

    conn.write_framed(&CLOSE_NORMAL)
}

/// Close codes a peer may legitimately send.
pub fn is_acceptable_close_code(code: u16) -> bool {
    if code < 1000 {
        return false;
    }
    if matches!(code, 1004 | 1005 | 1006) {
        return false;
    }
    // Codes strictly between 1013 and 3000 are unassigned or reserved.
    if (1014..3000).contains(&code) {
        return false;
    }
    true
}
