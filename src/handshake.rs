//! HTTP/1.1 upgrade handshake (RFC 6455 §4)
//!
//! Server side: a pooled [`HandshakeState`] collects request bytes up to a
//! configured cap, [`HandshakeState::parse`] validates the upgrade request,
//! and [`reply`] emits the `101 Switching Protocols` response with the
//! `Sec-WebSocket-Accept` digest.
//!
//! Client side: [`build_request`] writes the upgrade request with a random
//! 16-byte key, and [`parse_response`] verifies the `101` status and the
//! accept digest, reporting how many bytes the response consumed so any
//! surplus can seed the frame reader.

use base64::Engine;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::WS_GUID;

/// Largest header array handed to httparse; the configured cap is applied on
/// top of this hard bound.
const MAX_HEADER_SLOTS: usize = 64;

/// A parsed and validated upgrade request.
///
/// Owned strings so the pooled state can be released before the application
/// handler runs.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// Request path, e.g. `/chat?room=2`
    pub path: String,
    /// `Host` header
    pub host: String,
    /// `Origin` header, when present
    pub origin: Option<String>,
    /// `Sec-WebSocket-Key`, preserved for the accept digest
    pub key: String,
    /// All request headers, names lowercased
    pub headers: Vec<(String, String)>,
}

impl HandshakeRequest {
    /// Look up a header by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Growable request buffer, capped at the configured handshake size.
pub struct HandshakeState {
    buf: Vec<u8>,
    max_size: usize,
    pooled: bool,
}

impl HandshakeState {
    fn new(max_size: usize, pooled: bool) -> Self {
        Self {
            buf: Vec::with_capacity(max_size),
            max_size,
            pooled,
        }
    }

    /// Bytes collected so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append request bytes, enforcing the size cap.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > self.max_size {
            return Err(Error::RequestTooLarge);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Read once from `stream` through `scratch` into the state buffer.
    ///
    /// Returns the number of bytes appended; zero-byte reads surface as
    /// [`Error::Closed`] and a full state as [`Error::RequestTooLarge`].
    pub fn fill_from<S: std::io::Read + ?Sized>(
        &mut self,
        stream: &mut S,
        scratch: &mut [u8],
    ) -> Result<usize> {
        let room = self.max_size - self.buf.len();
        if room == 0 {
            return Err(Error::RequestTooLarge);
        }
        // Read one byte past the cap so an oversized request is detected by
        // push() instead of stalling at exactly max_size.
        let window = scratch.len().min(room + 1);
        let n = stream.read(&mut scratch[..window])?;
        if n == 0 {
            return Err(Error::Closed);
        }
        self.push(&scratch[..n])?;
        Ok(n)
    }

    /// Try to parse the collected bytes as a complete upgrade request.
    ///
    /// Returns `Ok(None)` while the request is still partial; on success the
    /// consumed byte count marks where surplus (overread) bytes begin.
    pub fn parse(&self, max_headers: usize) -> Result<Option<(HandshakeRequest, usize)>> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADER_SLOTS];
        let cap = max_headers.min(MAX_HEADER_SLOTS);
        let mut req = httparse::Request::new(&mut slots[..cap]);

        let consumed = match req.parse(&self.buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(httparse::Error::TooManyHeaders) => return Err(Error::TooManyHeaders),
            Err(httparse::Error::HeaderName) | Err(httparse::Error::HeaderValue) => {
                return Err(Error::InvalidHeader)
            }
            Err(_) => return Err(Error::InvalidRequestLine),
        };

        if req.method != Some("GET") || req.version != Some(1) {
            return Err(Error::InvalidRequestLine);
        }
        let path = req.path.ok_or(Error::InvalidRequestLine)?.to_string();

        let mut host = None;
        let mut origin = None;
        let mut key = None;
        let mut upgrade_ok = false;
        let mut upgrade_seen = false;
        let mut connection_ok = false;
        let mut connection_seen = false;
        let mut version_ok = false;
        let mut version_seen = false;
        let mut headers = Vec::with_capacity(req.headers.len());

        for header in req.headers.iter() {
            let name = header.name.to_ascii_lowercase();
            let value = std::str::from_utf8(header.value).map_err(|_| Error::InvalidHeader)?;

            match name.as_str() {
                "host" => host = Some(value.to_string()),
                "origin" => origin = Some(value.to_string()),
                "sec-websocket-key" => key = Some(value.trim().to_string()),
                "upgrade" => {
                    upgrade_seen = true;
                    upgrade_ok = value
                        .split(',')
                        .any(|t| t.trim().eq_ignore_ascii_case("websocket"));
                }
                "connection" => {
                    connection_seen = true;
                    connection_ok = value
                        .split(',')
                        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
                }
                "sec-websocket-version" => {
                    version_seen = true;
                    version_ok = value.trim() == "13";
                }
                _ => {}
            }
            headers.push((name, value.to_string()));
        }

        if upgrade_seen && !upgrade_ok {
            return Err(Error::InvalidUpgrade);
        }
        if connection_seen && !connection_ok {
            return Err(Error::InvalidConnection);
        }
        if version_seen && !version_ok {
            return Err(Error::InvalidVersion);
        }

        let (host, key) = match (host, key) {
            (Some(h), Some(k)) if upgrade_seen && connection_seen && version_seen => (h, k),
            _ => return Err(Error::MissingHeaders),
        };

        // The key must decode to exactly 16 bytes.
        match base64::engine::general_purpose::STANDARD.decode(&key) {
            Ok(raw) if raw.len() == 16 => {}
            _ => return Err(Error::InvalidHeader),
        }

        Ok(Some((
            HandshakeRequest {
                path,
                host,
                origin,
                key,
                headers,
            },
            consumed,
        )))
    }

    /// Overread bytes past the end of the request, destined for the reader.
    pub fn surplus(&self, consumed: usize) -> &[u8] {
        &self.buf[consumed..]
    }
}

/// Fixed-count pool of handshake states, shared across connections.
///
/// A miss allocates dynamically; dynamic states are discarded on release
/// instead of returned.
pub struct HandshakePool {
    free: Mutex<Vec<HandshakeState>>,
    max_size: usize,
}

impl HandshakePool {
    pub fn new(count: usize, max_size: usize) -> Self {
        let free = (0..count)
            .map(|_| HandshakeState::new(max_size, true))
            .collect();
        Self {
            free: Mutex::new(free),
            max_size,
        }
    }

    pub fn acquire(&self) -> HandshakeState {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| HandshakeState::new(self.max_size, false))
    }

    pub fn release(&self, mut state: HandshakeState) {
        if state.pooled {
            state.buf.clear();
            self.free.lock().push(state);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// Compute the `Sec-WebSocket-Accept` digest:
/// `base64(SHA1(key || GUID))`.
#[inline]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` reply for a validated request.
pub fn reply(key: &str) -> Vec<u8> {
    let accept = accept_key(key);
    let mut buf = BytesMut::with_capacity(130);
    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.to_vec()
}

/// Build a `400 Bad Request` response naming the handshake failure.
pub fn error_response(err: &Error) -> Vec<u8> {
    let body = err.to_string();
    let mut buf = BytesMut::with_capacity(128 + body.len());
    buf.put_slice(b"HTTP/1.1 400 Bad Request\r\n");
    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(b"Content-Type: text/plain\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    buf.put_slice(body.as_bytes());
    buf.to_vec()
}

/// Generate a client handshake key: base64 of 16 bytes from the OS RNG.
pub fn generate_key() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// Encode a fixed 16-byte key (test hook; see `ClientConfig::key_fn`).
pub fn encode_key(raw: [u8; 16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// Build a client upgrade request.
pub fn build_request(
    host: &str,
    path: &str,
    key: &str,
    extra_headers: &[(&str, &str)],
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    for (name, value) in extra_headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.to_vec()
}

/// Parse and verify a server upgrade response (client side).
///
/// Checks the `HTTP/1.1 101` status line, the upgrade headers, and that
/// `Sec-WebSocket-Accept` equals `expected_accept`. Returns the number of
/// bytes the response occupied; anything after that belongs to the frame
/// stream.
pub fn parse_response(buf: &[u8], expected_accept: &str) -> Result<Option<usize>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADER_SLOTS];
    let mut res = httparse::Response::new(&mut slots);

    let consumed = match res.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::HeaderName) | Err(httparse::Error::HeaderValue) => {
            return Err(Error::InvalidHeader)
        }
        Err(_) => return Err(Error::InvalidResponseLine),
    };

    if res.code != Some(101) {
        return Err(Error::InvalidResponseLine);
    }

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut accept = None;

    for header in res.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = std::str::from_utf8(header.value).map_err(|_| Error::InvalidHeader)?;
        match name.as_str() {
            "upgrade" => {
                upgrade_ok = value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("websocket"));
            }
            "connection" => {
                connection_ok = value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
            }
            "sec-websocket-accept" => accept = Some(value.trim()),
            _ => {}
        }
    }

    if !upgrade_ok {
        return Err(Error::HandshakeFailed("missing Upgrade: websocket"));
    }
    if !connection_ok {
        return Err(Error::HandshakeFailed("missing Connection: Upgrade"));
    }
    match accept {
        Some(a) if a == expected_accept => {}
        _ => return Err(Error::InvalidWebsocketAcceptHeader),
    }

    Ok(Some(consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    fn state_with(bytes: &[u8]) -> HandshakeState {
        let mut state = HandshakeState::new(1024, false);
        state.push(bytes).unwrap();
        state
    }

    #[test]
    fn accept_key_rfc_vector() {
        // Test vector from RFC 6455 §1.3
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parse_complete_request() {
        let state = state_with(SAMPLE_REQUEST);
        let (req, consumed) = state.parse(10).unwrap().unwrap();
        assert_eq!(req.path, "/chat");
        assert_eq!(req.host, "server.example.com");
        assert_eq!(req.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(consumed, SAMPLE_REQUEST.len());
        assert_eq!(req.header("upgrade"), Some("websocket"));
    }

    #[test]
    fn parse_partial_request() {
        let state = state_with(b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\n");
        assert!(state.parse(10).unwrap().is_none());
    }

    #[test]
    fn rejects_non_get() {
        let state = state_with(
            b"POST /chat HTTP/1.1\r\n\
            Host: h\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert!(matches!(state.parse(10), Err(Error::InvalidRequestLine)));
    }

    #[test]
    fn rejects_wrong_upgrade() {
        let state = state_with(
            b"GET / HTTP/1.1\r\n\
            Host: h\r\n\
            Upgrade: h2c\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert!(matches!(state.parse(10), Err(Error::InvalidUpgrade)));
    }

    #[test]
    fn rejects_wrong_version() {
        let state = state_with(
            b"GET / HTTP/1.1\r\n\
            Host: h\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 8\r\n\r\n",
        );
        assert!(matches!(state.parse(10), Err(Error::InvalidVersion)));
    }

    #[test]
    fn connection_header_comma_list_tolerated() {
        let state = state_with(
            b"GET / HTTP/1.1\r\n\
            Host: h\r\n\
            Upgrade: websocket\r\n\
            Connection: keep-alive, Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert!(state.parse(10).unwrap().is_some());
    }

    #[test]
    fn rejects_missing_required_headers() {
        let state = state_with(
            b"GET / HTTP/1.1\r\n\
            Host: h\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert!(matches!(state.parse(10), Err(Error::MissingHeaders)));
    }

    #[test]
    fn rejects_bad_key_length() {
        let state = state_with(
            b"GET / HTTP/1.1\r\n\
            Host: h\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: c2hvcnQ=\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert!(matches!(state.parse(10), Err(Error::InvalidHeader)));
    }

    #[test]
    fn rejects_too_many_headers() {
        let mut raw = b"GET / HTTP/1.1\r\nHost: h\r\n".to_vec();
        for i in 0..12 {
            raw.extend_from_slice(format!("X-Filler-{}: v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let state = state_with(&raw);
        assert!(matches!(state.parse(10), Err(Error::TooManyHeaders)));
    }

    #[test]
    fn push_enforces_size_cap() {
        let mut state = HandshakeState::new(64, false);
        state.push(&[b'a'; 60]).unwrap();
        assert!(matches!(
            state.push(&[b'a'; 10]),
            Err(Error::RequestTooLarge)
        ));
    }

    #[test]
    fn pool_recycles_and_discards() {
        let pool = HandshakePool::new(2, 1024);
        assert_eq!(pool.free_count(), 2);

        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire(); // dynamic
        assert_eq!(pool.free_count(), 0);

        pool.release(c);
        assert_eq!(pool.free_count(), 0);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn released_state_is_cleared() {
        let pool = HandshakePool::new(1, 1024);
        let mut s = pool.acquire();
        s.push(b"GET").unwrap();
        pool.release(s);
        assert!(pool.acquire().is_empty());
    }

    #[test]
    fn reply_format() {
        let out = reply("dGhlIHNhbXBsZSBub25jZQ==");
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn error_response_names_failure() {
        let out = error_response(&Error::InvalidVersion);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("unsupported Sec-WebSocket-Version"));
    }

    #[test]
    fn client_request_parses_on_server() {
        let key = generate_key();
        let raw = build_request("example.com", "/live", &key, &[("X-Token", "abc")]);
        let state = state_with(&raw);
        let (req, consumed) = state.parse(10).unwrap().unwrap();
        assert_eq!(req.path, "/live");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.key, key);
        assert_eq!(req.header("x-token"), Some("abc"));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn response_verifies_accept_digest() {
        // Accept derived from the fixed 16-byte key {1..16}.
        let key = encode_key([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let expected = accept_key(&key);
        assert_eq!(expected, "C/0nmHhBztSRGR1CwL6Tf4ZjwpY=");

        let raw = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-Websocket-Accept: {}\r\n\r\n",
            expected
        );
        let consumed = parse_response(raw.as_bytes(), &expected).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn response_rejects_mutated_accept() {
        let key = encode_key([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let expected = accept_key(&key);
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: D/0nmHhBztSRGR1CwL6Tf4ZjwpY=\r\n\r\n";
        assert!(matches!(
            parse_response(raw, &expected),
            Err(Error::InvalidWebsocketAcceptHeader)
        ));
    }

    #[test]
    fn response_rejects_non_101() {
        let raw = b"HTTP/1.1 400 Bad Request\r\n\r\n";
        assert!(matches!(
            parse_response(raw, "x"),
            Err(Error::InvalidResponseLine)
        ));
    }

    #[test]
    fn response_surplus_preserved() {
        let key = generate_key();
        let expected = accept_key(&key);
        let mut raw = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            expected
        )
        .into_bytes();
        let header_len = raw.len();
        raw.extend_from_slice(b"Some Random Data Which is Part Of the Next Message");

        let consumed = parse_response(&raw, &expected).unwrap().unwrap();
        assert_eq!(consumed, header_len);
        assert_eq!(raw.len() - consumed, 50);
    }

    #[test]
    fn generated_keys_decode_to_16_bytes() {
        let key = generate_key();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(raw.len(), 16);
    }
}
