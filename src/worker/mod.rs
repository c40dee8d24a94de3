//! Worker models driving accepted connections
//!
//! Two interchangeable implementations share the connection machinery here:
//! [`blocking`] runs one OS thread per connection; [`nonblocking`] runs a
//! single readiness reactor (epoll/kqueue) over a bounded thread pool.

pub mod blocking;
pub mod nonblocking;

use tracing::{debug, warn};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::handler::{dispatch, Handler};
use crate::handshake;
use crate::reader::Reader;

/// Drain every complete message already buffered in the reader.
///
/// Returns true when a close frame was handled and the connection must go
/// down.
pub(crate) fn drain_messages<H: Handler>(
    reader: &mut Reader,
    conn: &Conn,
    handler: &mut H,
) -> Result<bool> {
    loop {
        let (_, msg) = reader.read()?;
        let Some(msg) = msg else {
            return Ok(false);
        };
        let must_close = dispatch(handler, conn, msg)?;
        reader.done();
        if must_close {
            return Ok(true);
        }
    }
}

/// Tear a connection down after a read-loop error: send the mapped close
/// frame for protocol violations, stay silent on transport failures, and log
/// handler errors.
pub(crate) fn teardown_on_error(conn: &Conn, err: &Error) {
    if let Some(code) = err.close_code() {
        let _ = conn.write_close_with_code(code);
    }
    match err {
        Error::App(_) => warn!(peer = conn.peer(), error = %err, "handler error"),
        e if e.is_transport() => debug!(peer = conn.peer(), error = %e, "transport closed"),
        e => debug!(peer = conn.peer(), error = %e, "protocol error"),
    }
    conn.close();
}

/// Reply to a failed handshake parse with a 400 naming the failure.
pub(crate) fn reject_handshake(conn: &Conn, err: &Error) {
    debug!(peer = conn.peer(), error = %err, "handshake rejected");
    if !matches!(err, Error::Closed | Error::ConnectionReset | Error::BrokenPipe) {
        conn.pre_handoff_write(&handshake::error_response(err));
    }
    conn.close();
}

/// Reply to a handler-rejected upgrade: the handler may supply a custom HTTP
/// response, otherwise a generic 400 goes out.
pub(crate) fn reject_upgrade<H: Handler>(conn: &Conn, err: &Error) {
    debug!(peer = conn.peer(), error = %err, "upgrade rejected by handler");
    let response =
        H::handshake_error_response(err).unwrap_or_else(|| handshake::error_response(err));
    conn.pre_handoff_write(&response);
    conn.close();
}

const NIL: usize = usize::MAX;

struct Node<T> {
    value: Option<T>,
    prev: usize,
    next: usize,
}

/// Connection list: nodes linked by slab indices.
///
/// Index-based prev/next links give intrusive-list removal without raw
/// pointers; freed slots are recycled through an internal free list, so node
/// storage is pooled across connections.
pub(crate) struct ConnList<T> {
    nodes: Vec<Node<T>>,
    free_head: usize,
    head: usize,
    len: usize,
}

impl<T> ConnList<T> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_head: NIL,
            head: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Insert a value built from its own slot index.
    pub fn insert_with(&mut self, build: impl FnOnce(usize) -> T) -> usize {
        let idx = if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.nodes[idx].next;
            idx
        } else {
            self.nodes.push(Node {
                value: None,
                prev: NIL,
                next: NIL,
            });
            self.nodes.len() - 1
        };

        let value = build(idx);
        let old_head = self.head;
        {
            let node = &mut self.nodes[idx];
            node.value = Some(value);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.nodes[old_head].prev = idx;
        }
        self.head = idx;
        self.len += 1;
        idx
    }

    pub fn insert(&mut self, value: T) -> usize {
        self.insert_with(|_| value)
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.nodes.get(idx)?.value.as_ref()
    }

    pub fn remove(&mut self, idx: usize) -> Option<T> {
        let node = self.nodes.get_mut(idx)?;
        let value = node.value.take()?;
        let (prev, next) = (node.prev, node.next);

        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        }

        let node = &mut self.nodes[idx];
        node.prev = NIL;
        node.next = self.free_head;
        self.free_head = idx;
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> ConnListIter<'_, T> {
        ConnListIter {
            list: self,
            cur: self.head,
        }
    }

    /// Unlink every node and return the values (shutdown drain).
    pub fn take_all(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while cur != NIL {
            let node = &mut self.nodes[cur];
            let next = node.next;
            if let Some(v) = node.value.take() {
                out.push(v);
            }
            node.prev = NIL;
            node.next = self.free_head;
            self.free_head = cur;
            cur = next;
        }
        self.head = NIL;
        self.len = 0;
        out
    }
}

pub(crate) struct ConnListIter<'a, T> {
    list: &'a ConnList<T>,
    cur: usize,
}

impl<'a, T> Iterator for ConnListIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.cur == NIL {
            return None;
        }
        let node = &self.list.nodes[self.cur];
        self.cur = node.next;
        node.value.as_ref()
    }
}
