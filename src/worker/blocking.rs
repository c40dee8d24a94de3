//! Blocking worker: accept loop plus one OS thread per connection
//!
//! Each connection thread performs the handshake under the configured
//! deadline, constructs the application handler, then alternates
//! `reader.fill` with message draining until the peer closes or errors.
//! Shutdown closes every live socket (per policy) and the threads exit
//! through their read errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use super::{drain_messages, reject_handshake, reject_upgrade, teardown_on_error, ConnList};
use crate::buffer::BufferProvider;
use crate::config::Config;
use crate::conn::Conn;
use crate::error::{close_code, Error, Result};
use crate::handler::Handler;
use crate::handshake::{self, HandshakePool, HandshakeRequest, HandshakeState};
use crate::reader::{Reader, Role};
use crate::server::ShutdownSignal;
use crate::stream::Listener;

/// How long the shutdown drain waits for connection threads.
const DRAIN_WAIT: Duration = Duration::from_secs(5);

struct Shared<H: Handler> {
    config: Config,
    ctx: H::Ctx,
    provider: BufferProvider,
    hs_pool: HandshakePool,
    conns: Mutex<ConnList<Conn>>,
    change: Condvar,
    signal: Arc<ShutdownSignal>,
}

pub(crate) fn run<H: Handler>(
    listener: Listener,
    config: Config,
    ctx: H::Ctx,
    signal: Arc<ShutdownSignal>,
) -> Result<()> {
    let shared = Arc::new(Shared::<H> {
        provider: config.buffer_provider(),
        hs_pool: HandshakePool::new(config.handshake.pool_count, config.handshake.max_size),
        conns: Mutex::new(ConnList::new()),
        change: Condvar::new(),
        signal,
        ctx,
        config,
    });

    loop {
        // Admission cap: hold accept until closures free a slot.
        {
            let mut conns = shared.conns.lock();
            while conns.len() >= shared.config.max_conn && !shared.signal.is_set() {
                shared
                    .change
                    .wait_for(&mut conns, Duration::from_millis(250));
            }
        }
        if shared.signal.is_set() {
            break;
        }

        let stream = match listener.accept() {
            Ok(s) => s,
            Err(e) => {
                if shared.signal.is_set() {
                    break;
                }
                error!(error = %e, "accept failed");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };
        if shared.signal.is_set() {
            // The wakeup dial lands here; nothing to serve.
            break;
        }

        let conn = Conn::new(stream, false);
        let token = shared.conns.lock().insert(conn.clone());

        let thread_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name("wharf-conn".to_string())
            .spawn(move || connection_thread::<H>(thread_shared, conn, token));

        if let Err(e) = spawned {
            error!(error = %e, "connection thread spawn failed");
            if let Some(conn) = shared.conns.lock().remove(token) {
                conn.close();
            }
        }
    }

    shutdown_drain(&shared);
    Ok(())
}

fn connection_thread<H: Handler>(shared: Arc<Shared<H>>, conn: Conn, token: usize) {
    serve::<H>(&shared, &conn);
    shared.conns.lock().remove(token);
    shared.change.notify_all();
}

fn serve<H: Handler>(shared: &Shared<H>, conn: &Conn) {
    let deadline = shared
        .config
        .handshake
        .timeout
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let mut state = shared.hs_pool.acquire();
    let (req, consumed) = match read_handshake(shared, conn, &mut state, deadline) {
        Ok(pair) => pair,
        Err(err) => {
            shared.hs_pool.release(state);
            reject_handshake(conn, &err);
            return;
        }
    };

    let mut handler = match H::init(&req, conn, &shared.ctx) {
        Ok(h) => h,
        Err(err) => {
            shared.hs_pool.release(state);
            reject_upgrade::<H>(conn, &err);
            return;
        }
    };

    if let Err(err) = conn.write_framed(&handshake::reply(&req.key)) {
        shared.hs_pool.release(state);
        teardown_on_error(conn, &err);
        return;
    }

    let mut reader = Reader::new(
        shared.config.effective_buffer_size(),
        shared.config.max_message_size,
        shared.provider.clone(),
        Role::Server,
    );
    let seeded = reader.seed(state.surplus(consumed));
    shared.hs_pool.release(state);
    if let Err(err) = seeded {
        teardown_on_error(conn, &err);
        return;
    }

    // The handshake deadline no longer applies.
    conn.stream().set_read_timeout(None).ok();

    if let Err(err) = handler.after_init(conn) {
        teardown_on_error(conn, &err);
        handler.on_close();
        return;
    }

    debug!(peer = conn.peer(), path = %req.path, "connection open");

    match read_loop(conn, &mut reader, &mut handler) {
        Ok(()) => {
            conn.close();
        }
        Err(err) => teardown_on_error(conn, &err),
    }

    if !shared.signal.is_set() || shared.config.shutdown.notify_handler {
        handler.on_close();
    }
    debug!(peer = conn.peer(), "connection closed");
}

fn read_handshake<H: Handler>(
    shared: &Shared<H>,
    conn: &Conn,
    state: &mut HandshakeState,
    deadline: Option<Instant>,
) -> Result<(HandshakeRequest, usize)> {
    let mut scratch = [0u8; 1024];
    let mut stream_ref = conn.stream();

    loop {
        if let Some(d) = deadline {
            let now = Instant::now();
            if now >= d {
                return Err(Error::Timeout);
            }
            conn.stream().set_read_timeout(Some(d - now)).ok();
        }

        match state.fill_from(&mut stream_ref, &mut scratch) {
            Ok(_) => {}
            // A blocking read past its SO_RCVTIMEO surfaces as WouldBlock.
            Err(Error::WouldBlock) | Err(Error::Timeout) => return Err(Error::Timeout),
            Err(e) => return Err(e),
        }

        if let Some(pair) = state.parse(shared.config.handshake.max_headers)? {
            return Ok(pair);
        }
    }
}

fn read_loop<H: Handler>(conn: &Conn, reader: &mut Reader, handler: &mut H) -> Result<()> {
    let mut stream_ref = conn.stream();
    loop {
        if drain_messages(reader, conn, handler)? {
            return Ok(());
        }
        reader.fill(&mut stream_ref)?;
    }
}

fn shutdown_drain<H: Handler>(shared: &Shared<H>) {
    let live: Vec<Conn> = shared.conns.lock().iter().cloned().collect();
    debug!(count = live.len(), "shutdown drain");

    let policy = &shared.config.shutdown;
    for conn in live {
        if policy.notify_client {
            conn.write_close_with_code(close_code::GOING_AWAY).ok();
        }
        if policy.close_socket {
            conn.close();
        }
    }

    if policy.close_socket {
        let waited = Instant::now();
        let mut conns = shared.conns.lock();
        while conns.len() > 0 && waited.elapsed() < DRAIN_WAIT {
            shared
                .change
                .wait_for(&mut conns, Duration::from_millis(100));
        }
        if conns.len() > 0 {
            error!(count = conns.len(), "connection threads still draining");
        }
    }
}
