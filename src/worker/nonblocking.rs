//! Nonblocking worker: readiness reactor plus a bounded thread pool
//!
//! One reactor thread owns the connection list and waits on the platform
//! readiness primitive (epoll on Linux, kqueue on BSD/macOS, via `polling`).
//! Delivery is oneshot: an event parks the socket until a pool worker
//! finishes with the connection and rearms it, so at most one worker ever
//! holds a given connection.
//!
//! Workers push dead connections onto a reap list and poke the reactor; only
//! the reactor removes entries, deregisters sockets, and resumes a paused
//! accept loop once the admission cap clears.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use polling::{Event, Events, Poller};
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

const KEY_LISTENER: usize = 0;
/// Key 1 is reserved for the shutdown wakeup (delivered via `Poller::notify`,
/// which carries no event); connection keys start above it.
const KEY_BASE: usize = 2;

enum ConnState<H: Handler> {
    /// Upgrade in progress; bytes accumulate in the pooled state across
    /// wakeups until the request completes or the deadline passes.
    Handshake {
        state: HandshakeState,
        deadline: Option<Instant>,
    },
    Open {
        reader: Reader,
        handler: H,
    },
    Closed,
}

struct ConnEntry<H: Handler> {
    key: usize,
    conn: Conn,
    state: Mutex<ConnState<H>>,
}

struct NbShared<H: Handler> {
    config: Config,
    ctx: H::Ctx,
    provider: BufferProvider,
    hs_pool: HandshakePool,
    poller: Arc<Poller>,
    reap: Mutex<Vec<usize>>,
    signal: Arc<ShutdownSignal>,
}

impl<H: Handler> NbShared<H> {
    /// Re-enable readiness for a connection; the single point that does.
    fn rearm(&self, entry: &ConnEntry<H>) {
        if let Err(e) = self
            .poller
            .modify(entry.conn.stream(), Event::readable(entry.key))
        {
            debug!(peer = entry.conn.peer(), error = %e, "rearm failed");
            entry.conn.close();
            self.retire(entry.key);
        }
    }

    /// Hand a dead connection back to the reactor for list removal.
    fn retire(&self, key: usize) {
        self.reap.lock().push(key);
        self.poller.notify().ok();
    }
}

struct PoolInner<H: Handler> {
    jobs: VecDeque<Arc<ConnEntry<H>>>,
    stop: bool,
}

/// Bounded dispatch queue between the reactor and the pool workers.
struct PoolQueue<H: Handler> {
    inner: Mutex<PoolInner<H>>,
    jobs_cv: Condvar,
    space_cv: Condvar,
    backlog: usize,
}

impl<H: Handler> PoolQueue<H> {
    fn new(backlog: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                jobs: VecDeque::new(),
                stop: false,
            }),
            jobs_cv: Condvar::new(),
            space_cv: Condvar::new(),
            backlog: backlog.max(1),
        }
    }

    /// Enqueue a readiness event; blocks the reactor at the backlog bound so
    /// oneshot wakeups are never dropped.
    fn push(&self, entry: Arc<ConnEntry<H>>) {
        let mut inner = self.inner.lock();
        while inner.jobs.len() >= self.backlog && !inner.stop {
            self.space_cv.wait(&mut inner);
        }
        if inner.stop {
            return;
        }
        inner.jobs.push_back(entry);
        self.jobs_cv.notify_one();
    }

    fn pop(&self) -> Option<Arc<ConnEntry<H>>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(job) = inner.jobs.pop_front() {
                self.space_cv.notify_one();
                return Some(job);
            }
            if inner.stop {
                return None;
            }
            self.jobs_cv.wait(&mut inner);
        }
    }

    fn stop(&self) {
        self.inner.lock().stop = true;
        self.jobs_cv.notify_all();
        self.space_cv.notify_all();
    }
}

pub(crate) fn run<H: Handler>(
    listener: Listener,
    config: Config,
    ctx: H::Ctx,
    signal: Arc<ShutdownSignal>,
) -> Result<()> {
    listener.set_nonblocking(true)?;
    let poller = Arc::new(Poller::new()?);
    signal.set_poller(Arc::clone(&poller));

    let shared = Arc::new(NbShared::<H> {
        provider: config.buffer_provider(),
        hs_pool: HandshakePool::new(config.handshake.pool_count, config.handshake.max_size),
        poller: Arc::clone(&poller),
        reap: Mutex::new(Vec::new()),
        signal,
        ctx,
        config,
    });

    let queue = Arc::new(PoolQueue::<H>::new(shared.config.thread_pool.backlog));
    let mut workers = Vec::with_capacity(shared.config.thread_pool.count.max(1));
    for i in 0..shared.config.thread_pool.count.max(1) {
        let queue = Arc::clone(&queue);
        let worker_shared = Arc::clone(&shared);
        workers.push(
            std::thread::Builder::new()
                .name(format!("wharf-pool-{}", i))
                .spawn(move || {
                    let mut scratch =
                        vec![0u8; worker_shared.config.thread_pool.buffer_size.max(512)];
                    while let Some(entry) = queue.pop() {
                        service(&worker_shared, &entry, &mut scratch);
                    }
                })?,
        );
    }

    // SAFETY: the listener outlives its registration; it is deleted from the
    // poller before `run` returns and drops it.
    unsafe {
        poller.add(&listener, Event::readable(KEY_LISTENER))?;
    }

    let mut conns: ConnList<Arc<ConnEntry<H>>> = ConnList::new();
    let mut events = Events::new();
    let mut listener_paused = false;

    while !shared.signal.is_set() {
        events.clear();
        if let Err(e) = poller.wait(&mut events, None) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "reactor wait failed");
            break;
        }

        reap(&shared, &mut conns);
        if listener_paused && conns.len() < shared.config.max_conn {
            listener_paused = false;
            poller
                .modify(&listener, Event::readable(KEY_LISTENER))
                .ok();
        }

        for ev in events.iter() {
            if ev.key == KEY_LISTENER {
                listener_paused = accept_drain(&shared, &listener, &mut conns);
            } else if let Some(idx) = ev.key.checked_sub(KEY_BASE) {
                if let Some(entry) = conns.get(idx) {
                    queue.push(Arc::clone(entry));
                }
            }
        }
    }

    // Stop the pool first so no worker still holds an entry lock, then apply
    // the shutdown policy to whatever is left.
    queue.stop();
    for worker in workers {
        worker.join().ok();
    }
    reap(&shared, &mut conns);

    let policy = shared.config.shutdown.clone();
    for entry in conns.take_all() {
        poller.delete(entry.conn.stream()).ok();
        {
            let mut st = entry.state.lock();
            if let ConnState::Open { handler, .. } = &mut *st {
                if policy.notify_client {
                    entry
                        .conn
                        .write_close_with_code(close_code::GOING_AWAY)
                        .ok();
                }
                if policy.notify_handler {
                    handler.on_close();
                }
            }
            let old = std::mem::replace(&mut *st, ConnState::Closed);
            if let ConnState::Handshake { state, .. } = old {
                shared.hs_pool.release(state);
            }
        }
        if policy.close_socket {
            entry.conn.close();
        }
    }
    poller.delete(&listener).ok();
    Ok(())
}

/// Remove reaped connections from the list. Only the reactor thread mutates
/// the list, so no lock guards it.
fn reap<H: Handler>(shared: &NbShared<H>, conns: &mut ConnList<Arc<ConnEntry<H>>>) {
    let dead: Vec<usize> = std::mem::take(&mut *shared.reap.lock());
    for key in dead {
        if let Some(idx) = key.checked_sub(KEY_BASE) {
            if let Some(entry) = conns.remove(idx) {
                shared.poller.delete(entry.conn.stream()).ok();
                debug!(peer = entry.conn.peer(), "connection reaped");
            }
        }
    }
}

/// Drain the accept queue until `WouldBlock`; returns true when accepting is
/// paused at the admission cap (listener left disarmed).
fn accept_drain<H: Handler>(
    shared: &NbShared<H>,
    listener: &Listener,
    conns: &mut ConnList<Arc<ConnEntry<H>>>,
) -> bool {
    loop {
        if conns.len() >= shared.config.max_conn {
            return true;
        }

        match listener.accept() {
            Ok(stream) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    debug!(error = %e, "set_nonblocking failed");
                    continue;
                }
                let conn = Conn::new(stream, true);
                let deadline = shared
                    .config
                    .handshake
                    .timeout
                    .map(|secs| Instant::now() + Duration::from_secs(secs));
                let state = shared.hs_pool.acquire();

                let idx = conns.insert_with(|idx| {
                    Arc::new(ConnEntry {
                        key: idx + KEY_BASE,
                        conn: conn.clone(),
                        state: Mutex::new(ConnState::Handshake { state, deadline }),
                    })
                });
                let entry = conns.get(idx).unwrap();

                // SAFETY: the socket stays open until the entry is removed
                // and deleted from the poller (reap or shutdown drain).
                let added = unsafe {
                    shared
                        .poller
                        .add(entry.conn.stream(), Event::readable(entry.key))
                };
                if let Err(e) = added {
                    debug!(error = %e, "register failed");
                    if let Some(entry) = conns.remove(idx) {
                        let old =
                            std::mem::replace(&mut *entry.state.lock(), ConnState::Closed);
                        if let ConnState::Handshake { state, .. } = old {
                            shared.hs_pool.release(state);
                        }
                        entry.conn.close();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                shared
                    .poller
                    .modify(listener, Event::readable(KEY_LISTENER))
                    .ok();
                return false;
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                shared
                    .poller
                    .modify(listener, Event::readable(KEY_LISTENER))
                    .ok();
                return false;
            }
        }
    }
}

/// Pool-worker entry point: progress one connection as far as the socket
/// allows, then rearm it (or retire it).
///
/// The oneshot delivery guarantees no other worker holds this entry, so the
/// state lock is uncontended.
fn service<H: Handler>(shared: &NbShared<H>, entry: &ConnEntry<H>, scratch: &mut [u8]) {
    let mut guard = entry.state.lock();

    loop {
        match &mut *guard {
            ConnState::Closed => return,

            ConnState::Handshake { state, deadline } => {
                let deadline = *deadline;
                let outcome = progress_handshake(shared, entry, state, deadline, scratch);
                match outcome {
                    HsProgress::Pending => {
                        shared.rearm(entry);
                        return;
                    }
                    HsProgress::Complete { req, surplus } => {
                        match upgrade::<H>(shared, &entry.conn, &req, &surplus) {
                            Some((reader, handler)) => {
                                let old = std::mem::replace(
                                    &mut *guard,
                                    ConnState::Open { reader, handler },
                                );
                                if let ConnState::Handshake { state, .. } = old {
                                    shared.hs_pool.release(state);
                                }
                                // Fall through to drain the seeded bytes.
                                continue;
                            }
                            None => {
                                let old = std::mem::replace(&mut *guard, ConnState::Closed);
                                if let ConnState::Handshake { state, .. } = old {
                                    shared.hs_pool.release(state);
                                }
                                shared.retire(entry.key);
                                return;
                            }
                        }
                    }
                    HsProgress::Failed(err) => {
                        reject_handshake(&entry.conn, &err);
                        let old = std::mem::replace(&mut *guard, ConnState::Closed);
                        if let ConnState::Handshake { state, .. } = old {
                            shared.hs_pool.release(state);
                        }
                        shared.retire(entry.key);
                        return;
                    }
                }
            }

            ConnState::Open { reader, handler } => {
                let mut dead = false;
                let mut stream_ref = entry.conn.stream();
                loop {
                    match drain_messages(reader, &entry.conn, handler) {
                        Ok(true) => {
                            entry.conn.close();
                            handler.on_close();
                            dead = true;
                            break;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            teardown_on_error(&entry.conn, &err);
                            handler.on_close();
                            dead = true;
                            break;
                        }
                    }
                    match reader.fill(&mut stream_ref) {
                        Ok(_) => continue,
                        Err(Error::WouldBlock) => break,
                        Err(err) => {
                            teardown_on_error(&entry.conn, &err);
                            handler.on_close();
                            dead = true;
                            break;
                        }
                    }
                }

                if dead {
                    *guard = ConnState::Closed;
                    shared.retire(entry.key);
                } else {
                    shared.rearm(entry);
                }
                return;
            }
        }
    }
}

enum HsProgress {
    Pending,
    Complete {
        req: HandshakeRequest,
        surplus: Vec<u8>,
    },
    Failed(Error),
}

/// Read handshake bytes until the request completes or the socket drains.
///
/// Mirrors the blocking handshake logic, breaking out on `WouldBlock`; the
/// deadline is checked against the wall clock after each partial read.
fn progress_handshake<H: Handler>(
    shared: &NbShared<H>,
    entry: &ConnEntry<H>,
    state: &mut HandshakeState,
    deadline: Option<Instant>,
    scratch: &mut [u8],
) -> HsProgress {
    let mut stream_ref = entry.conn.stream();
    loop {
        match state.fill_from(&mut stream_ref, scratch) {
            Ok(_) => {
                if deadline.map_or(false, |d| Instant::now() >= d) {
                    return HsProgress::Failed(Error::Timeout);
                }
                match state.parse(shared.config.handshake.max_headers) {
                    Ok(Some((req, consumed))) => {
                        return HsProgress::Complete {
                            req,
                            surplus: state.surplus(consumed).to_vec(),
                        };
                    }
                    Ok(None) => continue,
                    Err(err) => return HsProgress::Failed(err),
                }
            }
            Err(Error::WouldBlock) => return HsProgress::Pending,
            Err(err) => return HsProgress::Failed(err),
        }
    }
}

/// Construct the handler, send the 101 reply, and build the seeded reader.
/// Failure replies are written here; `None` means the connection is done.
fn upgrade<H: Handler>(
    shared: &NbShared<H>,
    conn: &Conn,
    req: &HandshakeRequest,
    surplus: &[u8],
) -> Option<(Reader, H)> {
    let mut handler = match H::init(req, conn, &shared.ctx) {
        Ok(h) => h,
        Err(err) => {
            reject_upgrade::<H>(conn, &err);
            return None;
        }
    };

    if let Err(err) = conn.write_framed(&handshake::reply(&req.key)) {
        debug!(peer = conn.peer(), error = %err, "upgrade reply failed");
        conn.close();
        return None;
    }

    let mut reader = Reader::new(
        shared.config.effective_buffer_size(),
        shared.config.max_message_size,
        shared.provider.clone(),
        Role::Server,
    );
    if let Err(err) = reader.seed(surplus) {
        teardown_on_error(conn, &err);
        return None;
    }

    if let Err(err) = handler.after_init(conn) {
        teardown_on_error(conn, &err);
        handler.on_close();
        return None;
    }

    debug!(peer = conn.peer(), path = %req.path, "connection open");
    Some((reader, handler))
}
