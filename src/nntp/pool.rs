//! Bounded NNTP connection pool with pipelined slot reuse.
//!
//! The pool hands out [`Slot`]s: a slot is one unit of pipeline capacity on
//! one live session, so a pool of `max_connections` sessions with pipeline
//! depth P serves up to `max_connections × P` concurrent fetches over a
//! much smaller number of sockets.
//!
//! Sessions are dialed lazily. An `acquire` that finds the slot queue empty
//! starts a background dial (as long as the live count is under the cap)
//! and then waits on the queue; whichever arrives first (a slot released
//! by another fetch, or the freshly dialed session's slots) serves the
//! waiter. If a released slot wins, the pending dial is cancelled
//! cooperatively: a dial that has not yet touched the network aborts and
//! gives its live reservation back, one that already connected publishes
//! its slots for future acquires.
//!
//! Failed fetches classify the error: protocol and payload errors release
//! the slot (the link is fine), transport errors retire the whole session.
//! A permanent dial failure latches the pool fatal and wakes every waiter,
//! since a pool that cannot dial can make no progress.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::session::Session;
use super::{NntpError, ServerConfig};

/// Sizing knobs for a [`Pool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum number of concurrently live sessions
    pub max_connections: usize,
    /// Outstanding fetches allowed per session
    pub pipeline_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 20,
            pipeline_depth: 10,
        }
    }
}

/// Attempts for one logical dial; transient socket errors retry in between.
const DIAL_ATTEMPTS: u32 = 3;
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Point-in-time pool counters, served by the diagnostics endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    /// Live (dialing or ready) sessions
    pub live_connections: usize,
    /// Slots currently parked in the queue
    pub idle_slots: usize,
    /// Configured session cap
    pub max_connections: usize,
    /// Configured per-session pipeline depth
    pub pipeline_depth: usize,
}

/// One unit of pipeline capacity on a live session.
///
/// Obtained from [`Pool::acquire`]; must go back through
/// [`Pool::release`] or [`Pool::retire`] after the fetch.
pub struct Slot {
    session: Arc<Session>,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("session", &Arc::as_ptr(&self.session))
            .finish()
    }
}

impl Slot {
    /// Fetch one article body on this slot's session.
    pub async fn fetch_body(&self, group: &str, message_id: &str) -> Result<Vec<u8>, NntpError> {
        self.session.fetch_body(group, message_id).await
    }
}

struct Inner {
    server: ServerConfig,
    cfg: PoolConfig,
    live: Mutex<LiveState>,
    slots_tx: mpsc::Sender<Slot>,
    slots_rx: tokio::sync::Mutex<mpsc::Receiver<Slot>>,
    idle: AtomicUsize,
    fatal: Mutex<Option<String>>,
    fatal_token: CancellationToken,
}

struct LiveState {
    count: usize,
    next_session_id: usize,
}

/// Bounded pool of pipelined NNTP sessions.
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    /// Create an empty pool; no connection is dialed until the first
    /// [`Pool::acquire`].
    pub fn new(server: ServerConfig, cfg: PoolConfig) -> Pool {
        let capacity = (cfg.max_connections * cfg.pipeline_depth).max(1);
        let (slots_tx, slots_rx) = mpsc::channel(capacity);
        Pool {
            inner: Arc::new(Inner {
                server,
                cfg,
                live: Mutex::new(LiveState {
                    count: 0,
                    next_session_id: 0,
                }),
                slots_tx,
                slots_rx: tokio::sync::Mutex::new(slots_rx),
                idle: AtomicUsize::new(0),
                fatal: Mutex::new(None),
                fatal_token: CancellationToken::new(),
            }),
        }
    }

    /// Take a slot, dialing a new session in the background if the queue is
    /// empty and the cap allows. Blocks at the cap until a fetch releases.
    ///
    /// # Errors
    ///
    /// Returns the latched dial error once the pool has gone fatal.
    pub async fn acquire(&self) -> Result<Slot, NntpError> {
        loop {
            if let Some(slot) = self.try_pop().await {
                return Ok(slot);
            }
            if let Some(message) = self.fatal_message() {
                return Err(fatal_error(message));
            }

            let dial_cancel = self.maybe_spawn_dial();

            let popped = {
                let mut rx = self.inner.slots_rx.lock().await;
                tokio::select! {
                    slot = rx.recv() => slot,
                    _ = self.inner.fatal_token.cancelled() => None,
                }
            };
            // a released slot beat the dial: stand the dialer down before
            // it spends a socket nobody is waiting for
            if let Some(cancel) = dial_cancel {
                cancel.cancel();
            }

            match popped {
                Some(slot) => {
                    self.inner.idle.fetch_sub(1, Ordering::Relaxed);
                    if slot.session.is_broken() {
                        self.retire(slot);
                        continue;
                    }
                    return Ok(slot);
                }
                None => {
                    let message = self
                        .fatal_message()
                        .unwrap_or_else(|| "connection pool shut down".into());
                    return Err(fatal_error(message));
                }
            }
        }
    }

    /// Return a healthy slot to the queue.
    pub fn release(&self, slot: Slot) {
        if slot.session.is_broken() {
            self.retire(slot);
            return;
        }
        self.push_slot(slot);
    }

    /// Drop a broken slot: close its session and free a live position.
    ///
    /// Safe to call for several slots of the same session; the live count
    /// only drops on the first.
    pub fn retire(&self, slot: Slot) {
        slot.session.close();
        if slot.session.mark_retired() {
            debug!(session = slot.session.id(), "retiring NNTP session");
            let mut live = lock_unpoisoned(&self.inner.live);
            live.count -= 1;
        }
    }

    /// The latched permanent dial failure, if the pool has gone fatal.
    ///
    /// A fatal pool rejects every `acquire`; drivers use this to surface
    /// the underlying cause once instead of once per segment.
    pub fn fatal(&self) -> Option<NntpError> {
        self.fatal_message().map(fatal_error)
    }

    /// Current counters for diagnostics.
    pub fn stats(&self) -> PoolStats {
        let live = lock_unpoisoned(&self.inner.live).count;
        PoolStats {
            live_connections: live,
            idle_slots: self.inner.idle.load(Ordering::Relaxed),
            max_connections: self.inner.cfg.max_connections,
            pipeline_depth: self.inner.cfg.pipeline_depth,
        }
    }

    async fn try_pop(&self) -> Option<Slot> {
        let mut rx = self.inner.slots_rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(slot) => {
                    self.inner.idle.fetch_sub(1, Ordering::Relaxed);
                    if slot.session.is_broken() {
                        self.retire(slot);
                        continue;
                    }
                    return Some(slot);
                }
                Err(_) => return None,
            }
        }
    }

    fn push_slot(&self, slot: Slot) {
        self.inner.idle.fetch_add(1, Ordering::Relaxed);
        if self.inner.slots_tx.try_send(slot).is_err() {
            // capacity equals the total slot population, so this is
            // unreachable unless the receiver is gone during shutdown
            self.inner.idle.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Reserve a live position and start dialing in the background.
    ///
    /// Returns the dial's cancellation token when a dial was started, or
    /// `None` when the pool is already at its cap.
    fn maybe_spawn_dial(&self) -> Option<CancellationToken> {
        let session_id;
        {
            let mut live = lock_unpoisoned(&self.inner.live);
            if live.count >= self.inner.cfg.max_connections {
                return None;
            }
            live.count += 1;
            session_id = live.next_session_id;
            live.next_session_id += 1;
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            dial_task(inner, session_id, task_cancel).await;
        });
        Some(cancel)
    }

    fn fatal_message(&self) -> Option<String> {
        lock_unpoisoned(&self.inner.fatal).clone()
    }
}

/// The fatal latch stores only a message; waiters that observe it after
/// the fact get it back as a transport error.
fn fatal_error(message: String) -> NntpError {
    NntpError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        message,
    ))
}

/// Background dial: connect, authenticate, and publish the session's
/// pipeline slots. Honors cancellation only before touching the network;
/// a dial that lost the race after connecting still publishes its slots.
async fn dial_task(inner: Arc<Inner>, session_id: usize, cancel: CancellationToken) {
    if cancel.is_cancelled() {
        let mut live = lock_unpoisoned(&inner.live);
        live.count -= 1;
        return;
    }

    let mut attempt = 0;
    let session = loop {
        attempt += 1;
        match Session::connect(&inner.server, session_id, inner.cfg.pipeline_depth).await {
            Ok(session) => break session,
            Err(e) if is_transient(&e) && attempt < DIAL_ATTEMPTS => {
                warn!(session = session_id, attempt, error = %e, "transient dial failure, retrying");
                tokio::time::sleep(DIAL_RETRY_DELAY).await;
            }
            Err(e) => {
                error!(addr = %inner.server.addr(), error = %e, "could not establish NNTP connection");
                {
                    let mut live = lock_unpoisoned(&inner.live);
                    live.count -= 1;
                }
                let mut fatal = lock_unpoisoned(&inner.fatal);
                if fatal.is_none() {
                    *fatal = Some(e.to_string());
                }
                drop(fatal);
                inner.fatal_token.cancel();
                return;
            }
        }
    };

    for _ in 0..inner.cfg.pipeline_depth {
        inner.idle.fetch_add(1, Ordering::Relaxed);
        if inner
            .slots_tx
            .try_send(Slot {
                session: Arc::clone(&session),
            })
            .is_err()
        {
            inner.idle.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Transient in the `net.Temporary` sense: worth an immediate retry.
fn is_transient(err: &NntpError) -> bool {
    match err {
        NntpError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::Interrupted
        ),
        _ => false,
    }
}

/// Mutex poisoning only happens after a panic elsewhere; propagating it
/// here would just cascade the panic, so take the data as-is.
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
