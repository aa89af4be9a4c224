//! Broker core: owns the listening socket, the session store, the topic
//! tree, and the background tasks (retry scanner, keep-alive scanner,
//! session-expiry scanner, stats publisher, and a platform-conditional
//! memory scanner).
//!
//! Everything here runs on a single `LocalSet` — there is one event
//! loop thread, so every shared structure is `Rc<RefCell<_>>` rather
//! than an `Arc`/`DashMap`/`parking_lot` pairing. `Session` and
//! `ConnectionHandle` never own each other, only the client identifier
//! that links them, to avoid a reference cycle.

pub mod connection;
pub mod handle;
mod router;
mod sys_topics;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

use crate::auth::AuthProvider;
use crate::config::Config;
use crate::hooks::{Hooks, InterceptorChain, NoopHooks};
use crate::session::SessionStore;
use crate::topic::{RetainedStore, SubscriptionStore};

pub use connection::ConnectionTask;
pub use handle::{BrokerHandle, BrokerStats};

/// A live connection's outbound half, as registered in [`BrokerCore`]'s
/// connection table. `sender` feeds packets to the connection task's
/// write loop; closing it (dropping the sender) tells that task to shut
/// its socket down.
pub struct ConnectionHandle {
    pub sender: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    /// Set by a caller that is forcibly evicting this connection
    /// (session takeover, administrative disconnect) *before* dropping
    /// the entry from [`BrokerCore::connections`]. The connection task
    /// checks this once its outbound channel closes to decide whether
    /// the teardown is the kind that suppresses will publication
    /// (takeover) versus one that doesn't (keep-alive timeout,
    /// socket error), which it can't otherwise distinguish from the
    /// channel closing alone.
    pub suppress_will: Rc<Cell<bool>>,
    /// Unique per-insertion token. A new CONNECT for the same client id
    /// inserts its own handle (and token) before the evicted task wakes
    /// up and runs its teardown; the evicted task must only remove the
    /// connections-table entry if it still holds *this* token, otherwise
    /// it would delete the newer connection's handle out from under it.
    pub token: u64,
}

static NEXT_CONNECTION_TOKEN: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Allocates a fresh, process-unique token for a [`ConnectionHandle`].
pub fn next_connection_token() -> u64 {
    NEXT_CONNECTION_TOKEN.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// Cumulative counters behind the `$SYS/*` topics and [`BrokerHandle::stats`].
#[derive(Default)]
pub struct Counters {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub publish_received: u64,
    pub publish_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub clients_total: u64,
}

/// The broker's shared state, reachable from every connection task and
/// background task on the same `LocalSet` via `Rc<RefCell<BrokerCore>>`.
pub struct BrokerCore {
    pub config: Config,
    pub sessions: SessionStore,
    pub subscriptions: RefCell<SubscriptionStore>,
    pub retained: RefCell<RetainedStore>,
    pub connections: RefCell<HashMap<Arc<str>, ConnectionHandle>>,
    pub auth: Rc<dyn AuthProvider>,
    pub hooks: Rc<dyn Hooks>,
    pub interceptors: InterceptorChain,
    pub counters: RefCell<Counters>,
    pub start_time: Instant,
}

impl BrokerCore {
    fn new(config: Config, auth: Rc<dyn AuthProvider>, hooks: Rc<dyn Hooks>, interceptors: InterceptorChain) -> Self {
        let max_subs = config.limits.max_subscriptions_per_client;
        let max_retained = config.limits.max_retained_messages;
        Self {
            subscriptions: RefCell::new(SubscriptionStore::new(max_subs)),
            retained: RefCell::new(RetainedStore::new(max_retained)),
            connections: RefCell::new(HashMap::new()),
            sessions: SessionStore::new(),
            auth,
            hooks,
            interceptors,
            counters: RefCell::new(Counters::default()),
            start_time: Instant::now(),
            config,
        }
    }

    pub fn connected_client_count(&self) -> usize {
        self.connections.borrow().len()
    }
}

/// Builds and runs the broker. Construction is separate from `run` so a
/// caller (tests, `main`) can wire up collaborators before binding the
/// listening socket.
pub struct Broker {
    config: Config,
    auth: Rc<dyn AuthProvider>,
    hooks: Rc<dyn Hooks>,
    interceptors: InterceptorChain,
}

impl Broker {
    /// Builds a broker with the given auth provider; `hooks` default to
    /// [`NoopHooks`] and the interceptor pipeline starts empty.
    pub fn new(config: Config, auth: Rc<dyn AuthProvider>) -> Self {
        Self {
            config,
            auth,
            hooks: Rc::new(NoopHooks),
            interceptors: InterceptorChain::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Rc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Runs the broker to completion on a `current_thread` runtime's
    /// `LocalSet`, returning once `shutdown` carries `true`. Intended to
    /// be awaited from inside `tokio::task::LocalSet::run_until`.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        self.run_with_handle(shutdown, None).await
    }

    /// Like [`Broker::run`], but also delivers a [`BrokerHandle`] over
    /// `handle_tx` as soon as the broker's shared state exists — before
    /// the listening socket necessarily has any connections — so a
    /// caller can start issuing management queries immediately.
    pub async fn run_with_handle(
        self,
        shutdown: watch::Receiver<bool>,
        handle_tx: Option<tokio::sync::oneshot::Sender<BrokerHandle>>,
    ) -> std::io::Result<()> {
        let bind_addr = self.config.server.socket_addr();
        let listener = TcpListener::bind(bind_addr).await?;
        info!(%bind_addr, "broker listening");

        let core = Rc::new(BrokerCore::new(self.config, self.auth, self.hooks, self.interceptors));
        if let Some(tx) = handle_tx {
            let _ = tx.send(BrokerHandle::new(core.clone()));
        }

        let local = LocalSet::new();
        local.spawn_local(spawn_background_tasks(core.clone(), shutdown.clone()));

        let mut shutdown_accept = shutdown;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let core = core.clone();
                            local.spawn_local(async move {
                                if let Err(e) = ConnectionTask::new(stream, addr, core).run().await {
                                    debug!(%addr, error = %e, "connection closed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_accept.changed() => {
                    if *shutdown_accept.borrow() {
                        info!("broker shutting down");
                        break;
                    }
                }
            }
        }

        local.await;
        Ok(())
    }
}

/// Spawns the retry/keep-alive/expiry/stats/memory background tasks
/// each a `spawn_local` loop selecting between its
/// own ticker and the shared shutdown signal.
async fn spawn_background_tasks(core: Rc<BrokerCore>, shutdown: watch::Receiver<bool>) {
    let local = LocalSet::new();

    local.spawn_local(retry_scanner(core.clone(), shutdown.clone()));
    local.spawn_local(keep_alive_scanner(core.clone(), shutdown.clone()));
    local.spawn_local(session_expiry_scanner(core.clone(), shutdown.clone()));
    if core.config.mqtt.sys_topics_enabled {
        local.spawn_local(sys_topics::spawn_stats_publisher(core.clone(), shutdown.clone()));
    }
    #[cfg(target_os = "linux")]
    local.spawn_local(memory_scanner(core, shutdown));
    #[cfg(not(target_os = "linux"))]
    drop((core, shutdown));

    local.await;
}

async fn retry_scanner(core: Rc<BrokerCore>, mut shutdown: watch::Receiver<bool>) {
    let interval = core.config.timing.qos_retry_interval();
    let max_retries = core.config.timing.qos_max_retries;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => router::scan_retries(&core, interval, max_retries),
            _ = shutdown.changed() => if *shutdown.borrow() { break },
        }
    }
}

async fn keep_alive_scanner(core: Rc<BrokerCore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let factor = core.config.timing.keep_alive_factor;
                let no_keepalive = core.config.timing.no_keepalive_timeout();
                let expired: Vec<Arc<str>> = core
                    .sessions
                    .client_ids()
                    .into_iter()
                    .filter(|id| {
                        core.sessions
                            .get(id)
                            .map(|s| {
                                let s = s.borrow();
                                s.connected && s.keep_alive_expired(factor, no_keepalive)
                            })
                            .unwrap_or(false)
                    })
                    .collect();
                for client_id in expired {
                    if core.connections.borrow_mut().remove(&client_id).is_some() {
                        warn!(%client_id, "keep-alive timeout");
                    }
                }
            }
            _ = shutdown.changed() => if *shutdown.borrow() { break },
        }
    }
}

async fn session_expiry_scanner(core: Rc<BrokerCore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expiry = core.config.timing.session_expiry();
                for client_id in core.sessions.expire_offline(expiry) {
                    core.subscriptions.borrow_mut().unsubscribe_all(&client_id);
                    debug!(%client_id, "session expired");
                }
            }
            _ = shutdown.changed() => if *shutdown.borrow() { break },
        }
    }
}

#[cfg(target_os = "linux")]
async fn memory_scanner(core: Rc<BrokerCore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    const LOW_MEMORY_THRESHOLD_BYTES: u64 = 8 * 1024 * 1024;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some((free, used)) = read_proc_statm() {
                    if free < LOW_MEMORY_THRESHOLD_BYTES {
                        warn!(free_bytes = free, used_bytes = used, "low memory");
                    }
                }
            }
            _ = shutdown.changed() => if *shutdown.borrow() { break },
        }
    }
}

#[cfg(target_os = "linux")]
fn read_proc_statm() -> Option<(u64, u64)> {
    let page_size = 4096u64;
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let mut fields = statm.split_whitespace();
    let total_pages: u64 = fields.next()?.parse().ok()?;
    let resident_pages: u64 = fields.next()?.parse().ok()?;
    let used = resident_pages * page_size;
    let total = total_pages * page_size;
    Some((total.saturating_sub(used), used))
}
