//! The "LINK" Engine - push channel lifecycle with reconnect-with-backoff
//!
//! Owns the single push channel of a session:
//! - `connect()` performs one handshake; failures schedule a retry loop
//! - drops observed by the channel pump go through `handle_drop()`
//! - `disconnect()` tears down and cancels any pending retry
//!
//! Failures never reach the caller. Every transition is published to the
//! registered listeners instead.
//!
//! # Cancellation
//!
//! Each attempt chain is tagged with an epoch. `disconnect()`, a drop and a
//! fresh `connect()` all bump it; a retry loop or an in-flight handshake
//! that wakes up under an old epoch gives up silently.

use cargotrack_env::{EnvError, PushChannel, TrackingContext};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::BackoffConfig;

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection state owned by the manager.
///
/// `retry_count` is reset only by a successful transition into `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,

    /// Consecutive failures since the last successful handshake
    pub retry_count: u32,

    /// Context time of the last transition
    pub last_transition_at: Duration,
}

/// Published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub status: ConnectionStatus,

    pub retry_count: u32,

    /// Context time of the transition
    pub at: Duration,

    /// Delay before the next attempt, when one is scheduled
    pub next_retry_in: Option<Duration>,

    /// Why the channel went down, if it did
    pub reason: Option<String>,
}

impl ConnectionEvent {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

// ============================================================================
// LISTENERS
// ============================================================================

type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Registration returned by [`ConnectionManager::on_connection_change`].
#[must_use = "keep the handle to be able to unsubscribe the listener"]
pub struct ListenerHandle {
    id: u64,
    set: Weak<Mutex<ListenerSet>>,
}

impl ListenerHandle {
    /// Removes the listener. A no-op once the manager is gone.
    pub fn unsubscribe(self) {
        if let Some(set) = self.set.upgrade() {
            lock(&set).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// CONNECTION MANAGER (The Engine)
// ============================================================================

struct Inner {
    state: ConnectionState,
    epoch: u64,
}

struct Shared<Ctx, Ch> {
    ctx: Arc<Ctx>,
    channel: Arc<Ch>,
    backoff: BackoffConfig,
    inner: Mutex<Inner>,
    listeners: Arc<Mutex<ListenerSet>>,
}

enum AttemptOutcome {
    Connected,
    Failed,
    Cancelled,
}

/// Lifecycle owner of one push channel.
///
/// Cheap to clone; clones share the same state, listeners and channel.
pub struct ConnectionManager<Ctx, Ch>
where
    Ctx: TrackingContext,
    Ch: PushChannel,
{
    shared: Arc<Shared<Ctx, Ch>>,
}

impl<Ctx, Ch> Clone for ConnectionManager<Ctx, Ch>
where
    Ctx: TrackingContext,
    Ch: PushChannel,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Ctx, Ch> ConnectionManager<Ctx, Ch>
where
    Ctx: TrackingContext,
    Ch: PushChannel,
{
    pub fn new(ctx: Arc<Ctx>, channel: Arc<Ch>, backoff: BackoffConfig) -> Self {
        let now = ctx.now();
        Self {
            shared: Arc::new(Shared {
                ctx,
                channel,
                backoff,
                inner: Mutex::new(Inner {
                    state: ConnectionState {
                        status: ConnectionStatus::Disconnected,
                        retry_count: 0,
                        last_transition_at: now,
                    },
                    epoch: 0,
                }),
                listeners: Arc::new(Mutex::new(ListenerSet::default())),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state().status == ConnectionStatus::Connected
    }

    /// The channel this manager drives.
    pub fn channel(&self) -> &Arc<Ch> {
        &self.shared.channel
    }

    /// Registers a listener invoked synchronously on every transition.
    ///
    /// A panicking listener is logged and skipped; later listeners still
    /// receive the event.
    pub fn on_connection_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let mut set = lock(&self.shared.listeners);
        let id = set.next_id;
        set.next_id += 1;
        set.entries.push((id, Arc::new(listener)));

        ListenerHandle {
            id,
            set: Arc::downgrade(&self.shared.listeners),
        }
    }

    /// Establishes the channel. No-op while `Connecting` or `Connected`.
    ///
    /// Suspends until the first handshake resolves. On failure a retry loop
    /// is scheduled in the background and this call returns.
    pub async fn connect(&self) {
        let Some(epoch) = self.begin_attempt(None) else {
            return;
        };

        if let AttemptOutcome::Failed = self.attempt(epoch).await {
            self.spawn_retry_loop(epoch);
        }
    }

    /// Tears the channel down and cancels any pending retry. Idempotent.
    pub async fn disconnect(&self) {
        let event = {
            let mut inner = lock(&self.shared.inner);
            inner.epoch += 1;
            if inner.state.status == ConnectionStatus::Disconnected {
                None
            } else {
                Some(self.transition(&mut inner, ConnectionStatus::Disconnected, None, None))
            }
        };

        self.shared.channel.disconnect().await;

        if let Some(event) = event {
            info!("push channel disconnected by request");
            self.notify(&event);
        }
    }

    /// Reports a drop observed on a live channel and schedules reconnection.
    ///
    /// Ignored unless currently `Connected`.
    pub fn handle_drop(&self, reason: &str) {
        let (epoch, event) = {
            let mut inner = lock(&self.shared.inner);
            if inner.state.status != ConnectionStatus::Connected {
                debug!(reason, "drop reported while not connected; ignored");
                return;
            }
            inner.epoch += 1;
            inner.state.retry_count += 1;
            let delay = self.shared.backoff.delay_for(inner.state.retry_count);
            let event = self.transition(
                &mut inner,
                ConnectionStatus::Disconnected,
                Some(delay),
                Some(reason.to_string()),
            );
            (inner.epoch, event)
        };

        info!(reason, retry_in_ms = event.next_retry_in.map(|d| d.as_millis() as u64), "push channel dropped");
        self.notify(&event);
        self.spawn_retry_loop(epoch);
    }

    /// Moves `Disconnected -> Connecting`.
    ///
    /// With `expected_epoch = None` a new attempt chain starts (cancelling
    /// any sleeping retry loop); otherwise the chain must still be current.
    fn begin_attempt(&self, expected_epoch: Option<u64>) -> Option<u64> {
        let (epoch, event) = {
            let mut inner = lock(&self.shared.inner);
            if inner.state.status != ConnectionStatus::Disconnected {
                return None;
            }
            match expected_epoch {
                None => inner.epoch += 1,
                Some(epoch) if epoch != inner.epoch => return None,
                Some(_) => {}
            }
            let event = self.transition(&mut inner, ConnectionStatus::Connecting, None, None);
            (inner.epoch, event)
        };

        self.notify(&event);
        Some(epoch)
    }

    async fn attempt(&self, epoch: u64) -> AttemptOutcome {
        let result = self.handshake().await;

        let (outcome, event) = {
            let mut inner = lock(&self.shared.inner);
            if inner.epoch != epoch || inner.state.status != ConnectionStatus::Connecting {
                (AttemptOutcome::Cancelled, None)
            } else {
                match &result {
                    Ok(()) => {
                        inner.state.retry_count = 0;
                        let event = self.transition(&mut inner, ConnectionStatus::Connected, None, None);
                        (AttemptOutcome::Connected, Some(event))
                    }
                    Err(e) => {
                        inner.state.retry_count += 1;
                        let delay = self.shared.backoff.delay_for(inner.state.retry_count);
                        let event = self.transition(
                            &mut inner,
                            ConnectionStatus::Disconnected,
                            Some(delay),
                            Some(e.to_string()),
                        );
                        (AttemptOutcome::Failed, Some(event))
                    }
                }
            }
        };

        match (&outcome, &result) {
            (AttemptOutcome::Cancelled, Ok(())) => {
                // Superseded while the handshake was in flight
                self.shared.channel.disconnect().await;
            }
            (AttemptOutcome::Connected, _) => info!("push channel connected"),
            (AttemptOutcome::Failed, Err(e)) => debug!(error = %e, "push channel handshake failed"),
            _ => {}
        }

        if let Some(event) = event {
            self.notify(&event);
        }
        outcome
    }

    async fn handshake(&self) -> Result<(), EnvError> {
        let timeout = self.shared.backoff.connect_timeout;
        tokio::select! {
            biased;
            result = self.shared.channel.connect() => result,
            _ = self.shared.ctx.sleep(timeout) => Err(EnvError::timeout(timeout)),
        }
    }

    fn spawn_retry_loop(&self, epoch: u64) {
        let this = self.clone();
        self.shared.ctx.spawn("push-reconnect", async move {
            this.retry_loop(epoch).await;
        });
    }

    async fn retry_loop(&self, epoch: u64) {
        loop {
            let delay = {
                let inner = lock(&self.shared.inner);
                if inner.epoch != epoch {
                    return;
                }
                self.shared.backoff.delay_for(inner.state.retry_count)
            };

            debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            self.shared.ctx.sleep(delay).await;

            if self.begin_attempt(Some(epoch)).is_none() {
                return;
            }
            match self.attempt(epoch).await {
                AttemptOutcome::Failed => continue,
                AttemptOutcome::Connected | AttemptOutcome::Cancelled => return,
            }
        }
    }

    fn transition(
        &self,
        inner: &mut Inner,
        status: ConnectionStatus,
        next_retry_in: Option<Duration>,
        reason: Option<String>,
    ) -> ConnectionEvent {
        let at = self.shared.ctx.now();
        inner.state.status = status;
        inner.state.last_transition_at = at;

        ConnectionEvent {
            status,
            retry_count: inner.state.retry_count,
            at,
            next_retry_in,
            reason,
        }
    }

    fn notify(&self, event: &ConnectionEvent) {
        // Snapshot so listeners may (un)register without deadlocking
        let listeners: Vec<Listener> = lock(&self.shared.listeners)
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(status = ?event.status, "connection listener panicked");
            }
        }
    }
}
