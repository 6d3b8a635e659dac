//! Simulation context implementing TrackingContext for deterministic testing.

use async_trait::async_trait;
use cargotrack_env::TrackingContext;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::trace;

/// Simulation context backed by a virtual clock.
///
/// This implements `TrackingContext` using:
/// - A virtual clock that only moves when the harness advances it
/// - Sleeps that suspend until the clock passes their deadline
/// - A log of every requested sleep, so backoff sequences are observable
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    clock: Arc<watch::Sender<u64>>,

    /// Every duration passed to `sleep`, in call order
    sleeps: Arc<Mutex<Vec<Duration>>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        let (clock, _) = watch::channel(0);
        Self {
            seed,
            clock: Arc::new(clock),
            sleeps: Arc::new(Mutex::new(Vec::new())),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Advances virtual time, waking every sleeper whose deadline passed.
    pub fn advance_time(&self, duration: Duration) {
        let now = self.time_ns();
        self.clock.send_replace(now + duration.as_nanos() as u64);
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.clock.borrow()
    }

    /// Wall-clock milliseconds of virtual time 0.
    pub fn epoch_millis(&self) -> u64 {
        self.epoch
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Durations requested through `sleep` so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Clears the sleep log.
    pub fn take_sleeps(&self) -> Vec<Duration> {
        std::mem::take(&mut *self.sleeps.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            clock: Arc::clone(&self.clock),
            sleeps: Arc::clone(&self.sleeps),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl TrackingContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);

        let deadline = self.time_ns() + duration.as_nanos() as u64;
        let mut clock = self.clock.subscribe();
        while *clock.borrow_and_update() < deadline {
            if clock.changed().await.is_err() {
                return;
            }
        }
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        trace!(task = name, at_ns = self.time_ns(), "spawning sim task");
        tokio::spawn(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_sim_context_wall_clock_follows_virtual_time() {
        let ctx = SimContext::new(42);
        let start = ctx.now_millis();
        assert_eq!(start, ctx.epoch_millis());

        ctx.advance_time(Duration::from_secs(2));
        assert_eq!(ctx.now_millis(), start + 2_000);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));

        // Both should see the same time
        assert_eq!(ctx1.now(), ctx2.now());
    }

    #[tokio::test]
    async fn test_sleep_waits_for_virtual_deadline() {
        let ctx = SimContext::shared(7);
        let (tx, mut rx) = tokio::sync::oneshot::channel();

        let sleeper = Arc::clone(&ctx);
        tokio::spawn(async move {
            sleeper.sleep(Duration::from_secs(3)).await;
            let _ = tx.send(sleeper.now());
        });
        tokio::task::yield_now().await;

        ctx.advance_time(Duration::from_secs(2));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(rx.await.unwrap(), Duration::from_secs(3));
        assert_eq!(ctx.sleeps(), vec![Duration::from_secs(3)]);
    }
}
