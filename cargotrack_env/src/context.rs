//! Core environment context trait for CargoTrack sessions.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock and task spawning for the sync engines.
///
/// This trait abstracts the "real world" so that the sync engines can run
/// in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the system clock
/// - **Simulation**: `SimContext` - virtual clock advanced by the harness
///
/// # Determinism
///
/// Every timer the engines rely on (reconnect backoff, poll timeouts,
/// staleness ticks) goes through this trait, so a simulation controls
/// the whole timeline.
#[async_trait]
pub trait TrackingContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for connection transition stamps and timer bookkeeping.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// Server timestamps (`recorded_at`, `last_updated`) are compared
    /// against this clock for staleness and eviction.
    fn system_time(&self) -> SystemTime;

    /// Wall-clock time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Suspends the caller until `duration` has elapsed on this context's clock.
    ///
    /// Under simulation that happens only when the harness moves the clock.
    async fn sleep(&self, duration: Duration);

    /// Runs `future` detached; `name` labels it in logs.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
