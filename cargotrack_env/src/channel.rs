//! Push channel abstraction for live tracking events.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{ChannelFrame, EntityId};

/// A persistent, bidirectional event connection to the tracking backend.
///
/// # Implementations
///
/// - **Production**: a WebSocket / socket.io style client
/// - **Simulation**: `SimPushChannel`, channel-based with scripted faults
///
/// # Frame Flow
///
/// ```text
/// Session                    Channel                    Backend
///   |                           |                          |
///   |-- send_subscribe(id) ---->|------------------------->|
///   |                           |<-- location / status ----|
///   |<-- recv() -> frame -------|                          |
///   |                           |<-- (connection lost) ----|
///   |<-- recv() -> Dropped -----|                          |
/// ```
///
/// The wire protocol is opaque to the engines: event payloads arrive as
/// raw bytes and are decoded by `cargotrack_core::wire`.
#[async_trait]
pub trait PushChannel: Send + Sync + 'static {
    /// Performs the channel handshake.
    ///
    /// # Returns
    /// * `Ok(())` - Channel established
    /// * `Err(EnvError)` - Handshake failed; the caller decides whether to retry
    async fn connect(&self) -> Result<(), EnvError>;

    /// Tears the channel down. Idempotent.
    async fn disconnect(&self);

    /// Queues a subscribe message for an entity.
    ///
    /// Fire-and-forget: success means the message was queued, not that the
    /// backend acknowledged it.
    fn send_subscribe(&self, entity: &EntityId) -> Result<(), EnvError>;

    /// Queues an unsubscribe message for an entity. Fire-and-forget.
    fn send_unsubscribe(&self, entity: &EntityId) -> Result<(), EnvError>;

    /// Receives the next frame from the channel.
    ///
    /// # Returns
    /// * `Some(frame)` - An event payload or a drop notification
    /// * `None` - The channel was closed for good (shutdown)
    async fn recv(&self) -> Option<ChannelFrame>;
}

/// Fault injection for push channels in simulation.
pub trait ChannelController: Send + Sync {
    /// Severs the live connection; the channel reports `Dropped`.
    fn drop_connection(&self, reason: &str);

    /// Makes the next `count` handshakes fail.
    fn fail_next_connects(&self, count: u32);

    /// Makes every handshake fail until `heal` is called.
    fn partition(&self);

    /// Removes all injected faults.
    fn heal(&self);
}
