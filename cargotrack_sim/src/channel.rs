//! Simulated push channel with fault injection.

use async_trait::async_trait;
use cargotrack_env::{ChannelController, ChannelFrame, EntityId, EnvError, PushChannel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A control message the session sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Subscribe(EntityId),
    Unsubscribe(EntityId),
}

#[derive(Debug, Default)]
struct ChannelState {
    connected: bool,

    /// Handshakes left to refuse
    fail_next: u32,

    partitioned: bool,

    connect_attempts: u64,

    drops: u64,

    messages: Vec<ChannelMessage>,
}

fn lock(state: &Mutex<ChannelState>) -> MutexGuard<'_, ChannelState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated push channel for one session.
pub struct SimPushChannel {
    state: Arc<Mutex<ChannelState>>,

    /// Receiver for incoming frames (behind tokio mutex for async)
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelFrame>>,
}

impl SimPushChannel {
    /// Creates a channel together with the controller that drives it.
    pub fn pair() -> (Arc<Self>, SimChannelController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ChannelState::default()));

        let channel = Arc::new(Self {
            state: Arc::clone(&state),
            rx: tokio::sync::Mutex::new(rx),
        });
        (channel, SimChannelController { state, tx })
    }

    /// Non-blocking receive for step-driven harnesses.
    pub fn try_recv(&self) -> Option<ChannelFrame> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }
}

#[async_trait]
impl PushChannel for SimPushChannel {
    async fn connect(&self) -> Result<(), EnvError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;

        if state.partitioned {
            return Err(EnvError::unavailable("partitioned"));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(EnvError::unavailable("handshake refused"));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) {
        lock(&self.state).connected = false;
    }

    fn send_subscribe(&self, entity: &EntityId) -> Result<(), EnvError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(EnvError::network("channel not connected"));
        }
        state.messages.push(ChannelMessage::Subscribe(entity.clone()));
        Ok(())
    }

    fn send_unsubscribe(&self, entity: &EntityId) -> Result<(), EnvError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(EnvError::network("channel not connected"));
        }
        state.messages.push(ChannelMessage::Unsubscribe(entity.clone()));
        Ok(())
    }

    async fn recv(&self) -> Option<ChannelFrame> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}

/// Backend side of a [`SimPushChannel`]: fault injection and event delivery.
#[derive(Clone)]
pub struct SimChannelController {
    state: Arc<Mutex<ChannelState>>,
    tx: mpsc::UnboundedSender<ChannelFrame>,
}

impl SimChannelController {
    /// Delivers a location event. Events sent while disconnected are lost.
    pub fn push_location(&self, payload: Vec<u8>) -> bool {
        self.deliver(ChannelFrame::Location(payload))
    }

    /// Delivers a status event. Events sent while disconnected are lost.
    pub fn push_status(&self, payload: Vec<u8>) -> bool {
        self.deliver(ChannelFrame::Status(payload))
    }

    fn deliver(&self, frame: ChannelFrame) -> bool {
        if !lock(&self.state).connected {
            return false;
        }
        self.tx.send(frame).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// All subscribe/unsubscribe messages so far.
    pub fn messages(&self) -> Vec<ChannelMessage> {
        lock(&self.state).messages.clone()
    }

    /// Drains the message log.
    pub fn take_messages(&self) -> Vec<ChannelMessage> {
        std::mem::take(&mut lock(&self.state).messages)
    }

    pub fn connect_attempts(&self) -> u64 {
        lock(&self.state).connect_attempts
    }

    pub fn drops(&self) -> u64 {
        lock(&self.state).drops
    }
}

impl ChannelController for SimChannelController {
    fn drop_connection(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            if !state.connected {
                return;
            }
            state.connected = false;
            state.drops += 1;
        }
        let _ = self.tx.send(ChannelFrame::Dropped {
            reason: reason.to_string(),
        });
    }

    fn fail_next_connects(&self, count: u32) {
        lock(&self.state).fail_next = count;
    }

    fn partition(&self) {
        lock(&self.state).partitioned = true;
    }

    fn heal(&self) {
        let mut state = lock(&self.state);
        state.partitioned = false;
        state.fail_next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EntityId {
        EntityId::from(s)
    }

    #[tokio::test]
    async fn test_scripted_handshake_failures() {
        let (channel, controller) = SimPushChannel::pair();
        controller.fail_next_connects(2);

        assert!(channel.connect().await.is_err());
        assert!(channel.connect().await.is_err());
        assert!(channel.connect().await.is_ok());
        assert_eq!(controller.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_partition_until_healed() {
        let (channel, controller) = SimPushChannel::pair();
        controller.partition();
        assert!(channel.connect().await.is_err());
        controller.heal();
        assert!(channel.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_emits_frame_and_disconnects() {
        let (channel, controller) = SimPushChannel::pair();
        channel.connect().await.unwrap();

        controller.drop_connection("reset");
        assert!(!channel.is_connected());
        assert_eq!(
            channel.try_recv(),
            Some(ChannelFrame::Dropped { reason: "reset".into() })
        );

        // Second drop while down is a no-op
        controller.drop_connection("reset");
        assert_eq!(channel.try_recv(), None);
        assert_eq!(controller.drops(), 1);
    }

    #[tokio::test]
    async fn test_messages_logged_only_while_connected() {
        let (channel, controller) = SimPushChannel::pair();
        assert!(channel.send_subscribe(&id("A")).is_err());

        channel.connect().await.unwrap();
        channel.send_subscribe(&id("A")).unwrap();
        channel.send_unsubscribe(&id("A")).unwrap();

        assert_eq!(
            controller.take_messages(),
            vec![
                ChannelMessage::Subscribe(id("A")),
                ChannelMessage::Unsubscribe(id("A"))
            ]
        );
    }

    #[tokio::test]
    async fn test_events_lost_while_disconnected() {
        let (channel, controller) = SimPushChannel::pair();
        assert!(!controller.push_location(b"{}".to_vec()));

        channel.connect().await.unwrap();
        assert!(controller.push_location(b"{}".to_vec()));
        assert_eq!(channel.recv().await, Some(ChannelFrame::Location(b"{}".to_vec())));
    }
}
