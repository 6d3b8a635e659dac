//! Tracking Runtime - drives a [`TrackingSession`] with an environment context.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   frames    ┌──────────────────────────────────────┐
//! │  PushChannel  │ ──────────► │                                      │
//! │  (pump task)  │             │                                      │
//! └───────────────┘             │            event bus (mpsc)          │
//! ┌───────────────┐  transitions│                  │                   │
//! │ ConnectionMgr │ ──────────► │                  ▼                   │
//! └───────────────┘             │   TrackingSession::handle(ev, now)   │
//! ┌───────────────┐   ticks     │          │               │           │
//! │ ticker task   │ ──────────► │    RenderFrames     PollRequests     │
//! └───────────────┘             │          │               │           │
//! ┌───────────────┐  commands   │          ▼               ▼           │
//! │ RuntimeHandle │ ──────────► │     frame sink     poll tasks ──┐    │
//! └───────────────┘             │                        ▲        │    │
//!                               │                        └─ bus ◄─┘    │
//!                               └──────────────────────────────────────┘
//! ```
//!
//! Every source funnels into one bus consumed by one loop, so the session
//! sees a single ordered timeline.
//!
//! # Usage
//!
//! ```ignore
//! use cargotrack_core::runtime::TrackingRuntime;
//! use cargotrack_env::TokioContext;
//!
//! let (runtime, handle, mut frames) = TrackingRuntime::new(ctx, channel, service, viewer, config);
//! tokio::spawn(runtime.run());
//!
//! handle.select(Some("CARGO-1".into()));
//! while let Some(frame) = frames.recv().await {
//!     draw(frame);
//! }
//! ```

use cargotrack_env::{ChannelFrame, EntityId, EnvError, PushChannel, SessionId, TrackingContext, TrackingService, ViewerIdentity};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, ListenerHandle};
use crate::session::{PollKind, PollRequest, SessionEvent, TrackingSession};
use crate::view_model::RenderFrame;
use crate::wire::PushKind;

enum BusMessage {
    Session(SessionEvent),
    Dropped(String),
    Shutdown,
}

/// User-side commands into a running session.
#[derive(Clone)]
pub struct RuntimeHandle {
    bus: mpsc::UnboundedSender<BusMessage>,
}

impl RuntimeHandle {
    pub fn select(&self, entity: Option<EntityId>) -> bool {
        self.send(BusMessage::Session(SessionEvent::Select(entity)))
    }

    pub fn watch(&self, entity: EntityId) -> bool {
        self.send(BusMessage::Session(SessionEvent::Watch(entity)))
    }

    pub fn unwatch(&self, entity: EntityId) -> bool {
        self.send(BusMessage::Session(SessionEvent::Unwatch(entity)))
    }

    pub fn retry(&self) -> bool {
        self.send(BusMessage::Session(SessionEvent::Retry))
    }

    /// Disconnects and stops the runtime loop.
    pub fn shutdown(&self) -> bool {
        self.send(BusMessage::Shutdown)
    }

    /// False once the runtime is gone.
    fn send(&self, message: BusMessage) -> bool {
        self.bus.send(message).is_ok()
    }
}

/// Async driver of one tracking view.
///
/// Generic over the context, channel and polling service, so the same
/// loop runs against tokio in production or the simulator in tests.
pub struct TrackingRuntime<Ctx, Ch, Svc>
where
    Ctx: TrackingContext,
    Ch: PushChannel,
    Svc: TrackingService,
{
    ctx: Arc<Ctx>,
    channel: Arc<Ch>,
    service: Arc<Svc>,
    connection: ConnectionManager<Ctx, Ch>,
    session: TrackingSession<Ch>,

    bus_tx: mpsc::UnboundedSender<BusMessage>,
    bus_rx: mpsc::UnboundedReceiver<BusMessage>,
    frames: mpsc::UnboundedSender<RenderFrame>,
}

impl<Ctx, Ch, Svc> TrackingRuntime<Ctx, Ch, Svc>
where
    Ctx: TrackingContext,
    Ch: PushChannel,
    Svc: TrackingService,
{
    /// Creates a runtime together with its command handle and frame stream.
    pub fn new(
        ctx: Arc<Ctx>,
        channel: Arc<Ch>,
        service: Arc<Svc>,
        viewer: ViewerIdentity,
        config: SessionConfig,
    ) -> (Self, RuntimeHandle, mpsc::UnboundedReceiver<RenderFrame>) {
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        let connection = ConnectionManager::new(Arc::clone(&ctx), Arc::clone(&channel), config.backoff.clone());
        let session = TrackingSession::new(SessionId::new(), viewer, Arc::clone(&channel), config);

        let handle = RuntimeHandle { bus: bus_tx.clone() };
        let runtime = Self {
            ctx,
            channel,
            service,
            connection,
            session,
            bus_tx,
            bus_rx,
            frames: frames_tx,
        };
        (runtime, handle, frames_rx)
    }

    pub fn connection(&self) -> &ConnectionManager<Ctx, Ch> {
        &self.connection
    }

    /// Runs until [`RuntimeHandle::shutdown`].
    ///
    /// Returns the session so callers can inspect its final state.
    pub async fn run(mut self) -> TrackingSession<Ch> {
        info!(session = %self.session.id(), viewer = %self.session.view().viewer().user_id, "tracking runtime started");

        let listener = self.forward_connectivity();
        self.spawn_pump();
        self.spawn_ticker();

        let connection = self.connection.clone();
        self.ctx.spawn("push-connect", async move {
            connection.connect().await;
        });

        self.publish(vec![self.session.frame()]);

        while let Some(message) = self.bus_rx.recv().await {
            match message {
                BusMessage::Session(event) => {
                    let out = self.session.handle(event, self.ctx.now_millis());
                    for request in out.polls {
                        self.spawn_poll(request);
                    }
                    self.publish(out.frames);
                }
                BusMessage::Dropped(reason) => self.connection.handle_drop(&reason),
                BusMessage::Shutdown => break,
            }
        }

        listener.unsubscribe();
        self.connection.disconnect().await;
        info!(session = %self.session.id(), "tracking runtime stopped");
        self.session
    }

    fn publish(&self, frames: Vec<RenderFrame>) {
        for frame in frames {
            if self.frames.send(frame).is_err() {
                debug!("frame receiver gone");
                return;
            }
        }
    }

    fn forward_connectivity(&self) -> ListenerHandle {
        let bus = self.bus_tx.clone();
        self.connection.on_connection_change(move |event| {
            let _ = bus.send(BusMessage::Session(SessionEvent::Connectivity(event.clone())));
        })
    }

    fn spawn_pump(&self) {
        let channel = Arc::clone(&self.channel);
        let bus = self.bus_tx.clone();

        self.ctx.spawn("push-pump", async move {
            while let Some(frame) = channel.recv().await {
                let message = match frame {
                    ChannelFrame::Location(payload) => BusMessage::Session(SessionEvent::Push {
                        kind: PushKind::Location,
                        payload,
                    }),
                    ChannelFrame::Status(payload) => BusMessage::Session(SessionEvent::Push {
                        kind: PushKind::Status,
                        payload,
                    }),
                    ChannelFrame::Dropped { reason } => BusMessage::Dropped(reason),
                };
                if bus.send(message).is_err() {
                    return;
                }
            }
            debug!("push channel closed");
        });
    }

    fn spawn_ticker(&self) {
        let ctx = Arc::clone(&self.ctx);
        let bus = self.bus_tx.clone();
        let interval = self.session.config().tick_interval;

        self.ctx.spawn("session-ticker", async move {
            loop {
                ctx.sleep(interval).await;
                if bus.send(BusMessage::Session(SessionEvent::Tick)).is_err() {
                    return;
                }
            }
        });
    }

    fn spawn_poll(&self, request: PollRequest) {
        let ctx = Arc::clone(&self.ctx);
        let service = Arc::clone(&self.service);
        let bus = self.bus_tx.clone();
        let timeout = self.session.config().poll_timeout;

        self.ctx.spawn("session-poll", async move {
            let fetch = async {
                match request.kind {
                    PollKind::Detail => service.fetch_tracking_detail(&request.entity).await,
                    PollKind::Progress => service.fetch_route_progress(&request.entity).await,
                }
            };
            let outcome = tokio::select! {
                biased;
                result = fetch => result,
                _ = ctx.sleep(timeout) => Err(EnvError::timeout(timeout)),
            };

            let _ = bus.send(BusMessage::Session(SessionEvent::PollCompleted {
                entity: request.entity,
                epoch: request.epoch,
                kind: request.kind,
                outcome,
            }));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view_model::ViewPhase;
    use async_trait::async_trait;
    use cargotrack_env::ViewerRole;
    use serde_json::json;
    use std::future::Future;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use tokio::time::Instant;

    const EPOCH_MS: u64 = 1_700_000_000_000;

    /// Tokio-timed context whose wall clock follows the paused test clock.
    struct PausedContext {
        start: Instant,
    }

    #[async_trait]
    impl TrackingContext for PausedContext {
        fn now(&self) -> Duration {
            self.start.elapsed()
        }

        fn system_time(&self) -> SystemTime {
            UNIX_EPOCH + Duration::from_millis(EPOCH_MS) + self.start.elapsed()
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }

        fn spawn<F>(&self, _name: &str, future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            tokio::spawn(future);
        }
    }

    struct ScriptedChannel {
        frames: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelFrame>>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushChannel for ScriptedChannel {
        async fn connect(&self) -> Result<(), EnvError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        fn send_subscribe(&self, entity: &EntityId) -> Result<(), EnvError> {
            self.sent.lock().unwrap().push(format!("+{entity}"));
            Ok(())
        }

        fn send_unsubscribe(&self, entity: &EntityId) -> Result<(), EnvError> {
            self.sent.lock().unwrap().push(format!("-{entity}"));
            Ok(())
        }

        async fn recv(&self) -> Option<ChannelFrame> {
            self.frames.lock().await.recv().await
        }
    }

    /// Answers detail polls from a fixture; progress polls never return.
    struct FixtureService {
        detail: Vec<u8>,
    }

    #[async_trait]
    impl TrackingService for FixtureService {
        async fn fetch_tracking_detail(&self, entity: &EntityId) -> Result<Vec<u8>, EnvError> {
            if entity.as_str() == "MISSING" {
                return Err(EnvError::not_found(entity));
            }
            Ok(self.detail.clone())
        }

        async fn fetch_route_progress(&self, _entity: &EntityId) -> Result<Vec<u8>, EnvError> {
            std::future::pending().await
        }
    }

    fn setup() -> (
        TrackingRuntime<PausedContext, ScriptedChannel, FixtureService>,
        RuntimeHandle,
        mpsc::UnboundedReceiver<RenderFrame>,
        mpsc::UnboundedSender<ChannelFrame>,
        Arc<ScriptedChannel>,
    ) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(ScriptedChannel {
            frames: tokio::sync::Mutex::new(frames_rx),
            sent: Mutex::new(Vec::new()),
        });
        let service = Arc::new(FixtureService {
            detail: json!({
                "entity_id": "CARGO-1",
                "status": "in_transit",
                "last_updated": EPOCH_MS,
                "location_history": [
                    {"id": "p1", "latitude": 52.52, "longitude": 13.40, "recorded_at": EPOCH_MS},
                ],
            })
            .to_string()
            .into_bytes(),
        });
        let ctx = Arc::new(PausedContext { start: Instant::now() });

        let (runtime, handle, frames) = TrackingRuntime::new(
            ctx,
            Arc::clone(&channel),
            service,
            ViewerIdentity::new("client-7", ViewerRole::Client),
            SessionConfig::default(),
        );
        (runtime, handle, frames, frames_tx, channel)
    }

    async fn next_frame<F>(frames: &mut mpsc::UnboundedReceiver<RenderFrame>, pred: F) -> RenderFrame
    where
        F: Fn(&RenderFrame) -> bool,
    {
        loop {
            let frame = frames.recv().await.expect("runtime stopped");
            if pred(&frame) {
                return frame;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_loads_then_goes_ready() {
        let (runtime, handle, mut frames, _push, _channel) = setup();
        let task = tokio::spawn(runtime.run());

        handle.select(Some(EntityId::from("CARGO-1")));
        next_frame(&mut frames, |f| f.phase == ViewPhase::Loading).await;
        let ready = next_frame(&mut frames, |f| f.phase == ViewPhase::Ready).await;
        assert_eq!(ready.map.markers.len(), 1);

        handle.shutdown();
        let session = task.await.unwrap();
        assert!(session.snapshot(&EntityId::from("CARGO-1")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_moves_current_marker() {
        let (runtime, handle, mut frames, push, _channel) = setup();
        let task = tokio::spawn(runtime.run());

        handle.select(Some(EntityId::from("CARGO-1")));
        next_frame(&mut frames, |f| f.phase == ViewPhase::Ready).await;

        push.send(ChannelFrame::Location(
            json!({
                "entity_id": "CARGO-1",
                "id": "p2",
                "latitude": 52.40,
                "longitude": 13.06,
                "recorded_at": EPOCH_MS + 5_000,
            })
            .to_string()
            .into_bytes(),
        ))
        .unwrap();

        let frame = next_frame(&mut frames, |f| f.map.markers.len() == 2).await;
        assert_eq!(frame.phase, ViewPhase::Ready);
        assert_eq!(frame.map.route.as_ref().map(|r| r.points.len()), Some(2));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_entity_surfaces_error() {
        let (runtime, handle, mut frames, _push, _channel) = setup();
        let task = tokio::spawn(runtime.run());

        handle.select(Some(EntityId::from("MISSING")));
        let frame = next_frame(&mut frames, |f| f.phase.is_error()).await;
        assert_eq!(frame.selected, Some(EntityId::from("MISSING")));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_reconnects_and_resubscribes() {
        let (runtime, handle, mut frames, push, channel) = setup();
        let task = tokio::spawn(runtime.run());

        handle.select(Some(EntityId::from("CARGO-1")));
        next_frame(&mut frames, |f| f.phase == ViewPhase::Ready && f.connectivity.is_connected()).await;

        push.send(ChannelFrame::Dropped { reason: "reset".into() }).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        handle.shutdown();
        let session = task.await.unwrap();

        let subscribes = channel.sent.lock().unwrap().iter().filter(|m| *m == "+CARGO-1").count();
        assert_eq!(subscribes, 2);
        assert!(session.registry().is_subscribed(&EntityId::from("CARGO-1")));
    }
}
