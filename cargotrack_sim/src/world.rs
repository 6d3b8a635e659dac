//! SimWorld - The simulation harness container.
//!
//! Drives one [`TrackingSession`] step by step on a virtual clock. The
//! connection manager runs for real (its retry loop is a spawned task that
//! sleeps on the [`SimContext`] clock); everything else is pumped
//! synchronously so a seed fully determines the run.

use crate::channel::{SimChannelController, SimPushChannel};
use crate::context::SimContext;
use crate::fleet::Fleet;
use crate::service::SimTrackingService;

use cargotrack_core::{
    ConnectionEvent, ConnectionManager, ListenerHandle, PollKind, PollRequest, PushKind, RenderFrame, SessionConfig,
    SessionEvent, TrackingSession,
};
use cargotrack_env::{ChannelFrame, EntityId, SessionId, TrackingContext, TrackingService, ViewerIdentity, ViewerRole};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Scheduler turns granted to background tasks after each clock move.
const SETTLE_TURNS: usize = 16;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of shipments in the fleet
    pub fleet_size: usize,

    /// Session settings under test
    pub session: SessionConfig,

    /// Role of the simulated viewer
    pub role: ViewerRole,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            fleet_size: 5,
            session: SessionConfig::default(),
            role: ViewerRole::Dispatcher,
        }
    }
}

/// Counters collected while the world runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorldStats {
    pub frames: u64,
    pub polls_issued: u64,
    pub polls_completed: u64,
    pub pushes_delivered: u64,
    pub drops_observed: u64,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Ground truth shipments
    pub fleet: Fleet,

    /// Backend side of the push channel
    pub controller: SimChannelController,

    /// REST endpoints
    pub service: Arc<SimTrackingService>,

    pub connection: ConnectionManager<SimContext, SimPushChannel>,

    pub session: TrackingSession<SimPushChannel>,

    channel: Arc<SimPushChannel>,

    /// Transitions published by the connection manager, not yet handled
    transitions: Arc<Mutex<VecDeque<ConnectionEvent>>>,

    _listener: ListenerHandle,

    /// Polls issued by the session and not yet answered
    pending: Vec<PollRequest>,

    /// Every frame rendered so far
    frames: Vec<RenderFrame>,

    stats: WorldStats,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        // Derive separate seeds for different subsystems
        let context_seed = config.seed;
        let fleet_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);

        let context = SimContext::shared(context_seed);
        let fleet = Fleet::new(fleet_seed, config.fleet_size, context.now_millis());

        let (channel, controller) = SimPushChannel::pair();
        let service = Arc::new(SimTrackingService::new());

        let connection = ConnectionManager::new(
            Arc::clone(&context),
            Arc::clone(&channel),
            config.session.backoff.clone(),
        );
        let transitions = Arc::new(Mutex::new(VecDeque::new()));
        let listener = {
            let transitions = Arc::clone(&transitions);
            connection.on_connection_change(move |event| {
                transitions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(event.clone());
            })
        };

        let session = TrackingSession::new(
            SessionId::from_seed(config.seed),
            ViewerIdentity::new(format!("sim-{}", config.seed), config.role),
            Arc::clone(&channel),
            config.session.clone(),
        );

        let mut world = Self {
            config,
            context,
            fleet,
            controller,
            service,
            connection,
            session,
            channel,
            transitions,
            _listener: listener,
            pending: Vec::new(),
            frames: Vec::new(),
            stats: WorldStats::default(),
        };
        world.publish_fleet();
        world
    }

    // ========================================================================
    // DRIVING
    // ========================================================================

    /// Starts the push channel and handles the resulting transitions.
    pub async fn connect(&mut self) {
        self.connection.connect().await;
        self.pump();
    }

    /// Feeds one event into the session at the current virtual time.
    pub fn handle(&mut self, event: SessionEvent) {
        let out = self.session.handle(event, self.context.now_millis());
        self.stats.polls_issued += out.polls.len() as u64;
        self.stats.frames += out.frames.len() as u64;
        self.pending.extend(out.polls);
        self.frames.extend(out.frames);
    }

    pub fn select(&mut self, entity: Option<&EntityId>) {
        self.handle(SessionEvent::Select(entity.cloned()));
    }

    pub fn watch(&mut self, entity: &EntityId) {
        self.handle(SessionEvent::Watch(entity.clone()));
    }

    pub fn unwatch(&mut self, entity: &EntityId) {
        self.handle(SessionEvent::Unwatch(entity.clone()));
    }

    /// Drains connection transitions and channel frames until both are empty.
    pub fn pump(&mut self) {
        loop {
            let mut progressed = false;

            while let Some(event) = self.next_transition() {
                self.handle(SessionEvent::Connectivity(event));
                progressed = true;
            }

            while let Some(frame) = self.channel.try_recv() {
                match frame {
                    ChannelFrame::Location(payload) => {
                        self.stats.pushes_delivered += 1;
                        self.handle(SessionEvent::Push {
                            kind: PushKind::Location,
                            payload,
                        });
                    }
                    ChannelFrame::Status(payload) => {
                        self.stats.pushes_delivered += 1;
                        self.handle(SessionEvent::Push {
                            kind: PushKind::Status,
                            payload,
                        });
                    }
                    ChannelFrame::Dropped { reason } => {
                        self.stats.drops_observed += 1;
                        self.connection.handle_drop(&reason);
                    }
                }
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
    }

    /// Answers every pending poll whose entity is not held.
    ///
    /// Held polls stay pending and are answered (late) after `release`.
    pub async fn complete_polls(&mut self) {
        let (held, ready): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|req| self.service.is_held(&req.entity));
        self.pending = held;

        for req in ready {
            let outcome = match req.kind {
                PollKind::Detail => self.service.fetch_tracking_detail(&req.entity).await,
                PollKind::Progress => self.service.fetch_route_progress(&req.entity).await,
            };
            self.stats.polls_completed += 1;
            self.handle(SessionEvent::PollCompleted {
                entity: req.entity,
                epoch: req.epoch,
                kind: req.kind,
                outcome,
            });
        }
    }

    /// Advances virtual time in tick-sized steps.
    ///
    /// Each step: let background tasks arm their timers, move the clock,
    /// let them run, pump, tick the session, then answer polls.
    pub async fn advance(&mut self, duration: Duration) {
        let step = self.config.session.tick_interval.max(Duration::from_millis(1));
        let mut remaining = duration;

        while !remaining.is_zero() {
            let dt = step.min(remaining);
            settle().await;
            self.context.advance_time(dt);
            settle().await;
            self.pump();
            self.handle(SessionEvent::Tick);
            self.complete_polls().await;
            remaining -= dt;
        }
    }

    /// Lets spawned tasks (the reconnect loop) run, then pumps.
    pub async fn settle(&mut self) {
        settle().await;
        self.pump();
    }

    // ========================================================================
    // FLEET
    // ========================================================================

    /// Copies the fleet's current bodies into the REST fixtures.
    pub fn publish_fleet(&mut self) {
        for id in self.fleet.ids() {
            if let Some(body) = self.fleet.detail_json(&id) {
                self.service.set_detail(&id, body);
            }
            if let Some(body) = self.fleet.progress_json(&id) {
                self.service.set_progress(&id, body);
            }
        }
    }

    /// Moves the fleet and pushes a location event for every moved shipment.
    pub fn move_fleet(&mut self, dt: Duration) -> Vec<EntityId> {
        let moved = self.fleet.step(dt.as_secs_f64(), self.context.now_millis());
        for id in &moved {
            if let Some(event) = self.fleet.location_event(id) {
                self.controller.push_location(event);
            }
        }
        self.publish_fleet();
        moved
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn frames(&self) -> &[RenderFrame] {
        &self.frames
    }

    pub fn last_frame(&self) -> Option<&RenderFrame> {
        self.frames.last()
    }

    pub fn pending_polls(&self) -> &[PollRequest] {
        &self.pending
    }

    pub fn stats(&self) -> &WorldStats {
        &self.stats
    }

    pub fn time_secs(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    fn next_transition(&self) -> Option<ConnectionEvent> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

async fn settle() {
    for _ in 0..SETTLE_TURNS {
        tokio::task::yield_now().await;
    }
    debug!("settled background tasks");
}
