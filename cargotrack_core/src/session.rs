//! Tracking Session - the single timeline every engine hangs off.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      TrackingSession                         │
//! │                                                              │
//! │   SessionEvent ──► handle(event, now_ms) ──► SessionOutput   │
//! │                         │                   (frames, polls)  │
//! │     ┌───────────────────┼────────────────────┐               │
//! │     ▼                   ▼                    ▼               │
//! │ ┌──────────┐     ┌────────────┐      ┌──────────────┐        │
//! │ │ REGISTRY │     │ RECONCILER │ ───► │  VIEW MODEL  │        │
//! │ └──────────┘     └────────────┘      │  + PROJECTOR │        │
//! │                                      └──────────────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The session does no I/O of its own. Subscribe messages go out through
//! the registry's fire-and-forget channel sends; everything that needs to
//! suspend (polls) is handed back to the driver as a [`PollRequest`] and
//! comes back in as [`SessionEvent::PollCompleted`].

use cargotrack_env::{EntityId, EnvError, PushChannel, SessionId, ViewerIdentity};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connection::ConnectionEvent;
use crate::model::{Coordinate, TrackingSnapshot, TrackingStatus};
use crate::projector::MapProjector;
use crate::reconciler::{ReconcilerConfig, UpdateReconciler};
use crate::subscriptions::SubscriptionRegistry;
use crate::view_model::{RenderFrame, TrackingViewModel};
use crate::wire::{self, PushKind};

// ============================================================================
// EVENTS & OUTPUT
// ============================================================================

/// Which polling endpoint a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    Detail,
    Progress,
}

/// A poll the driver must perform and report back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub entity: EntityId,
    pub epoch: u64,
    pub kind: PollKind,
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connectivity(ConnectionEvent),

    Push { kind: PushKind, payload: Vec<u8> },

    PollCompleted {
        entity: EntityId,
        epoch: u64,
        kind: PollKind,
        outcome: Result<Vec<u8>, EnvError>,
    },

    Select(Option<EntityId>),

    /// A list row became visible
    Watch(EntityId),

    Unwatch(EntityId),

    Retry,

    Tick,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOutput {
    pub frames: Vec<RenderFrame>,
    pub polls: Vec<PollRequest>,

    /// At least one watched row changed
    pub rows_changed: bool,
}

impl SessionOutput {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.polls.is_empty() && !self.rows_changed
    }

    /// Latest frame produced by this step, if any.
    pub fn last_frame(&self) -> Option<&RenderFrame> {
        self.frames.last()
    }
}

/// One line of the in-transit shipment list.
#[derive(Debug, Clone, PartialEq)]
pub struct ShipmentRow {
    pub entity_id: EntityId,
    pub status: TrackingStatus,
    pub progress_percentage: Option<f64>,
    pub current_location: Option<Coordinate>,
    pub last_updated: u64,
}

impl ShipmentRow {
    fn from_snapshot(snapshot: &TrackingSnapshot) -> Self {
        Self {
            entity_id: snapshot.entity_id.clone(),
            status: snapshot.status.clone(),
            progress_percentage: snapshot.progress_percentage,
            current_location: snapshot.current_location().map(|s| s.coordinate()),
            last_updated: snapshot.last_updated,
        }
    }
}

// ============================================================================
// SESSION
// ============================================================================

pub struct TrackingSession<Ch: PushChannel> {
    id: SessionId,
    config: SessionConfig,

    registry: SubscriptionRegistry<Ch>,
    reconciler: UpdateReconciler,
    view: TrackingViewModel,

    /// List-row interest, ref-counted separately from the selection
    watched: BTreeMap<EntityId, u32>,

    /// Polls outstanding under the current epoch
    in_flight: HashSet<PollKind>,

    /// Next periodic poll of the selection, in `now_ms` time
    next_poll_at: Option<u64>,

    connected: bool,
}

impl<Ch: PushChannel> TrackingSession<Ch> {
    pub fn new(id: SessionId, viewer: ViewerIdentity, channel: Arc<Ch>, config: SessionConfig) -> Self {
        let reconciler = UpdateReconciler::new(ReconcilerConfig {
            max_history: config.max_history,
            terminal_grace_ms: config.terminal_grace.as_millis() as u64,
        });
        let view = TrackingViewModel::new(
            viewer,
            MapProjector::new(config.bounds_padding),
            config.freshness_threshold,
        );

        Self {
            id,
            config,
            registry: SubscriptionRegistry::new(channel),
            reconciler,
            view,
            watched: BTreeMap::new(),
            in_flight: HashSet::new(),
            next_poll_at: None,
            connected: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn view(&self) -> &TrackingViewModel {
        &self.view
    }

    pub fn registry(&self) -> &SubscriptionRegistry<Ch> {
        &self.registry
    }

    pub fn reconciler(&self) -> &UpdateReconciler {
        &self.reconciler
    }

    pub fn snapshot(&self, id: &EntityId) -> Option<&TrackingSnapshot> {
        self.reconciler.snapshot(id)
    }

    /// Current render output.
    pub fn frame(&self) -> RenderFrame {
        self.view.frame()
    }

    /// Rows for every watched entity that has data, ordered by id.
    pub fn shipments(&self) -> Vec<ShipmentRow> {
        self.watched
            .keys()
            .filter_map(|id| self.reconciler.snapshot(id))
            .map(ShipmentRow::from_snapshot)
            .collect()
    }

    /// Processes one event. The only mutation entry point.
    pub fn handle(&mut self, event: SessionEvent, now_ms: u64) -> SessionOutput {
        let mut out = SessionOutput::default();

        match event {
            SessionEvent::Connectivity(event) => self.on_connectivity(&event, now_ms, &mut out),
            SessionEvent::Push { kind, payload } => self.on_push(kind, &payload, now_ms, &mut out),
            SessionEvent::PollCompleted {
                entity,
                epoch,
                kind,
                outcome,
            } => self.on_poll_completed(&entity, epoch, kind, outcome, now_ms, &mut out),
            SessionEvent::Select(id) => self.select(id, now_ms, &mut out),
            SessionEvent::Watch(id) => self.watch(id),
            SessionEvent::Unwatch(id) => self.unwatch(&id),
            SessionEvent::Retry => {
                if let Some(selection) = self.view.retry() {
                    out.frames.push(selection.frame);
                    self.start_polling(now_ms, &mut out);
                }
            }
            SessionEvent::Tick => self.on_tick(now_ms, &mut out),
        }
        out
    }

    fn on_connectivity(&mut self, event: &ConnectionEvent, now_ms: u64, out: &mut SessionOutput) {
        let connected = event.is_connected();
        let reconnected = connected && !self.connected;
        self.connected = connected;

        self.registry.on_connection_change(connected);
        out.frames.extend(self.view.on_connectivity(event));

        // Pushes missed while down are only recoverable by polling
        if reconnected && self.polling_active() {
            self.issue_polls(now_ms, out);
        }
    }

    fn on_push(&mut self, kind: PushKind, payload: &[u8], now_ms: u64, out: &mut SessionOutput) {
        let update = match wire::decode_push(kind, payload) {
            Ok(update) => update,
            Err(e) => {
                warn!(session = %self.id, ?kind, error = %e, "dropping malformed push");
                return;
            }
        };

        if !self.registry.is_subscribed(&update.entity_id) {
            debug!(entity = %update.entity_id, "push for unsubscribed entity; dropped");
            return;
        }

        let entity = update.entity_id.clone();
        match self.reconciler.apply_push(update, now_ms) {
            Ok(Some(snapshot)) => self.publish(&snapshot, out),
            Ok(None) => {}
            Err(e) => warn!(session = %self.id, entity = %entity, error = %e, "push rejected"),
        }
    }

    fn on_poll_completed(
        &mut self,
        entity: &EntityId,
        epoch: u64,
        kind: PollKind,
        outcome: Result<Vec<u8>, EnvError>,
        now_ms: u64,
        out: &mut SessionOutput,
    ) {
        if !self.view.is_current(entity, epoch) {
            debug!(entity = %entity, epoch, current = self.view.epoch(), ?kind, "discarding stale poll result");
            return;
        }
        self.in_flight.remove(&kind);

        let payload = match outcome {
            Ok(payload) => payload,
            Err(e) => {
                out.frames.extend(self.view.on_poll_failed(entity, epoch, &e));
                return;
            }
        };

        let decoded = match kind {
            PollKind::Detail => wire::decode_tracking_detail(entity, &payload),
            PollKind::Progress => wire::decode_route_progress(entity, &payload),
        };
        let applied = decoded.and_then(|update| match kind {
            PollKind::Detail => self.reconciler.apply_poll(entity, update, now_ms),
            PollKind::Progress => self.reconciler.apply_route_progress(entity, update, now_ms),
        });

        match applied {
            Ok(Some(snapshot)) => self.publish(&snapshot, out),
            // Nothing new; a loading view may still be waiting on held data
            Ok(None) => {
                if let Some(snapshot) = self.reconciler.snapshot(entity).cloned() {
                    out.frames.extend(self.view.on_snapshot(&snapshot));
                }
            }
            Err(e) => warn!(session = %self.id, entity = %entity, ?kind, error = %e, "dropping malformed poll result"),
        }
    }

    fn select(&mut self, id: Option<EntityId>, now_ms: u64, out: &mut SessionOutput) {
        let Some(selection) = self.view.select_entity(id) else {
            return;
        };
        out.frames.push(selection.frame);

        if selection.switched {
            if let Some(previous) = &selection.previous {
                self.registry.unsubscribe(previous);
            }
            if let Some(current) = self.view.selected().cloned() {
                info!(session = %self.id, entity = %current, epoch = selection.epoch, "tracking selection");
                self.registry.subscribe(&current);

                // Show what we already know while the refresh runs
                if let Some(known) = self.reconciler.snapshot(&current).cloned() {
                    out.frames.extend(self.view.on_snapshot(&known));
                }
            }
        }

        if self.view.selected().is_some() {
            self.start_polling(now_ms, out);
        } else {
            self.in_flight.clear();
            self.next_poll_at = None;
        }
    }

    fn watch(&mut self, id: EntityId) {
        self.registry.subscribe(&id);
        *self.watched.entry(id).or_insert(0) += 1;
    }

    fn unwatch(&mut self, id: &EntityId) {
        let Some(count) = self.watched.get_mut(id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.watched.remove(id);
        }
        self.registry.unsubscribe(id);
    }

    fn on_tick(&mut self, now_ms: u64, out: &mut SessionOutput) {
        out.frames.extend(self.view.tick(now_ms));

        let registry = &self.registry;
        let evicted = self.reconciler.evict_terminal(now_ms, |id| registry.is_subscribed(id));
        if !evicted.is_empty() {
            debug!(session = %self.id, count = evicted.len(), "evicted terminal shipments");
        }

        if let Some(due) = self.next_poll_at {
            if now_ms >= due && self.polling_active() {
                self.issue_polls(now_ms, out);
            }
        }
    }

    /// New epoch: forget outstanding polls and poll right away.
    fn start_polling(&mut self, now_ms: u64, out: &mut SessionOutput) {
        self.in_flight.clear();
        self.issue_polls(now_ms, out);
    }

    fn issue_polls(&mut self, now_ms: u64, out: &mut SessionOutput) {
        let Some(entity) = self.view.selected().cloned() else {
            return;
        };
        let epoch = self.view.epoch();

        for kind in [PollKind::Detail, PollKind::Progress] {
            if self.in_flight.insert(kind) {
                out.polls.push(PollRequest {
                    entity: entity.clone(),
                    epoch,
                    kind,
                });
            }
        }
        self.next_poll_at = Some(now_ms + millis(self.config.poll_interval));
    }

    fn polling_active(&self) -> bool {
        self.view.selected().is_some() && !self.view.phase().is_error()
    }

    fn publish(&mut self, snapshot: &TrackingSnapshot, out: &mut SessionOutput) {
        out.frames.extend(self.view.on_snapshot(snapshot));
        if self.watched.contains_key(&snapshot.entity_id) {
            out.rows_changed = true;
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStatus;
    use crate::projector::MarkerKind;
    use crate::view_model::ViewPhase;
    use async_trait::async_trait;
    use cargotrack_env::{ChannelFrame, ViewerRole};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct LogChannel {
        log: Mutex<Vec<String>>,
    }

    impl LogChannel {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }
    }

    #[async_trait]
    impl PushChannel for LogChannel {
        async fn connect(&self) -> Result<(), EnvError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        fn send_subscribe(&self, entity: &EntityId) -> Result<(), EnvError> {
            self.log.lock().unwrap().push(format!("+{entity}"));
            Ok(())
        }

        fn send_unsubscribe(&self, entity: &EntityId) -> Result<(), EnvError> {
            self.log.lock().unwrap().push(format!("-{entity}"));
            Ok(())
        }

        async fn recv(&self) -> Option<ChannelFrame> {
            None
        }
    }

    fn id(s: &str) -> EntityId {
        EntityId::from(s)
    }

    fn session() -> (Arc<LogChannel>, TrackingSession<LogChannel>) {
        let channel = Arc::new(LogChannel::default());
        let session = TrackingSession::new(
            SessionId::from_seed(1),
            ViewerIdentity::new("dispatcher-1", ViewerRole::Dispatcher),
            Arc::clone(&channel),
            SessionConfig::default(),
        );
        (channel, session)
    }

    fn connected(retry_count: u32) -> SessionEvent {
        SessionEvent::Connectivity(ConnectionEvent {
            status: ConnectionStatus::Connected,
            retry_count,
            at: Duration::ZERO,
            next_retry_in: None,
            reason: None,
        })
    }

    fn disconnected() -> SessionEvent {
        SessionEvent::Connectivity(ConnectionEvent {
            status: ConnectionStatus::Disconnected,
            retry_count: 1,
            at: Duration::ZERO,
            next_retry_in: Some(Duration::from_secs(1)),
            reason: Some("reset".into()),
        })
    }

    fn detail(entity: &str, last_updated: u64) -> Vec<u8> {
        json!({
            "entity_id": entity,
            "status": "in_transit",
            "last_updated": last_updated,
            "progress_percentage": 10.0,
            "location_history": [
                {"id": "a", "latitude": 52.52, "longitude": 13.40, "recorded_at": last_updated - 10},
            ],
        })
        .to_string()
        .into_bytes()
    }

    fn location(entity: &str, sample: &str, recorded_at: u64) -> SessionEvent {
        SessionEvent::Push {
            kind: PushKind::Location,
            payload: json!({
                "entity_id": entity,
                "id": sample,
                "latitude": 52.40,
                "longitude": 13.06,
                "recorded_at": recorded_at,
            })
            .to_string()
            .into_bytes(),
        }
    }

    fn completed(req: &PollRequest, outcome: Result<Vec<u8>, EnvError>) -> SessionEvent {
        SessionEvent::PollCompleted {
            entity: req.entity.clone(),
            epoch: req.epoch,
            kind: req.kind,
            outcome,
        }
    }

    #[test]
    fn test_select_subscribes_and_polls_both_endpoints() {
        let (channel, mut s) = session();
        s.handle(connected(0), 0);

        let out = s.handle(SessionEvent::Select(Some(id("A"))), 1_000);

        assert_eq!(out.frames[0].phase, ViewPhase::Loading);
        assert_eq!(out.polls.len(), 2);
        assert!(out.polls.iter().all(|p| p.epoch == 1 && p.entity == id("A")));
        assert_eq!(channel.take(), vec!["+A"]);
    }

    #[test]
    fn test_cold_start_poll_makes_ready() {
        let (_channel, mut s) = session();
        s.handle(connected(0), 0);
        let out = s.handle(SessionEvent::Select(Some(id("A"))), 1_000);
        let detail_req = out.polls.iter().find(|p| p.kind == PollKind::Detail).unwrap();

        let out = s.handle(completed(detail_req, Ok(detail("A", 900))), 1_010);

        let frame = out.last_frame().unwrap();
        assert_eq!(frame.phase, ViewPhase::Ready);
        assert_eq!(frame.map.markers.len(), 1);
    }

    fn progress(latitude: f64, longitude: f64, recorded_at: u64) -> Vec<u8> {
        json!({
            "progress_percentage": 10.0,
            "current_location": {"latitude": latitude, "longitude": longitude, "recorded_at": recorded_at},
        })
        .to_string()
        .into_bytes()
    }

    fn poll_of(polls: &[PollRequest], kind: PollKind) -> PollRequest {
        polls.iter().find(|p| p.kind == kind).unwrap().clone()
    }

    #[test]
    fn test_progress_position_without_id_merges_with_detail_sample() {
        let (_channel, mut s) = session();
        s.handle(connected(0), 0);
        let polls = s.handle(SessionEvent::Select(Some(id("A"))), 1_000).polls;
        let body = json!({
            "entity_id": "A",
            "status": "pending",
            "last_updated": 900,
            "location_history": [{"id": "p1", "latitude": 52.5, "longitude": 13.4, "recorded_at": 900}],
        })
        .to_string()
        .into_bytes();

        // Progress first so the id-less point is the one already stored
        s.handle(completed(&poll_of(&polls, PollKind::Progress), Ok(progress(52.5, 13.4, 900))), 1_010);
        let out = s.handle(completed(&poll_of(&polls, PollKind::Detail), Ok(body)), 1_020);

        let history = &s.snapshot(&id("A")).unwrap().location_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id.as_deref(), Some("p1"));

        let frame = out.last_frame().unwrap();
        let kinds: Vec<_> = frame.map.markers.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MarkerKind::Pickup]);
        assert!(frame.map.route.is_none());
    }

    #[test]
    fn test_progress_only_reports_unknown_status() {
        let (_channel, mut s) = session();
        s.handle(connected(0), 0);
        let polls = s.handle(SessionEvent::Select(Some(id("A"))), 1_000).polls;

        let out = s.handle(completed(&poll_of(&polls, PollKind::Progress), Ok(progress(52.5, 13.4, 900))), 1_010);

        let frame = out.last_frame().unwrap();
        assert_eq!(frame.phase, ViewPhase::Ready);
        assert_eq!(frame.status, Some(TrackingStatus::Unknown));
    }

    #[test]
    fn test_repeated_poll_of_old_data_stays_stale() {
        let (_channel, mut s) = session();
        s.handle(connected(0), 0);
        let polls = s.handle(SessionEvent::Select(Some(id("A"))), 0).polls;
        s.handle(completed(&poll_of(&polls, PollKind::Detail), Ok(detail("A", 900))), 10);
        s.handle(completed(&poll_of(&polls, PollKind::Progress), Ok(progress(52.52, 13.40, 890))), 10);
        assert_eq!(s.view().phase(), &ViewPhase::Ready);

        let out = s.handle(SessionEvent::Tick, 61_000);
        assert_eq!(s.view().phase(), &ViewPhase::Stale);
        assert_eq!(out.polls.len(), 2);

        for p in &out.polls {
            let body = match p.kind {
                PollKind::Detail => detail("A", 900),
                PollKind::Progress => progress(52.52, 13.40, 890),
            };
            let answered = s.handle(completed(p, Ok(body)), 61_050);
            assert!(answered.frames.is_empty());
        }
        assert_eq!(s.view().phase(), &ViewPhase::Stale);
        assert!(s.handle(SessionEvent::Tick, 62_000).frames.is_empty());

        let out = s.handle(location("A", "b", 62_500), 62_500);
        assert_eq!(out.last_frame().unwrap().phase, ViewPhase::Ready);
    }

    #[test]
    fn test_switching_selection_moves_subscription() {
        let (channel, mut s) = session();
        s.handle(connected(0), 0);
        s.handle(SessionEvent::Select(Some(id("A"))), 0);
        s.handle(SessionEvent::Select(Some(id("B"))), 0);

        assert_eq!(channel.take(), vec!["+A", "-A", "+B"]);
    }

    #[test]
    fn test_late_poll_for_old_selection_is_discarded() {
        let (_channel, mut s) = session();
        s.handle(connected(0), 0);
        let first = s.handle(SessionEvent::Select(Some(id("A"))), 0).polls;
        s.handle(SessionEvent::Select(Some(id("B"))), 0);

        let out = s.handle(completed(&first[0], Ok(detail("A", 900))), 10);

        assert!(out.is_empty());
        assert!(s.snapshot(&id("A")).is_none());
        assert_eq!(s.view().phase(), &ViewPhase::Loading);
    }

    #[test]
    fn test_push_for_unsubscribed_entity_dropped() {
        let (_channel, mut s) = session();
        s.handle(connected(0), 0);

        let out = s.handle(location("Z", "z1", 100), 100);
        assert!(out.is_empty());
        assert!(s.snapshot(&id("Z")).is_none());
    }

    #[test]
    fn test_malformed_push_is_dropped() {
        let (_channel, mut s) = session();
        s.handle(connected(0), 0);
        s.handle(SessionEvent::Select(Some(id("A"))), 0);

        let out = s.handle(
            SessionEvent::Push {
                kind: PushKind::Location,
                payload: br#"{"entity_id":"A","latitude":95.0,"longitude":0.0,"recorded_at":5}"#.to_vec(),
            },
            10,
        );
        assert!(out.frames.is_empty());
        assert!(s.snapshot(&id("A")).is_none());
    }

    #[test]
    fn test_not_found_moves_to_error_and_stops_polling() {
        let (_channel, mut s) = session();
        s.handle(connected(0), 0);
        let polls = s.handle(SessionEvent::Select(Some(id("A"))), 0).polls;

        let out = s.handle(completed(&polls[0], Err(EnvError::not_found("A"))), 10);
        assert!(out.last_frame().unwrap().phase.is_error());

        let out = s.handle(SessionEvent::Tick, 60_000);
        assert!(out.polls.is_empty());

        let out = s.handle(SessionEvent::Retry, 60_000);
        assert_eq!(out.polls.len(), 2);
        assert!(out.polls.iter().all(|p| p.epoch == 2));
    }

    #[test]
    fn test_periodic_poll_waits_for_in_flight() {
        let (_channel, mut s) = session();
        s.handle(connected(0), 0);
        let polls = s.handle(SessionEvent::Select(Some(id("A"))), 0).polls;

        // Detail still outstanding; only progress is re-issued
        s.handle(completed(&polls[1], Err(EnvError::timeout(Duration::from_secs(8)))), 8_000);
        let out = s.handle(SessionEvent::Tick, 15_000);
        assert_eq!(out.polls.len(), 1);
        assert_eq!(out.polls[0].kind, PollKind::Progress);
    }

    #[test]
    fn test_reconnect_resubscribes_and_catches_up() {
        let (channel, mut s) = session();
        s.handle(connected(0), 0);
        let polls = s.handle(SessionEvent::Select(Some(id("A"))), 0).polls;
        for p in &polls {
            s.handle(completed(p, Ok(detail("A", 900))), 10);
        }
        channel.take();

        s.handle(disconnected(), 20);
        let out = s.handle(connected(0), 1_020);

        assert_eq!(channel.take(), vec!["+A"]);
        assert_eq!(out.polls.len(), 2);
    }

    #[test]
    fn test_watched_rows() {
        let (channel, mut s) = session();
        s.handle(connected(0), 0);
        s.handle(SessionEvent::Watch(id("B")), 0);
        s.handle(SessionEvent::Watch(id("A")), 0);
        channel.take();

        let out = s.handle(location("B", "b1", 500), 500);
        assert!(out.rows_changed);
        s.handle(location("A", "a1", 400), 500);

        let rows = s.shipments();
        assert_eq!(rows.iter().map(|r| r.entity_id.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(rows[1].last_updated, 500);
        assert_eq!(rows[1].current_location, Some(Coordinate::new(52.40, 13.06)));

        s.handle(SessionEvent::Unwatch(id("A")), 600);
        assert_eq!(channel.take(), vec!["-A"]);
        assert_eq!(s.shipments().len(), 1);
    }

    #[test]
    fn test_selected_and_watched_share_one_subscription() {
        let (channel, mut s) = session();
        s.handle(connected(0), 0);
        s.handle(SessionEvent::Watch(id("A")), 0);
        s.handle(SessionEvent::Select(Some(id("A"))), 0);
        s.handle(SessionEvent::Select(None), 0);

        assert_eq!(channel.take(), vec!["+A"]);
        assert_eq!(s.registry().ref_count(&id("A")), 1);
    }

    #[test]
    fn test_terminal_entity_evicted_after_grace_when_unreferenced() {
        let (_channel, mut s) = session();
        s.handle(connected(0), 0);
        s.handle(SessionEvent::Watch(id("A")), 0);
        s.handle(
            SessionEvent::Push {
                kind: PushKind::Status,
                payload: br#"{"entity_id":"A","status":"delivered","updated_at":100}"#.to_vec(),
            },
            1_000,
        );
        s.handle(SessionEvent::Unwatch(id("A")), 1_000);

        s.handle(SessionEvent::Tick, 1_000 + 299_999);
        assert!(s.snapshot(&id("A")).is_some());
        s.handle(SessionEvent::Tick, 1_000 + 300_000);
        assert!(s.snapshot(&id("A")).is_none());
    }
}
