//! Scenario runner - executes live-sync scenarios against a SimWorld.

use crate::channel::ChannelMessage;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use cargotrack_core::{MarkerKind, PollKind, SessionConfig, SessionEvent, TrackingStatus, ViewPhase};
use cargotrack_env::{ChannelController, EntityId, TrackingContext};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioMetrics {
    /// Render frames produced by the session
    pub frames: u64,

    /// Poll requests issued
    pub polls: u64,

    /// Push events delivered to the session
    pub pushes: u64,

    /// Channel drops observed
    pub drops: u64,

    /// Handshakes attempted, including refused ones
    pub connect_attempts: u64,

    /// Subscribe messages the backend received
    pub subscribe_messages: u64,
}

impl ScenarioMetrics {
    fn collect(world: &SimWorld) -> Self {
        let stats = world.stats();
        Self {
            frames: stats.frames,
            polls: stats.polls_issued,
            pushes: stats.pushes_delivered,
            drops: stats.drops_observed,
            connect_attempts: world.controller.connect_attempts(),
            subscribe_messages: world
                .controller
                .messages()
                .iter()
                .filter(|m| matches!(m, ChannelMessage::Subscribe(_)))
                .count() as u64,
        }
    }
}

type Outcome = Result<ScenarioMetrics, String>;

/// Fails the scenario with `msg` unless `cond` holds.
fn check(cond: bool, msg: impl FnOnce() -> String) -> Result<(), String> {
    if cond {
        Ok(())
    } else {
        Err(msg())
    }
}

/// Runs live-sync scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Shipments in the simulated fleet
    fleet_size: usize,

    /// Session settings under test
    session: SessionConfig,

    /// Fault injection window for chaotic scenarios, in seconds
    duration_secs: f64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            fleet_size: 5,
            session: SessionConfig::default(),
            duration_secs: 120.0,
        }
    }

    /// Sets the session configuration.
    pub fn with_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Sets the number of shipments (at least 2 are always simulated).
    pub fn with_fleet_size(mut self, fleet_size: usize) -> Self {
        self.fleet_size = fleet_size;
        self
    }

    /// Sets the fault injection window.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        if scenario.is_chaotic() {
            warn!("chaotic scenario: injecting seeded faults for {:.0}s", self.duration_secs);
        }

        let world = SimWorld::new(SimConfig {
            seed: self.seed,
            fleet_size: self.fleet_size.max(2),
            session: self.session.clone(),
            ..SimConfig::default()
        });

        let duration = Duration::from_secs_f64(self.duration_secs.max(0.0));
        let (outcome, final_time_secs) = self.block_on(async move {
            let mut world = world;
            let outcome = match scenario {
                ScenarioId::ColdStart => run_cold_start(&mut world).await,
                ScenarioId::MotionUpdate => run_motion_update(&mut world).await,
                ScenarioId::Reconnect => run_reconnect(&mut world).await,
                ScenarioId::EpochCancel => run_epoch_cancel(&mut world).await,
                ScenarioId::OutOfOrder => run_out_of_order(&mut world).await,
                ScenarioId::FlakyNetwork => run_flaky_network(&mut world, duration).await,
            };
            world.connection.disconnect().await;
            (outcome, world.time_secs())
        });

        match outcome {
            Ok(metrics) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: true,
                final_time_secs,
                failure_reason: None,
                metrics,
            },
            Err(reason) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                final_time_secs,
                failure_reason: Some(reason),
                metrics: ScenarioMetrics::default(),
            },
        }
    }

    /// Drives one scenario on a single-threaded runtime so that the
    /// connection manager's spawned retry loop interleaves deterministically.
    fn block_on<Fut>(&self, scenario: Fut) -> (Outcome, f64)
    where
        Fut: Future<Output = (Outcome, f64)>,
    {
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(scenario),
            Err(e) => (Err(format!("failed to build runtime: {e}")), 0.0),
        }
    }
}

fn ids(world: &SimWorld) -> (EntityId, EntityId) {
    let ids = world.fleet.ids();
    (ids[0].clone(), ids[1].clone())
}

/// SYNC-001: ColdStart - first selection with no push data.
///
/// **Assertion**: Loading is rendered before Ready; the map shows exactly
/// one pickup marker with bounds; one subscribe went out.
async fn run_cold_start(world: &mut SimWorld) -> Outcome {
    info!("SYNC-001: ColdStart - poll-only first render");

    let (s0, _) = ids(world);
    world.connect().await;
    check(world.connection.is_connected(), || "initial handshake failed".into())?;

    world.select(Some(&s0));
    world.complete_polls().await;

    let phases: Vec<&ViewPhase> = world.frames().iter().map(|f| &f.phase).collect();
    let loading_at = phases.iter().position(|p| **p == ViewPhase::Loading);
    let ready_at = phases.iter().position(|p| **p == ViewPhase::Ready);
    check(matches!((loading_at, ready_at), (Some(l), Some(r)) if l < r), || {
        format!("expected Loading before Ready, saw {:?}", phases)
    })?;

    let frame = world.session.frame();
    let kinds: Vec<MarkerKind> = frame.map.markers.iter().map(|m| m.kind).collect();
    check(kinds == vec![MarkerKind::Pickup], || format!("expected only a pickup marker, got {:?}", kinds))?;
    check(frame.map.route.is_none(), || "single sample must not draw a route".into())?;
    check(frame.map.bounds.is_some(), || "bounds missing".into())?;

    let messages = world.controller.messages();
    check(messages == vec![ChannelMessage::Subscribe(s0)], || {
        format!("unexpected channel messages {:?}", messages)
    })?;

    Ok(ScenarioMetrics::collect(world))
}

/// SYNC-002: MotionUpdate - a pushed location moves the current marker.
///
/// **Assertion**: pickup + current markers, a two point route, and the
/// current marker sits on the fleet's true position.
async fn run_motion_update(world: &mut SimWorld) -> Outcome {
    info!("SYNC-002: MotionUpdate - push moves the current marker");

    let (s0, _) = ids(world);
    world.connect().await;
    world.select(Some(&s0));
    world.complete_polls().await;

    world.advance(Duration::from_secs(1)).await;
    world.move_fleet(Duration::from_secs(1));
    world.pump();

    let frame = world.session.frame();
    check(frame.phase == ViewPhase::Ready, || format!("phase {:?}", frame.phase))?;
    check(frame.map.has_marker(MarkerKind::Pickup), || "pickup marker missing".into())?;

    let route_len = frame.map.route.as_ref().map_or(0, |r| r.points.len());
    check(route_len == 2, || format!("expected a 2 point route, got {}", route_len))?;

    let truth = world
        .fleet
        .shipment(&s0)
        .and_then(|s| s.current())
        .map(|s| s.coordinate())
        .ok_or("fleet lost the shipment")?;
    let current = frame
        .map
        .marker(MarkerKind::Current)
        .map(|m| m.position)
        .ok_or("current marker missing")?;
    check(current == truth, || format!("current marker {:?} != truth {:?}", current, truth))?;

    Ok(ScenarioMetrics::collect(world))
}

/// SYNC-003: Reconnect - drop, two refused handshakes, then recovery.
///
/// **Assertion**: backoff sleeps are exactly 1s, 2s, 4s; after the
/// reconnect every active entity is re-subscribed exactly once.
async fn run_reconnect(world: &mut SimWorld) -> Outcome {
    info!("SYNC-003: Reconnect - backoff and re-subscription");

    let (s0, s1) = ids(world);
    world.connect().await;
    world.select(Some(&s0));
    world.watch(&s1);
    world.complete_polls().await;

    world.controller.take_messages();
    world.context.take_sleeps();

    world.controller.fail_next_connects(2);
    world.controller.drop_connection("connection reset by peer");
    world.pump();
    check(!world.connection.is_connected(), || "still connected after drop".into())?;

    world.advance(Duration::from_secs(10)).await;

    let sleeps = world.context.sleeps();
    let expected = [1, 2, 4].map(Duration::from_secs).to_vec();
    check(sleeps == expected, || format!("backoff sleeps {:?}, expected {:?}", sleeps, expected))?;
    check(world.connection.is_connected(), || "did not reconnect".into())?;

    let frame = world.session.frame();
    check(frame.connectivity.is_connected(), || "view still shows disconnected".into())?;
    check(!frame.phase.is_error(), || format!("view errored: {:?}", frame.phase))?;

    let resubscribed = world.controller.messages();
    let expected = vec![ChannelMessage::Subscribe(s0), ChannelMessage::Subscribe(s1)];
    check(resubscribed == expected, || format!("re-subscribe log {:?}, expected {:?}", resubscribed, expected))?;

    Ok(ScenarioMetrics::collect(world))
}

/// SYNC-004: EpochCancel - late poll for a previous selection.
///
/// **Assertion**: the late result never reaches the view or the
/// reconciler; the new selection renders normally.
async fn run_epoch_cancel(world: &mut SimWorld) -> Outcome {
    info!("SYNC-004: EpochCancel - stale poll discarded");

    let (s0, s1) = ids(world);
    world.connect().await;

    world.service.hold(&s0);
    world.select(Some(&s0));
    world.complete_polls().await;
    check(world.pending_polls().len() == 2, || "A's polls should be held".into())?;

    world.select(Some(&s1));
    world.complete_polls().await;

    world.service.release(&s0);
    world.complete_polls().await;
    check(world.pending_polls().is_empty(), || "polls left pending".into())?;

    let frame = world.session.frame();
    check(frame.selected.as_ref() == Some(&s1), || format!("selected {:?}", frame.selected))?;
    check(frame.phase == ViewPhase::Ready, || format!("phase {:?}", frame.phase))?;
    check(world.session.snapshot(&s0).is_none(), || "late result for A was applied".into())?;

    let epoch_b = frame.epoch;
    let leaked = world
        .frames()
        .iter()
        .any(|f| f.epoch == epoch_b && f.selected.as_ref() != Some(&s1));
    check(!leaked, || "a frame for A was rendered under B's epoch".into())?;

    let messages = world.controller.messages();
    check(messages.contains(&ChannelMessage::Unsubscribe(s0)), || {
        format!("A was never unsubscribed: {:?}", messages)
    })?;

    Ok(ScenarioMetrics::collect(world))
}

/// SYNC-005: OutOfOrder - newer push status, older poll arriving later.
///
/// **Assertion**: the pushed status survives the older poll; history
/// stays sorted; delivered shipments show their destination.
async fn run_out_of_order(world: &mut SimWorld) -> Outcome {
    info!("SYNC-005: OutOfOrder - last writer wins per field");

    let (s0, _) = ids(world);
    world.connect().await;
    world.select(Some(&s0));
    world.complete_polls().await;

    let stale_detail = world.fleet.detail_json(&s0).ok_or("fleet lost the shipment")?;

    world.advance(Duration::from_secs(2)).await;
    let now_ms = world.context.now_millis();
    world.fleet.set_status(&s0, TrackingStatus::Delivered, now_ms);
    let event = world.fleet.status_event(&s0).ok_or("fleet lost the shipment")?;
    world.controller.push_status(event);
    world.pump();

    // The poll issued at selection time lands only now
    let epoch = world.session.view().epoch();
    world.handle(SessionEvent::PollCompleted {
        entity: s0.clone(),
        epoch,
        kind: PollKind::Detail,
        outcome: Ok(stale_detail),
    });

    let snapshot = world.session.snapshot(&s0).ok_or("snapshot missing")?;
    check(snapshot.status == TrackingStatus::Delivered, || {
        format!("older poll overwrote status: {:?}", snapshot.status)
    })?;
    check(snapshot.last_updated == now_ms, || {
        format!("last_updated {} != push time {}", snapshot.last_updated, now_ms)
    })?;
    check(
        snapshot.location_history.windows(2).all(|w| w[0].recorded_at <= w[1].recorded_at),
        || "history out of order".into(),
    )?;

    let frame = world.session.frame();
    check(frame.map.has_marker(MarkerKind::Destination), || {
        "delivered shipment without destination marker".into()
    })?;

    Ok(ScenarioMetrics::collect(world))
}

/// SYNC-006: FlakyNetwork - seeded drops, refused handshakes, failing polls.
///
/// **Assertion**: once faults stop and the fleet parks, the view converges
/// on ground truth: connected, current location equal to the fleet's, and
/// a sorted duplicate-free history.
async fn run_flaky_network(world: &mut SimWorld, duration: Duration) -> Outcome {
    info!("SYNC-006: FlakyNetwork - convergence under chaos");

    let (s0, s1) = ids(world);
    world.connect().await;
    world.select(Some(&s0));
    world.watch(&s1);
    world.complete_polls().await;

    let step = Duration::from_secs(1);
    let steps = duration.as_secs();
    for i in 0..steps {
        if world.fleet.roll() < 0.05 {
            debug!(step = i, "injecting channel drop");
            world.controller.drop_connection("injected drop");
        }
        if world.fleet.roll() < 0.05 {
            world.controller.fail_next_connects(2);
        }
        if world.fleet.roll() < 0.05 {
            world.service.fail_next(1);
        }
        world.move_fleet(step);
        world.advance(step).await;
    }

    info!("faults stopped after {} steps; settling", steps);
    world.controller.heal();
    world.service.fail_next(0);
    world.advance(Duration::from_secs(45)).await;

    check(world.connection.is_connected(), || "never reconnected after heal".into())?;

    let frame = world.session.frame();
    check(matches!(frame.phase, ViewPhase::Ready | ViewPhase::Stale), || {
        format!("phase {:?} after settling", frame.phase)
    })?;

    let snapshot = world.session.snapshot(&s0).ok_or("selection has no snapshot")?;
    let history = &snapshot.location_history;
    check(history.windows(2).all(|w| w[0].recorded_at <= w[1].recorded_at), || {
        "history out of order".into()
    })?;
    let unique: HashSet<_> = history.iter().map(|s| s.key()).collect();
    check(unique.len() == history.len(), || "duplicate samples in history".into())?;

    let truth = world
        .fleet
        .shipment(&s0)
        .and_then(|s| s.current())
        .map(|s| s.coordinate())
        .ok_or("fleet lost the shipment")?;
    let seen = snapshot.current_location().map(|s| s.coordinate());
    check(seen == Some(truth), || format!("current {:?} != truth {:?}", seen, truth))?;

    Ok(ScenarioMetrics::collect(world))
}
