//! The async runtime driven by the simulated environment.

use cargotrack_core::{MarkerKind, RenderFrame, SessionConfig, TrackingRuntime, ViewPhase};
use cargotrack_env::{ChannelController, TrackingContext, ViewerIdentity, ViewerRole};
use cargotrack_sim::{ChannelMessage, Fleet, SimChannelController, SimContext, SimPushChannel, SimTrackingService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    ctx: Arc<SimContext>,
    controller: SimChannelController,
    service: Arc<SimTrackingService>,
    fleet: Fleet,
}

fn setup(
    role: ViewerRole,
) -> (
    Harness,
    TrackingRuntime<SimContext, SimPushChannel, SimTrackingService>,
    cargotrack_core::RuntimeHandle,
    UnboundedReceiver<RenderFrame>,
) {
    let ctx = SimContext::shared(11);
    let (channel, controller) = SimPushChannel::pair();
    let service = Arc::new(SimTrackingService::new());
    let fleet = Fleet::new(11, 2, ctx.now_millis());
    for id in fleet.ids() {
        service.set_detail(&id, fleet.detail_json(&id).unwrap());
        service.set_progress(&id, fleet.progress_json(&id).unwrap());
    }

    // Ticks shorter than the first backoff so the two show up apart in the sleep log
    let config = SessionConfig {
        tick_interval: Duration::from_millis(250),
        ..SessionConfig::default()
    };
    let (runtime, handle, frames) = TrackingRuntime::new(
        Arc::clone(&ctx),
        channel,
        Arc::clone(&service),
        ViewerIdentity::new("sim-viewer", role),
        config,
    );

    let harness = Harness {
        ctx,
        controller,
        service,
        fleet,
    };
    (harness, runtime, handle, frames)
}

async fn next_frame<F>(frames: &mut UnboundedReceiver<RenderFrame>, pred: F) -> RenderFrame
where
    F: Fn(&RenderFrame) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let frame = frames.recv().await.expect("runtime stopped");
            if pred(&frame) {
                return frame;
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn wait_for_sleep(ctx: &SimContext, duration: Duration) {
    tokio::time::timeout(WAIT, async {
        while !ctx.sleeps().contains(&duration) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("sleep never requested");
}

#[tokio::test]
async fn test_selection_renders_fleet_data() {
    let (h, runtime, handle, mut frames) = setup(ViewerRole::Dispatcher);
    let task = tokio::spawn(runtime.run());

    let id = h.fleet.ids()[0].clone();
    handle.select(Some(id.clone()));

    let ready = next_frame(&mut frames, |f| f.phase == ViewPhase::Ready).await;
    assert_eq!(ready.selected, Some(id.clone()));
    assert!(ready.map.has_marker(MarkerKind::Pickup));
    let driver = ready.driver.expect("driver shown");
    assert!(driver.phone.is_some());

    assert!(handle.shutdown());
    let session = task.await.unwrap();
    assert!(session.registry().is_subscribed(&id));
    assert_eq!(h.controller.messages()[0], ChannelMessage::Subscribe(id));
}

#[tokio::test]
async fn test_client_viewer_never_sees_phone() {
    let (h, runtime, handle, mut frames) = setup(ViewerRole::Client);
    let task = tokio::spawn(runtime.run());

    handle.select(Some(h.fleet.ids()[0].clone()));
    let ready = next_frame(&mut frames, |f| f.phase == ViewPhase::Ready).await;
    assert_eq!(ready.driver.and_then(|d| d.phone), None);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_pushed_location_extends_route() {
    let (mut h, runtime, handle, mut frames) = setup(ViewerRole::Dispatcher);
    let task = tokio::spawn(runtime.run());

    let id = h.fleet.ids()[0].clone();
    handle.select(Some(id.clone()));
    next_frame(&mut frames, |f| f.phase == ViewPhase::Ready && f.connectivity.is_connected()).await;

    h.ctx.advance_time(Duration::from_secs(1));
    h.fleet.step(1.0, h.ctx.now_millis());
    assert!(h.controller.push_location(h.fleet.location_event(&id).unwrap()));

    let moved = next_frame(&mut frames, |f| f.map.has_marker(MarkerKind::Current)).await;
    assert_eq!(moved.map.route.map(|r| r.points.len()), Some(2));

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_drop_reconnects_after_virtual_backoff() {
    let (h, runtime, handle, mut frames) = setup(ViewerRole::Dispatcher);
    let task = tokio::spawn(runtime.run());

    let id = h.fleet.ids()[0].clone();
    handle.select(Some(id.clone()));
    next_frame(&mut frames, |f| f.phase == ViewPhase::Ready && f.connectivity.is_connected()).await;
    h.controller.take_messages();

    h.controller.drop_connection("reset");
    let down = next_frame(&mut frames, |f| !f.connectivity.is_connected()).await;
    assert_eq!(down.connectivity.retry_count, 1);
    assert_eq!(down.connectivity.next_retry_in, Some(Duration::from_secs(1)));
    assert_eq!(down.phase, ViewPhase::Ready);

    wait_for_sleep(&h.ctx, Duration::from_secs(1)).await;
    h.ctx.advance_time(Duration::from_secs(1));

    let up = next_frame(&mut frames, |f| f.connectivity.is_connected()).await;
    assert_eq!(up.connectivity.retry_count, 0);

    handle.shutdown();
    task.await.unwrap();
    assert_eq!(h.controller.messages(), vec![ChannelMessage::Subscribe(id)]);
}

#[tokio::test]
async fn test_missing_shipment_errors_until_retry() {
    let (h, runtime, handle, mut frames) = setup(ViewerRole::Dispatcher);
    let task = tokio::spawn(runtime.run());

    let id = h.fleet.ids()[1].clone();
    h.service.remove(&id);
    handle.select(Some(id.clone()));
    let failed = next_frame(&mut frames, |f| f.phase.is_error()).await;
    assert_eq!(failed.selected, Some(id.clone()));

    h.service.set_detail(&id, h.fleet.detail_json(&id).unwrap());
    h.service.set_progress(&id, h.fleet.progress_json(&id).unwrap());
    handle.retry();
    next_frame(&mut frames, |f| f.phase == ViewPhase::Ready).await;

    handle.shutdown();
    task.await.unwrap();
}
