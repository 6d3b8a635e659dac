//! Ground truth fleet for simulation.
//!
//! The Fleet maintains the backend's view of every shipment:
//! - True position along a straight pickup-to-destination leg
//! - Status lifecycle (`pending` -> `in_transit` -> `delivered`)
//! - The JSON bodies the REST endpoints and the push channel would serve

use cargotrack_core::{Coordinate, LocationSample, TrackingStatus};
use cargotrack_env::EntityId;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};

const DRIVERS: &[&str] = &["Ana Costa", "Jonas Berg", "Mei Tanaka", "Omar Haddad", "Lena Vogel", "Raúl Ortiz"];

/// A ground truth shipment in the simulation.
#[derive(Debug, Clone)]
pub struct Shipment {
    pub id: EntityId,

    pub pickup: Coordinate,

    pub destination: Coordinate,

    pub status: TrackingStatus,

    /// Fraction of the leg covered, 0.0 - 1.0
    pub progress: f64,

    /// Fraction of the leg covered per second
    pub speed: f64,

    /// Every position ever reported, oldest first
    pub samples: Vec<LocationSample>,

    pub driver: String,

    pub phone: String,

    /// Wall-clock ms of the last change
    pub last_updated: u64,
}

impl Shipment {
    pub fn current(&self) -> Option<&LocationSample> {
        self.samples.last()
    }

    pub fn progress_percentage(&self) -> f64 {
        (self.progress * 100.0).clamp(0.0, 100.0)
    }

    /// Seconds until arrival at the current speed.
    fn remaining_secs(&self) -> u64 {
        if self.speed <= 0.0 {
            return 0;
        }
        ((1.0 - self.progress).max(0.0) / self.speed) as u64
    }

    fn position_at(&self, progress: f64) -> Coordinate {
        Coordinate::new(
            self.pickup.latitude + (self.destination.latitude - self.pickup.latitude) * progress,
            self.pickup.longitude + (self.destination.longitude - self.pickup.longitude) * progress,
        )
    }

    fn record(&mut self, now_ms: u64) {
        let position = self.position_at(self.progress);
        let sample = LocationSample {
            id: Some(format!("{}-{}", self.id, self.samples.len())),
            latitude: position.latitude,
            longitude: position.longitude,
            recorded_at: now_ms,
        };
        self.samples.push(sample);
        self.last_updated = now_ms;
    }
}

/// Deterministic shipment generator and mover.
pub struct Fleet {
    rng: ChaCha8Rng,
    shipments: Vec<Shipment>,
}

impl Fleet {
    /// Creates `count` in-transit shipments, each with its pickup sample at `now_ms`.
    pub fn new(seed: u64, count: usize, now_ms: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let shipments = (0..count)
            .map(|i| {
                let pickup = Coordinate::new(rng.gen_range(36.0..58.0), rng.gen_range(-8.0..28.0));
                let destination = Coordinate::new(
                    pickup.latitude + rng.gen_range(-2.0..2.0),
                    pickup.longitude + rng.gen_range(-2.0..2.0),
                );
                let mut shipment = Shipment {
                    id: EntityId::new(format!("CARGO-{:03}", i + 1)),
                    pickup,
                    destination,
                    status: TrackingStatus::InTransit,
                    progress: 0.0,
                    speed: rng.gen_range(0.001..0.005),
                    samples: Vec::new(),
                    driver: DRIVERS[rng.gen_range(0..DRIVERS.len())].to_string(),
                    phone: format!("+49 30 {:07}", rng.gen_range(0..10_000_000u32)),
                    last_updated: now_ms,
                };
                shipment.record(now_ms);
                shipment
            })
            .collect();

        Self { rng, shipments }
    }

    pub fn shipments(&self) -> &[Shipment] {
        &self.shipments
    }

    pub fn shipment(&self, id: &EntityId) -> Option<&Shipment> {
        self.shipments.iter().find(|s| &s.id == id)
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.shipments.iter().map(|s| s.id.clone()).collect()
    }

    /// Moves every in-transit shipment forward by `dt_secs` and records a
    /// sample at `now_ms`. Returns the ids that moved.
    pub fn step(&mut self, dt_secs: f64, now_ms: u64) -> Vec<EntityId> {
        let mut moved = Vec::new();
        for shipment in &mut self.shipments {
            if shipment.status != TrackingStatus::InTransit {
                continue;
            }
            // Small per-step speed jitter so legs don't move in lockstep
            let jitter = self.rng.gen_range(0.8..1.2);
            shipment.progress = (shipment.progress + shipment.speed * dt_secs * jitter).min(1.0);
            shipment.record(now_ms);
            if shipment.progress >= 1.0 {
                shipment.status = TrackingStatus::Delivered;
            }
            moved.push(shipment.id.clone());
        }
        moved
    }

    /// Forces a status change (e.g. a cancellation) at `now_ms`.
    pub fn set_status(&mut self, id: &EntityId, status: TrackingStatus, now_ms: u64) {
        if let Some(shipment) = self.shipments.iter_mut().find(|s| &s.id == id) {
            shipment.status = status;
            shipment.last_updated = now_ms;
        }
    }

    /// Random number shared with fault injection, so one seed drives everything.
    pub fn roll(&mut self) -> f64 {
        self.rng.gen()
    }

    // ========================================================================
    // WIRE BODIES
    // ========================================================================

    /// `GET /tracking/{id}` body.
    pub fn detail_json(&self, id: &EntityId) -> Option<Vec<u8>> {
        let s = self.shipment(id)?;
        let body = json!({
            "entity_id": s.id,
            "status": s.status,
            "location_history": s.samples.iter().map(sample_json).collect::<Vec<_>>(),
            "driver_info": {
                "name": s.driver,
                "phone": s.phone,
            },
            "last_updated": s.last_updated,
            "progress_percentage": s.progress_percentage(),
            "destination": s.destination,
            "estimated_arrival": s.last_updated + s.remaining_secs() * 1_000,
        });
        Some(body.to_string().into_bytes())
    }

    /// `GET /tracking/{id}/progress` body.
    pub fn progress_json(&self, id: &EntityId) -> Option<Vec<u8>> {
        let s = self.shipment(id)?;
        let body = json!({
            "progress_percentage": s.progress_percentage(),
            "estimated_arrival": s.last_updated + s.remaining_secs() * 1_000,
            "current_location": s.current().map(sample_json),
            "updated_at": s.last_updated,
        });
        Some(body.to_string().into_bytes())
    }

    /// Push `location` event for the latest sample.
    pub fn location_event(&self, id: &EntityId) -> Option<Vec<u8>> {
        let s = self.shipment(id)?;
        let mut body = sample_json(s.current()?);
        body["entity_id"] = json!(s.id);
        Some(body.to_string().into_bytes())
    }

    /// Push `status` event for the current status.
    pub fn status_event(&self, id: &EntityId) -> Option<Vec<u8>> {
        let s = self.shipment(id)?;
        let body = json!({
            "entity_id": s.id,
            "status": s.status,
            "progress_percentage": s.progress_percentage(),
            "destination": s.destination,
            "updated_at": s.last_updated,
        });
        Some(body.to_string().into_bytes())
    }
}

fn sample_json(sample: &LocationSample) -> Value {
    json!({
        "id": sample.id,
        "latitude": sample.latitude,
        "longitude": sample.longitude,
        "recorded_at": sample.recorded_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cargotrack_core::wire::{decode_push, decode_route_progress, decode_tracking_detail, PushKind};

    #[test]
    fn test_same_seed_same_fleet() {
        let a = Fleet::new(42, 3, 0);
        let b = Fleet::new(42, 3, 0);
        for (x, y) in a.shipments().iter().zip(b.shipments()) {
            assert_eq!(x.pickup, y.pickup);
            assert_eq!(x.destination, y.destination);
            assert_eq!(x.driver, y.driver);
        }
    }

    #[test]
    fn test_step_records_monotonic_samples() {
        let mut fleet = Fleet::new(7, 2, 1_000);
        fleet.step(1.0, 2_000);
        fleet.step(1.0, 3_000);

        let s = &fleet.shipments()[0];
        assert_eq!(s.samples.len(), 3);
        assert!(s.samples.windows(2).all(|w| w[0].recorded_at < w[1].recorded_at));
        assert_eq!(s.last_updated, 3_000);
    }

    #[test]
    fn test_shipment_delivers_at_end_of_leg() {
        let mut fleet = Fleet::new(7, 1, 0);
        for i in 1..=2_000 {
            fleet.step(1.0, i * 1_000);
        }
        let s = &fleet.shipments()[0];
        assert_eq!(s.status, TrackingStatus::Delivered);
        assert!((s.progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bodies_decode() {
        let mut fleet = Fleet::new(9, 1, 1_000);
        fleet.step(1.0, 2_000);
        let id = fleet.ids()[0].clone();

        let detail = decode_tracking_detail(&id, &fleet.detail_json(&id).unwrap()).unwrap();
        assert_eq!(detail.samples.len(), 2);
        assert_eq!(detail.status, Some(TrackingStatus::InTransit));

        let progress = decode_route_progress(&id, &fleet.progress_json(&id).unwrap()).unwrap();
        assert_eq!(progress.observed_at, 2_000);

        let push = decode_push(PushKind::Location, &fleet.location_event(&id).unwrap()).unwrap();
        assert_eq!(push.entity_id, id);
        assert_eq!(push.samples[0].recorded_at, 2_000);

        let status = decode_push(PushKind::Status, &fleet.status_event(&id).unwrap()).unwrap();
        assert!(status.destination.is_some());
    }
}
