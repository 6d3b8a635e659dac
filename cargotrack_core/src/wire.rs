//! Wire decoding - raw JSON payloads into validated updates.
//!
//! Both update sources (REST poll bodies and push channel frames) are
//! decoded here into one [`Update`] shape. Every field of the wire structs
//! is optional so that a missing field surfaces as a precise
//! [`ReconcileError::Malformed`] instead of an opaque serde error, and so
//! that validation happens before anything reaches the reconciler.

use cargotrack_env::EntityId;
use serde::Deserialize;

use crate::model::{Coordinate, DriverInfo, LocationSample, TrackingStatus};
use crate::reconciler::ReconcileError;

// ============================================================================
// VALIDATED UPDATE (Output)
// ============================================================================

/// Where an update came from.
///
/// The ordering matters: on equal timestamps a push update outranks a poll
/// result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateSource {
    Poll,
    Push,
}

/// A validated fragment of tracking data, ready to merge.
///
/// `None` scalar fields mean "not reported", never "cleared".
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub entity_id: EntityId,

    pub source: UpdateSource,

    /// Timestamp the scalar fields are valid at (ms since epoch)
    pub observed_at: u64,

    pub samples: Vec<LocationSample>,

    pub status: Option<TrackingStatus>,

    pub progress_percentage: Option<f64>,

    pub driver_info: Option<DriverInfo>,

    pub destination: Option<Coordinate>,

    pub estimated_arrival: Option<u64>,
}

impl Update {
    /// A bare update carrying nothing but its identity and timestamp.
    pub fn new(entity_id: EntityId, source: UpdateSource, observed_at: u64) -> Self {
        Self {
            entity_id,
            source,
            observed_at,
            samples: Vec::new(),
            status: None,
            progress_percentage: None,
            driver_info: None,
            destination: None,
            estimated_arrival: None,
        }
    }

    pub fn with_sample(mut self, sample: LocationSample) -> Self {
        self.samples.push(sample);
        self
    }

    pub fn with_status(mut self, status: TrackingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress_percentage = Some(progress);
        self
    }
}

/// Kind of push frame, mirroring the channel's two event callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    Location,
    Status,
}

// ============================================================================
// WIRE FORMATS (Input)
// ============================================================================

#[derive(Debug, Deserialize)]
struct SampleWire {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    recorded_at: Option<u64>,
}

/// Body of `GET /tracking/{id}`.
#[derive(Debug, Deserialize)]
struct TrackingDetailWire {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    status: Option<TrackingStatus>,
    #[serde(default)]
    location_history: Vec<SampleWire>,
    #[serde(default)]
    driver_info: Option<DriverInfo>,
    #[serde(default)]
    last_updated: Option<u64>,
    #[serde(default)]
    progress_percentage: Option<f64>,
    #[serde(default)]
    destination: Option<Coordinate>,
    #[serde(default)]
    estimated_arrival: Option<u64>,
}

/// Body of `GET /tracking/{id}/progress`.
#[derive(Debug, Deserialize)]
struct RouteProgressWire {
    #[serde(default)]
    progress_percentage: Option<f64>,
    #[serde(default)]
    estimated_arrival: Option<u64>,
    #[serde(default)]
    current_location: Option<SampleWire>,
    #[serde(default)]
    updated_at: Option<u64>,
}

/// Push `location` event: one inline point.
#[derive(Debug, Deserialize)]
struct LocationEventWire {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(flatten)]
    sample: SampleWire,
}

/// Push `status` event.
#[derive(Debug, Deserialize)]
struct StatusEventWire {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    status: Option<TrackingStatus>,
    #[serde(default)]
    progress_percentage: Option<f64>,
    #[serde(default)]
    driver_info: Option<DriverInfo>,
    #[serde(default)]
    destination: Option<Coordinate>,
    #[serde(default)]
    estimated_arrival: Option<u64>,
    #[serde(default)]
    updated_at: Option<u64>,
}

// ============================================================================
// DECODERS
// ============================================================================

/// Decodes a tracking-detail poll body for `entity`.
///
/// Required: `last_updated`, and every history sample must be complete.
/// An `entity_id` in the body, if present, must match the polled entity.
pub fn decode_tracking_detail(entity: &EntityId, payload: &[u8]) -> Result<Update, ReconcileError> {
    let wire: TrackingDetailWire = parse(Some(entity), payload)?;

    if let Some(body_id) = wire.entity_id.as_deref() {
        if body_id != entity.as_str() {
            return Err(ReconcileError::malformed(
                Some(entity),
                format!("body belongs to {body_id}"),
            ));
        }
    }

    let observed_at = wire
        .last_updated
        .ok_or_else(|| ReconcileError::malformed(Some(entity), "missing last_updated"))?;

    let samples = wire
        .location_history
        .into_iter()
        .map(|s| validate_sample(entity, s))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Update {
        entity_id: entity.clone(),
        source: UpdateSource::Poll,
        observed_at,
        samples,
        status: wire.status,
        progress_percentage: validate_progress(entity, wire.progress_percentage)?,
        driver_info: wire.driver_info,
        destination: validate_destination(entity, wire.destination)?,
        estimated_arrival: wire.estimated_arrival,
    })
}

/// Decodes a route-progress poll body for `entity`.
///
/// The endpoint has no dedicated timestamp in older backends; the current
/// location's `recorded_at` stands in when `updated_at` is absent. A body
/// with neither is malformed.
pub fn decode_route_progress(entity: &EntityId, payload: &[u8]) -> Result<Update, ReconcileError> {
    let wire: RouteProgressWire = parse(Some(entity), payload)?;

    let current = wire
        .current_location
        .map(|s| validate_sample(entity, s))
        .transpose()?;

    let observed_at = wire
        .updated_at
        .or_else(|| current.as_ref().map(|s| s.recorded_at))
        .ok_or_else(|| ReconcileError::malformed(Some(entity), "missing updated_at"))?;

    Ok(Update {
        entity_id: entity.clone(),
        source: UpdateSource::Poll,
        observed_at,
        samples: current.into_iter().collect(),
        status: None,
        progress_percentage: validate_progress(entity, wire.progress_percentage)?,
        driver_info: None,
        destination: None,
        estimated_arrival: wire.estimated_arrival,
    })
}

/// Decodes a push frame payload.
pub fn decode_push(kind: PushKind, payload: &[u8]) -> Result<Update, ReconcileError> {
    match kind {
        PushKind::Location => decode_location_event(payload),
        PushKind::Status => decode_status_event(payload),
    }
}

fn decode_location_event(payload: &[u8]) -> Result<Update, ReconcileError> {
    let wire: LocationEventWire = parse(None, payload)?;
    let entity = require_entity(wire.entity_id)?;
    let sample = validate_sample(&entity, wire.sample)?;

    Ok(Update::new(entity, UpdateSource::Push, sample.recorded_at).with_sample(sample))
}

fn decode_status_event(payload: &[u8]) -> Result<Update, ReconcileError> {
    let wire: StatusEventWire = parse(None, payload)?;
    let entity = require_entity(wire.entity_id)?;

    let observed_at = wire
        .updated_at
        .ok_or_else(|| ReconcileError::malformed(Some(&entity), "missing updated_at"))?;

    Ok(Update {
        progress_percentage: validate_progress(&entity, wire.progress_percentage)?,
        destination: validate_destination(&entity, wire.destination)?,
        entity_id: entity,
        source: UpdateSource::Push,
        observed_at,
        samples: Vec::new(),
        status: wire.status,
        driver_info: wire.driver_info,
        estimated_arrival: wire.estimated_arrival,
    })
}

fn parse<'a, T: Deserialize<'a>>(entity: Option<&EntityId>, payload: &'a [u8]) -> Result<T, ReconcileError> {
    serde_json::from_slice(payload).map_err(|e| ReconcileError::malformed(entity, e.to_string()))
}

fn require_entity(id: Option<String>) -> Result<EntityId, ReconcileError> {
    match id {
        Some(id) if !id.is_empty() => Ok(EntityId::new(id)),
        _ => Err(ReconcileError::malformed(None, "missing entity_id")),
    }
}

fn validate_sample(entity: &EntityId, wire: SampleWire) -> Result<LocationSample, ReconcileError> {
    let (Some(latitude), Some(longitude), Some(recorded_at)) =
        (wire.latitude, wire.longitude, wire.recorded_at)
    else {
        return Err(ReconcileError::malformed(
            Some(entity),
            "location sample missing latitude/longitude/recorded_at",
        ));
    };

    if !Coordinate::new(latitude, longitude).is_valid() {
        return Err(ReconcileError::malformed(
            Some(entity),
            format!("coordinate out of range: ({latitude}, {longitude})"),
        ));
    }

    Ok(LocationSample {
        id: wire.id,
        latitude,
        longitude,
        recorded_at,
    })
}

fn validate_progress(entity: &EntityId, progress: Option<f64>) -> Result<Option<f64>, ReconcileError> {
    match progress {
        Some(p) if !p.is_finite() || !(0.0..=100.0).contains(&p) => Err(ReconcileError::malformed(
            Some(entity),
            format!("progress_percentage out of range: {p}"),
        )),
        other => Ok(other),
    }
}

fn validate_destination(
    entity: &EntityId,
    destination: Option<Coordinate>,
) -> Result<Option<Coordinate>, ReconcileError> {
    match destination {
        Some(c) if !c.is_valid() => Err(ReconcileError::malformed(
            Some(entity),
            "destination out of range",
        )),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cargo() -> EntityId {
        EntityId::from("CARGO-1")
    }

    #[test]
    fn test_decode_tracking_detail() {
        let body = br#"{
            "entity_id": "CARGO-1",
            "status": "in_transit",
            "last_updated": 1700000060000,
            "progress_percentage": 42.5,
            "driver_info": { "name": "R. Okafor", "phone": "+254700000000" },
            "location_history": [
                { "id": "s1", "latitude": -1.29, "longitude": 36.82, "recorded_at": 1700000000000 },
                { "id": "s2", "latitude": -1.30, "longitude": 36.85, "recorded_at": 1700000060000 }
            ]
        }"#;

        let update = decode_tracking_detail(&cargo(), body).unwrap();
        assert_eq!(update.source, UpdateSource::Poll);
        assert_eq!(update.observed_at, 1_700_000_060_000);
        assert_eq!(update.samples.len(), 2);
        assert_eq!(update.status, Some(TrackingStatus::InTransit));
        assert_eq!(update.progress_percentage, Some(42.5));
    }

    #[test]
    fn test_detail_missing_last_updated_is_malformed() {
        let body = br#"{ "status": "pending", "location_history": [] }"#;
        let err = decode_tracking_detail(&cargo(), body).unwrap_err();
        assert!(err.to_string().contains("last_updated"));
    }

    #[test]
    fn test_detail_for_other_entity_is_malformed() {
        let body = br#"{ "entity_id": "CARGO-9", "last_updated": 1 }"#;
        assert!(decode_tracking_detail(&cargo(), body).is_err());
    }

    #[test]
    fn test_incomplete_sample_rejects_whole_fragment() {
        let body = br#"{
            "last_updated": 5,
            "location_history": [
                { "id": "s1", "latitude": 1.0, "longitude": 2.0, "recorded_at": 1 },
                { "id": "s2", "latitude": 1.0, "recorded_at": 2 }
            ]
        }"#;
        assert!(decode_tracking_detail(&cargo(), body).is_err());
    }

    #[test]
    fn test_decode_location_event_without_id() {
        let body = br#"{ "entity_id": "CARGO-1", "latitude": 10.0, "longitude": 20.0, "recorded_at": 99 }"#;
        let update = decode_push(PushKind::Location, body).unwrap();

        assert_eq!(update.entity_id, cargo());
        assert_eq!(update.source, UpdateSource::Push);
        assert_eq!(update.observed_at, 99);
        assert_eq!(update.samples[0].id, None);
        assert_eq!(update.status, None);
    }

    #[test]
    fn test_location_event_requires_entity() {
        let body = br#"{ "latitude": 10.0, "longitude": 20.0, "recorded_at": 99 }"#;
        assert!(decode_push(PushKind::Location, body).is_err());
    }

    #[test]
    fn test_decode_status_event() {
        let body = br#"{ "entity_id": "CARGO-1", "status": "delivered", "updated_at": 500,
                         "destination": { "latitude": 1.5, "longitude": 2.5 } }"#;
        let update = decode_push(PushKind::Status, body).unwrap();
        assert_eq!(update.status, Some(TrackingStatus::Delivered));
        assert_eq!(update.destination, Some(Coordinate::new(1.5, 2.5)));
    }

    #[test]
    fn test_route_progress_falls_back_to_sample_time() {
        let body = br#"{ "progress_percentage": 80,
                         "current_location": { "latitude": 1.0, "longitude": 1.0, "recorded_at": 777 } }"#;
        let update = decode_route_progress(&cargo(), body).unwrap();
        assert_eq!(update.observed_at, 777);
        assert_eq!(update.samples.len(), 1);
    }

    #[test]
    fn test_progress_out_of_range() {
        let body = br#"{ "progress_percentage": 130, "updated_at": 1 }"#;
        assert!(decode_route_progress(&cargo(), body).is_err());
    }

    #[test]
    fn test_garbage_payload() {
        assert!(decode_push(PushKind::Status, b"not json").is_err());
    }
}
