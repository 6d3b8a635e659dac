//! Tracking data model: samples, statuses and the reconciled snapshot.

use cargotrack_env::EntityId;
use serde::{Deserialize, Serialize};

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// True when both components are finite and inside WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One recorded position of a shipment. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Backend sample id; inline push points may not carry one
    pub id: Option<String>,

    pub latitude: f64,

    pub longitude: f64,

    /// Milliseconds since the Unix epoch
    pub recorded_at: u64,
}

impl LocationSample {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    /// Identity used for deduplication.
    pub fn key(&self) -> SampleKey {
        match &self.id {
            Some(id) => SampleKey::Id(id.clone()),
            None => self.point_key(),
        }
    }

    /// The exact point and time, ignoring any id.
    pub fn point_key(&self) -> SampleKey {
        SampleKey::Point {
            latitude: self.latitude.to_bits(),
            longitude: self.longitude.to_bits(),
            recorded_at: self.recorded_at,
        }
    }
}

/// Dedup identity of a sample: its id, or the exact point when id-less.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SampleKey {
    Id(String),
    Point {
        latitude: u64,
        longitude: u64,
        recorded_at: u64,
    },
}

/// Shipment lifecycle status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Pending,
    InTransit,
    Delivered,
    Cancelled,
    /// Not reported yet, or a status this client does not know
    #[default]
    #[serde(other)]
    Unknown,
}

impl TrackingStatus {
    /// Delivered and cancelled shipments never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackingStatus::Delivered | TrackingStatus::Cancelled)
    }
}

/// Driver assigned to a shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub name: String,

    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    pub vehicle: Option<String>,
}

/// The reconciled, current view of one entity's tracking data.
///
/// `location_history` is non-decreasing in `recorded_at` and free of
/// duplicates; its last element is the current location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    pub entity_id: EntityId,

    pub status: TrackingStatus,

    pub location_history: Vec<LocationSample>,

    pub driver_info: Option<DriverInfo>,

    /// Newest timestamp of any accepted update (ms since epoch)
    pub last_updated: u64,

    pub progress_percentage: Option<f64>,

    /// Delivery coordinate, when the backend has disclosed it
    pub destination: Option<Coordinate>,

    /// Estimated arrival (ms since epoch)
    pub estimated_arrival: Option<u64>,
}

impl TrackingSnapshot {
    /// An empty snapshot for an entity seen for the first time.
    pub fn empty(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            status: TrackingStatus::default(),
            location_history: Vec::new(),
            driver_info: None,
            last_updated: 0,
            progress_percentage: None,
            destination: None,
            estimated_arrival: None,
        }
    }

    /// The last sample of the history.
    pub fn current_location(&self) -> Option<&LocationSample> {
        self.location_history.last()
    }

    /// The first sample of the history.
    pub fn pickup_location(&self) -> Option<&LocationSample> {
        self.location_history.first()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
