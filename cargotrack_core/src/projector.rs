//! The "MAP" Projector - snapshot to render instructions
//!
//! Pure translation of a reconciled snapshot into immutable drawing
//! primitives. No clock, no I/O, no retained state: the same snapshot
//! always yields the same scene, so the map layer can diff or redraw
//! freely.

use geo::{BoundingRect, MultiPoint, Point};
use serde::{Deserialize, Serialize};

use crate::model::{Coordinate, TrackingSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Pickup,
    Destination,
    Current,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub kind: MarkerKind,
    pub position: Coordinate,
}

/// Ordered path through the location history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    pub points: Vec<Coordinate>,
}

/// Camera region in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl Bounds {
    pub fn contains(&self, c: &Coordinate) -> bool {
        (self.south..=self.north).contains(&c.latitude) && (self.west..=self.east).contains(&c.longitude)
    }
}

/// Everything the map layer needs to draw one shipment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapScene {
    /// In draw order: pickup, destination, current
    pub markers: Vec<Marker>,

    pub route: Option<Polyline>,

    /// `None` when nothing is drawn
    pub bounds: Option<Bounds>,
}

impl MapScene {
    pub fn marker(&self, kind: MarkerKind) -> Option<&Marker> {
        self.markers.iter().find(|m| m.kind == kind)
    }

    pub fn has_marker(&self, kind: MarkerKind) -> bool {
        self.marker(kind).is_some()
    }
}

/// Projects snapshots onto map primitives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapProjector {
    /// Degrees added on every side of the marker bounding box
    padding: f64,
}

impl Default for MapProjector {
    fn default() -> Self {
        Self { padding: 0.01 }
    }
}

impl MapProjector {
    pub fn new(padding: f64) -> Self {
        Self {
            padding: padding.max(0.0),
        }
    }

    /// Builds the scene for one snapshot.
    ///
    /// - Pickup: first history sample.
    /// - Destination: only once the shipment is terminal and the coordinate is known.
    /// - Current: last sample, only when the history holds more than one point.
    /// - Route: all samples, only when there is more than one.
    /// - Bounds: the rendered markers, padded.
    pub fn project(&self, snapshot: &TrackingSnapshot) -> MapScene {
        let history = &snapshot.location_history;
        let in_motion = history.len() > 1;
        let mut markers = Vec::with_capacity(3);

        if let Some(pickup) = snapshot.pickup_location() {
            markers.push(Marker {
                kind: MarkerKind::Pickup,
                position: pickup.coordinate(),
            });
        }

        if snapshot.is_terminal() {
            if let Some(destination) = snapshot.destination {
                markers.push(Marker {
                    kind: MarkerKind::Destination,
                    position: destination,
                });
            }
        }

        if in_motion {
            if let Some(current) = snapshot.current_location() {
                markers.push(Marker {
                    kind: MarkerKind::Current,
                    position: current.coordinate(),
                });
            }
        }

        let route = in_motion.then(|| Polyline {
            points: history.iter().map(|s| s.coordinate()).collect(),
        });

        let bounds = self.bounds_of(&markers);

        MapScene {
            markers,
            route,
            bounds,
        }
    }

    fn bounds_of(&self, markers: &[Marker]) -> Option<Bounds> {
        let points: MultiPoint<f64> = markers
            .iter()
            .map(|m| Point::new(m.position.longitude, m.position.latitude))
            .collect::<Vec<_>>()
            .into();
        let rect = points.bounding_rect()?;

        Some(Bounds {
            south: (rect.min().y - self.padding).max(-90.0),
            west: (rect.min().x - self.padding).max(-180.0),
            north: (rect.max().y + self.padding).min(90.0),
            east: (rect.max().x + self.padding).min(180.0),
        })
    }
}
