//! The "VIEW" Engine - selection state machine for the tracking screen
//!
//! Phases:
//!
//! ```text
//!   NoSelection --select--> Loading --snapshot--> Ready --tick--> Stale
//!                              |                    ^               |
//!                              | unrecoverable      +---snapshot----+
//!                              v
//!                            Error --retry / reselect--> Loading
//! ```
//!
//! Each selection gets a fresh epoch. Poll results are tagged with the epoch
//! they were issued under and anything older than the current one is
//! discarded without effect.

use cargotrack_env::{EntityId, EnvError, ViewerIdentity};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::connection::{ConnectionEvent, ConnectionStatus};
use crate::model::{TrackingSnapshot, TrackingStatus};
use crate::projector::{MapProjector, MapScene};

// ============================================================================
// PHASE & ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
pub enum ViewError {
    #[error("Shipment {0} not found")]
    NotFound(String),

    #[error("Not allowed to view shipment {0}")]
    Forbidden(String),

    #[error("Failed to load shipment {entity}: {reason}")]
    Unrecoverable { entity: String, reason: String },
}

impl ViewError {
    fn from_env(entity: &EntityId, err: &EnvError) -> Self {
        match err {
            EnvError::NotFound(_) => Self::NotFound(entity.to_string()),
            EnvError::Forbidden(_) => Self::Forbidden(entity.to_string()),
            other => Self::Unrecoverable {
                entity: entity.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ViewPhase {
    NoSelection,
    Loading,
    Ready,
    Stale,
    Error(ViewError),
}

impl ViewPhase {
    pub fn name(&self) -> &'static str {
        match self {
            ViewPhase::NoSelection => "no_selection",
            ViewPhase::Loading => "loading",
            ViewPhase::Ready => "ready",
            ViewPhase::Stale => "stale",
            ViewPhase::Error(_) => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ViewPhase::Error(_))
    }
}

// ============================================================================
// RENDER OUTPUT
// ============================================================================

/// Connectivity indicator shown next to the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connectivity {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub next_retry_in: Option<Duration>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            next_retry_in: None,
        }
    }
}

impl Connectivity {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Driver details visible to the current viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverContact {
    pub name: String,

    /// Only populated for staff viewers
    pub phone: Option<String>,

    pub vehicle: Option<String>,
}

/// Immutable description of everything the tracking screen shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderFrame {
    pub epoch: u64,
    pub selected: Option<EntityId>,
    pub phase: ViewPhase,
    pub connectivity: Connectivity,
    pub status: Option<TrackingStatus>,
    pub last_updated: Option<u64>,
    pub progress_percentage: Option<f64>,
    pub estimated_arrival: Option<u64>,
    pub driver: Option<DriverContact>,
    pub map: MapScene,
}

/// Result of a selection change.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Entity shown before, whose subscription should be released
    pub previous: Option<EntityId>,

    /// Epoch the initial poll must be tagged with
    pub epoch: u64,

    /// False for a retry of the same entity; subscriptions stay as they are
    pub switched: bool,

    pub frame: RenderFrame,
}

// ============================================================================
// VIEW MODEL
// ============================================================================

pub struct TrackingViewModel {
    viewer: ViewerIdentity,
    projector: MapProjector,
    freshness_threshold_ms: u64,

    selected: Option<EntityId>,
    epoch: u64,
    phase: ViewPhase,
    connectivity: Connectivity,

    snapshot: Option<TrackingSnapshot>,
    scene: MapScene,
}

impl TrackingViewModel {
    pub fn new(viewer: ViewerIdentity, projector: MapProjector, freshness_threshold: Duration) -> Self {
        Self {
            viewer,
            projector,
            freshness_threshold_ms: freshness_threshold.as_millis() as u64,
            selected: None,
            epoch: 0,
            phase: ViewPhase::NoSelection,
            connectivity: Connectivity::default(),
            snapshot: None,
            scene: MapScene::default(),
        }
    }

    pub fn phase(&self) -> &ViewPhase {
        &self.phase
    }

    pub fn selected(&self) -> Option<&EntityId> {
        self.selected.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn viewer(&self) -> &ViewerIdentity {
        &self.viewer
    }

    /// Is `epoch` the one current polls must carry?
    pub fn is_current(&self, entity: &EntityId, epoch: u64) -> bool {
        epoch == self.epoch && self.selected.as_ref() == Some(entity)
    }

    /// Changes the selection.
    ///
    /// Returns `None` when `id` is already selected and nothing needs to
    /// happen. Re-selecting the current entity from `Error` retries it.
    pub fn select_entity(&mut self, id: Option<EntityId>) -> Option<Selection> {
        if id == self.selected {
            if self.phase.is_error() {
                return self.retry();
            }
            return None;
        }

        let previous = std::mem::replace(&mut self.selected, id);
        self.epoch += 1;
        self.snapshot = None;
        self.scene = MapScene::default();
        self.phase = if self.selected.is_some() {
            ViewPhase::Loading
        } else {
            ViewPhase::NoSelection
        };

        debug!(
            previous = ?previous.as_ref().map(EntityId::as_str),
            selected = ?self.selected.as_ref().map(EntityId::as_str),
            epoch = self.epoch,
            "selection changed"
        );

        Some(Selection {
            previous,
            epoch: self.epoch,
            switched: true,
            frame: self.frame(),
        })
    }

    /// Manual retry from `Error`. Returns `None` in every other phase.
    pub fn retry(&mut self) -> Option<Selection> {
        if !self.phase.is_error() {
            return None;
        }
        self.epoch += 1;
        self.phase = ViewPhase::Loading;
        debug!(epoch = self.epoch, "retrying selection");

        Some(Selection {
            previous: None,
            epoch: self.epoch,
            switched: false,
            frame: self.frame(),
        })
    }

    /// Feeds a reconciled snapshot. Snapshots of other entities are ignored.
    pub fn on_snapshot(&mut self, snapshot: &TrackingSnapshot) -> Option<RenderFrame> {
        if self.selected.as_ref() != Some(&snapshot.entity_id) {
            return None;
        }

        match self.phase {
            ViewPhase::Loading | ViewPhase::Stale | ViewPhase::Ready => {}
            // An errored selection only leaves Error through a retry
            ViewPhase::Error(_) | ViewPhase::NoSelection => return None,
        }

        if self.phase != ViewPhase::Loading && self.snapshot.as_ref() == Some(snapshot) {
            return None;
        }

        // Stale data stays stale until something newer than the held snapshot arrives
        let fresher = self
            .snapshot
            .as_ref()
            .map_or(true, |held| snapshot.last_updated > held.last_updated);
        self.scene = self.projector.project(snapshot);
        self.snapshot = Some(snapshot.clone());
        if self.phase != ViewPhase::Stale || fresher {
            self.phase = ViewPhase::Ready;
        }
        Some(self.frame())
    }

    /// Marks the selection stale once its data is older than the freshness threshold.
    pub fn tick(&mut self, now_ms: u64) -> Option<RenderFrame> {
        if self.phase != ViewPhase::Ready {
            return None;
        }
        let last_updated = self.snapshot.as_ref()?.last_updated;
        let age = now_ms.saturating_sub(last_updated);
        if age <= self.freshness_threshold_ms {
            return None;
        }

        debug!(age_ms = age, "selection went stale");
        self.phase = ViewPhase::Stale;
        Some(self.frame())
    }

    /// Reports a failed poll.
    ///
    /// Stale epochs are dropped. Unrecoverable failures move the view to
    /// `Error`; transient ones leave the phase alone.
    pub fn on_poll_failed(&mut self, entity: &EntityId, epoch: u64, failure: &EnvError) -> Option<RenderFrame> {
        if !self.is_current(entity, epoch) {
            debug!(entity = %entity, epoch, current = self.epoch, "discarding failure of stale poll");
            return None;
        }
        if !failure.is_unrecoverable() {
            debug!(entity = %entity, error = %failure, "transient poll failure");
            return None;
        }
        if self.phase.is_error() {
            return None;
        }

        self.phase = ViewPhase::Error(ViewError::from_env(entity, failure));
        Some(self.frame())
    }

    /// Updates the connectivity indicator. Never changes the phase.
    pub fn on_connectivity(&mut self, event: &ConnectionEvent) -> Option<RenderFrame> {
        let next = Connectivity {
            status: event.status,
            retry_count: event.retry_count,
            next_retry_in: event.next_retry_in,
        };
        if next == self.connectivity {
            return None;
        }
        self.connectivity = next;
        Some(self.frame())
    }

    /// Current render output.
    pub fn frame(&self) -> RenderFrame {
        let snapshot = self.snapshot.as_ref();

        RenderFrame {
            epoch: self.epoch,
            selected: self.selected.clone(),
            phase: self.phase.clone(),
            connectivity: self.connectivity.clone(),
            status: snapshot.map(|s| s.status.clone()),
            last_updated: snapshot.map(|s| s.last_updated),
            progress_percentage: snapshot.and_then(|s| s.progress_percentage),
            estimated_arrival: snapshot.and_then(|s| s.estimated_arrival),
            driver: snapshot.and_then(|s| s.driver_info.as_ref()).map(|d| DriverContact {
                name: d.name.clone(),
                phone: if self.viewer.role.is_staff() {
                    d.phone.clone()
                } else {
                    None
                },
                vehicle: d.vehicle.clone(),
            }),
            map: self.scene.clone(),
        }
    }
}
