//! The "RECONCILE" Engine - one authoritative snapshot per entity
//!
//! Three sources feed the same entity: the initial poll, the periodic poll
//! and push events. They arrive in any order, so the merge is built to be
//! order-insensitive:
//! - Location history is a set union (by sample id; an id-less sample
//!   matches any stored sample at the same point and time), re-sorted by
//!   `recorded_at` and capped.
//! - Scalar fields are last-writer-wins by *timestamp*, never by arrival.
//!   Each field carries its own stamp; on equal timestamps push beats poll.
//!
//! Applying the same update twice is a no-op, and a no-op merge emits
//! nothing.

use cargotrack_env::EntityId;
use std::collections::{HashMap, HashSet};
use tracing::trace;

use crate::model::{LocationSample, TrackingSnapshot};
use crate::wire::{Update, UpdateSource};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the UpdateReconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Maximum samples kept per entity; oldest are evicted first (default: 500)
    pub max_history: usize,

    /// Grace period before an unreferenced terminal snapshot is evicted, in ms (default: 5min)
    pub terminal_grace_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_history: 500,
            terminal_grace_ms: 300_000,
        }
    }
}

// ============================================================================
// STAMPS (Per-field versions)
// ============================================================================

/// Version of a scalar field: when it was true, and who said so.
///
/// Ordered by time first, then source (`Push > Poll`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Stamp {
    at: u64,
    source: UpdateSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct FieldStamps {
    status: Option<Stamp>,
    progress: Option<Stamp>,
    driver: Option<Stamp>,
    destination: Option<Stamp>,
    estimated_arrival: Option<Stamp>,
}

/// Strictly newer wins; an identical stamp keeps the current value.
fn supersedes(current: Option<Stamp>, incoming: Stamp) -> bool {
    current.map_or(true, |c| incoming > c)
}

// ============================================================================
// RECONCILED ENTITY (Internal State)
// ============================================================================

/// A snapshot together with the versions of its scalar fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledEntity {
    snapshot: TrackingSnapshot,
    stamps: FieldStamps,
}

impl ReconciledEntity {
    /// A fresh entity with nothing known about it.
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            snapshot: TrackingSnapshot::empty(entity_id),
            stamps: FieldStamps::default(),
        }
    }

    pub fn snapshot(&self) -> &TrackingSnapshot {
        &self.snapshot
    }
}

/// Merges an incoming update into an existing entity.
///
/// Pure: the result depends only on the two inputs. Idempotent, and for
/// updates with distinct timestamps the scalar outcome does not depend on
/// application order.
pub fn merge(existing: &ReconciledEntity, incoming: &Update, max_history: usize) -> ReconciledEntity {
    let mut next = existing.clone();
    let snap = &mut next.snapshot;
    let stamps = &mut next.stamps;
    let stamp = Stamp {
        at: incoming.observed_at,
        source: incoming.source,
    };

    snap.location_history = merge_history(&snap.location_history, &incoming.samples, max_history);
    snap.last_updated = snap.last_updated.max(incoming.observed_at);

    if let Some(status) = &incoming.status {
        if supersedes(stamps.status, stamp) {
            snap.status = status.clone();
            stamps.status = Some(stamp);
        }
    }
    if let Some(progress) = incoming.progress_percentage {
        if supersedes(stamps.progress, stamp) {
            snap.progress_percentage = Some(progress);
            stamps.progress = Some(stamp);
        }
    }
    if let Some(driver) = &incoming.driver_info {
        if supersedes(stamps.driver, stamp) {
            snap.driver_info = Some(driver.clone());
            stamps.driver = Some(stamp);
        }
    }
    if let Some(destination) = incoming.destination {
        if supersedes(stamps.destination, stamp) {
            snap.destination = Some(destination);
            stamps.destination = Some(stamp);
        }
    }
    if let Some(eta) = incoming.estimated_arrival {
        if supersedes(stamps.estimated_arrival, stamp) {
            snap.estimated_arrival = Some(eta);
            stamps.estimated_arrival = Some(stamp);
        }
    }

    next
}

/// Union of two histories, sorted by `recorded_at` and capped to the newest
/// `max_history` samples. Equal timestamps keep arrival order.
///
/// An id-less sample is the same sample as any stored one at the same point
/// and time. An identified sample landing on a stored id-less point takes
/// its place.
fn merge_history(
    existing: &[LocationSample],
    incoming: &[LocationSample],
    max_history: usize,
) -> Vec<LocationSample> {
    let mut seen: HashSet<_> = existing.iter().map(LocationSample::key).collect();
    let mut merged = existing.to_vec();

    for sample in incoming {
        let point = sample.point_key();
        if sample.id.is_none() {
            if merged.iter().any(|s| s.point_key() == point) {
                continue;
            }
        } else if let Some(slot) = merged.iter().position(|s| s.id.is_none() && s.point_key() == point) {
            if seen.insert(sample.key()) {
                seen.remove(&merged[slot].key());
                merged[slot] = sample.clone();
            }
            continue;
        }
        if seen.insert(sample.key()) {
            merged.push(sample.clone());
        }
    }

    // Stable: ties stay in arrival order
    merged.sort_by_key(|s| s.recorded_at);

    let cap = max_history.max(1);
    if merged.len() > cap {
        merged.drain(..merged.len() - cap);
    }
    merged
}

// ============================================================================
// UPDATE RECONCILER (The Engine)
// ============================================================================

struct Entry {
    entity: ReconciledEntity,
    /// Session clock (ms) at which the entity became terminal
    terminal_since: Option<u64>,
}

/// Owns the canonical snapshot of every entity seen in this session.
pub struct UpdateReconciler {
    entries: HashMap<EntityId, Entry>,
    config: ReconcilerConfig,
}

impl UpdateReconciler {
    /// Create a new UpdateReconciler with the given configuration.
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ReconcilerConfig::default())
    }

    /// Merges a poll result for `entity`.
    ///
    /// # Returns
    /// * `Ok(Some(snapshot))` - the snapshot changed
    /// * `Ok(None)` - the poll carried nothing new
    /// * `Err(_)` - the fragment was not a poll result for `entity`; state untouched
    pub fn apply_poll(
        &mut self,
        entity: &EntityId,
        fragment: Update,
        now_ms: u64,
    ) -> Result<Option<TrackingSnapshot>, ReconcileError> {
        if fragment.source != UpdateSource::Poll {
            return Err(ReconcileError::WrongSource {
                entity: entity.to_string(),
                expected: UpdateSource::Poll,
            });
        }
        if &fragment.entity_id != entity {
            return Err(ReconcileError::EntityMismatch {
                expected: entity.to_string(),
                found: fragment.entity_id.to_string(),
            });
        }
        Ok(self.apply(fragment, now_ms))
    }

    /// Merges a route-progress poll for `entity`.
    ///
    /// Route progress only carries the progress scalar, the arrival estimate
    /// and the latest position, so it goes through the same poll path.
    pub fn apply_route_progress(
        &mut self,
        entity: &EntityId,
        progress: Update,
        now_ms: u64,
    ) -> Result<Option<TrackingSnapshot>, ReconcileError> {
        self.apply_poll(entity, progress, now_ms)
    }

    /// Merges a push event. Same contract as [`apply_poll`](Self::apply_poll).
    pub fn apply_push(&mut self, event: Update, now_ms: u64) -> Result<Option<TrackingSnapshot>, ReconcileError> {
        if event.source != UpdateSource::Push {
            return Err(ReconcileError::WrongSource {
                entity: event.entity_id.to_string(),
                expected: UpdateSource::Push,
            });
        }
        Ok(self.apply(event, now_ms))
    }

    fn apply(&mut self, update: Update, now_ms: u64) -> Option<TrackingSnapshot> {
        let (current, terminal_since, is_new) = match self.entries.remove(&update.entity_id) {
            Some(entry) => (entry.entity, entry.terminal_since, false),
            None => (ReconciledEntity::new(update.entity_id.clone()), None, true),
        };

        let merged = merge(&current, &update, self.config.max_history);
        let changed = is_new || merged.snapshot != current.snapshot;

        let terminal_since = if merged.snapshot.is_terminal() {
            terminal_since.or(Some(now_ms))
        } else {
            None
        };

        // Stamps may advance even when nothing visible changed
        let emitted = changed.then(|| merged.snapshot.clone());
        self.entries.insert(
            update.entity_id.clone(),
            Entry {
                entity: merged,
                terminal_since,
            },
        );

        if emitted.is_none() {
            trace!(entity = %update.entity_id, source = ?update.source, "no-op merge");
        }
        emitted
    }

    /// Evicts terminal snapshots whose grace period has expired.
    ///
    /// `keep` guards entities still referenced by the UI.
    pub fn evict_terminal<F>(&mut self, now_ms: u64, keep: F) -> Vec<EntityId>
    where
        F: Fn(&EntityId) -> bool,
    {
        let grace = self.config.terminal_grace_ms;
        let expired: Vec<EntityId> = self
            .entries
            .iter()
            .filter(|(id, entry)| {
                entry
                    .terminal_since
                    .map_or(false, |since| now_ms.saturating_sub(since) >= grace)
                    && !keep(*id)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    /// Get the canonical snapshot of an entity.
    pub fn snapshot(&self, id: &EntityId) -> Option<&TrackingSnapshot> {
        self.entries.get(id).map(|e| &e.entity.snapshot)
    }

    /// All snapshots, in no particular order.
    pub fn snapshots(&self) -> impl Iterator<Item = &TrackingSnapshot> {
        self.entries.values().map(|e| &e.entity.snapshot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("Malformed update for {entity}: {reason}")]
    Malformed { entity: String, reason: String },

    #[error("Update for {found} applied to {expected}")]
    EntityMismatch { expected: String, found: String },

    #[error("Expected a {expected:?} update for {entity}")]
    WrongSource { entity: String, expected: UpdateSource },
}

impl ReconcileError {
    pub fn malformed(entity: Option<&EntityId>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            entity: entity.map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            reason: reason.into(),
        }
    }
}
