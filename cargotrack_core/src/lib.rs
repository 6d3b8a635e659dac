//! CargoTrack Core - Live Cargo-Tracking Synchronization
//!
//! Keeps a map view, a selected-cargo panel and a shipment list consistent
//! while data arrives from two unreliable sources:
//! 1. **Push channel**: location/status events over a persistent connection
//!    that drops and reconnects with backoff
//! 2. **Polling fallback**: periodic REST fetches whose results may land
//!    long after the user moved on
//!
//! The engines are synchronous and clock-free where possible; time and I/O
//! come in through `cargotrack_env`, so the whole timeline runs under the
//! simulator exactly as it does under tokio.

pub mod config;
pub mod connection;
pub mod model;
pub mod projector;
pub mod reconciler;
pub mod runtime;
pub mod session;
pub mod subscriptions;
pub mod view_model;
pub mod wire;

// Re-export key types for convenience
pub use config::{BackoffConfig, SessionConfig};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus, ListenerHandle};
pub use model::{Coordinate, DriverInfo, LocationSample, TrackingSnapshot, TrackingStatus};
pub use projector::{Bounds, MapProjector, MapScene, Marker, MarkerKind, Polyline};
pub use reconciler::{ReconcileError, UpdateReconciler};
pub use runtime::{RuntimeHandle, TrackingRuntime};
pub use session::{PollKind, PollRequest, SessionEvent, SessionOutput, ShipmentRow, TrackingSession};
pub use subscriptions::{Subscription, SubscriptionRegistry};
pub use view_model::{Connectivity, DriverContact, RenderFrame, TrackingViewModel, ViewError, ViewPhase};
pub use wire::{PushKind, Update, UpdateSource};
