//! REST polling service abstraction.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::EntityId;

/// Request/response access to the tracking REST endpoints.
///
/// Both calls return the raw response body. Decoding and validation belong
/// to the reconciler, so a malformed body never fails the request itself.
///
/// Errors are classified through [`EnvError::is_unrecoverable`]: a missing
/// entity or revoked permission ends the selection, anything else is
/// transient and picked up again by the next periodic poll.
#[async_trait]
pub trait TrackingService: Send + Sync + 'static {
    /// `GET /tracking/{id}` - tracking detail fragment.
    async fn fetch_tracking_detail(&self, entity: &EntityId) -> Result<Vec<u8>, EnvError>;

    /// `GET /tracking/{id}/progress` - route progress summary.
    async fn fetch_route_progress(&self, entity: &EntityId) -> Result<Vec<u8>, EnvError>;
}
