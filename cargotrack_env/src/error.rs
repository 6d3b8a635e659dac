//! Error types for the CargoTrack environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Network send failed (buffer full, connection closed, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Push channel handshake was refused or the transport is down
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The requested entity does not exist (anymore)
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// The session is no longer allowed to read the entity
    #[error("Permission denied for {0}")]
    Forbidden(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a channel-unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ChannelUnavailable(msg.into())
    }

    /// Creates a not-found error for an entity.
    pub fn not_found(entity: impl std::fmt::Display) -> Self {
        Self::NotFound(entity.to_string())
    }

    /// Creates a timeout error from a duration.
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout(after.as_millis() as u64)
    }

    /// True when retrying cannot succeed (entity gone or access revoked).
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Forbidden(_))
    }
}
