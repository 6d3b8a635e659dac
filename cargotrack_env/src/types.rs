//! Common types for the CargoTrack environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque key identifying one cargo shipment.
///
/// Stable for the shipment's lifetime; ordering is lexicographic so
/// registry iteration is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for one tracking session (one dashboard view).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random SessionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic SessionId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// One unit read off the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    /// Location update payload (JSON)
    Location(Vec<u8>),

    /// Status update payload (JSON)
    Status(Vec<u8>),

    /// The connection was lost; the channel stays usable after a reconnect
    Dropped { reason: String },
}

/// Role of the signed-in user, as reported by the auth provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerRole {
    Admin,
    Dispatcher,
    Client,
}

impl ViewerRole {
    /// Staff roles may see driver contact details.
    pub fn is_staff(&self) -> bool {
        matches!(self, ViewerRole::Admin | ViewerRole::Dispatcher)
    }
}

/// The signed-in viewer of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerIdentity {
    pub user_id: String,
    pub role: ViewerRole,
}

impl ViewerIdentity {
    pub fn new(user_id: impl Into<String>, role: ViewerRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_seed_is_deterministic() {
        assert_eq!(SessionId::from_seed(7), SessionId::from_seed(7));
        assert_ne!(SessionId::from_seed(7), SessionId::from_seed(8));
    }

    #[test]
    fn test_entity_id_ordering() {
        let mut ids = vec![EntityId::from("CARGO-2"), EntityId::from("CARGO-1")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "CARGO-1");
    }

    #[test]
    fn test_viewer_role_staff() {
        assert!(ViewerRole::Dispatcher.is_staff());
        assert!(!ViewerRole::Client.is_staff());
    }
}
