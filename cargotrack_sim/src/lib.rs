//! CargoTrack Deterministic Simulation Harness
//!
//! This crate provides a controlled environment in which a live tracking
//! session runs deterministically against a simulated backend.
//!
//! # Core Principle: Everything Behind a Seed
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances only when the harness says so
//! - **Network**: Push channel and REST endpoints with scripted faults
//! - **Randomness**: Fleet motion and fault injection come from one 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (virtual clock, sleep log)                │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼──────────┐       ┌─────▼──────────┐                 │
//! │  │ Connection    │       │ TrackingSession│                 │
//! │  │ Manager       │──────►│ (core engines) │                 │
//! │  └───────────────┘       └────────────────┘                 │
//! │       ▲                        ▲                            │
//! │  ┌────┴──────────┐       ┌─────┴──────────┐                 │
//! │  │ SimPushChannel│       │ SimTracking    │                 │
//! │  │ + controller  │       │ Service        │                 │
//! │  └───────────────┘       └────────────────┘                 │
//! │       ▲                        ▲                            │
//! │  ┌────┴────────────────────────┴────┐                       │
//! │  │            Fleet                  │                       │
//! │  │  (Ground Truth Shipments)         │                       │
//! │  └───────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cargotrack_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Reconnect);
//! assert!(result.passed);
//! ```

mod channel;
mod context;
mod fleet;
mod runner;
mod service;
mod world;
pub mod scenarios;

pub use channel::{ChannelMessage, SimChannelController, SimPushChannel};
pub use context::SimContext;
pub use fleet::{Fleet, Shipment};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use service::SimTrackingService;
pub use world::{SimConfig, SimWorld, WorldStats};

use cargotrack_core::SessionConfig;
use std::path::Path;
use thiserror::Error;

/// Errors surfaced by the simulator outside of scenario assertions.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid session config: {0}")]
    Config(#[from] serde_json::Error),
}

/// Loads a [`SessionConfig`] override from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<SessionConfig, SimError> {
    let json = std::fs::read_to_string(path)?;
    Ok(SessionConfig::from_json(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_load_config_overrides() {
        let path = std::env::temp_dir().join(format!("cargotrack-sim-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "poll_interval": 5000 }"#).unwrap();

        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.backoff, SessionConfig::default().backoff);
    }

    #[test]
    fn test_load_config_errors() {
        assert!(matches!(load_config("/nonexistent/cargotrack.json"), Err(SimError::Io(_))));

        let path = std::env::temp_dir().join(format!("cargotrack-sim-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let result = load_config(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(SimError::Config(_))));
    }
}
