//! Named simulation scenarios for the live-sync engines.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// SYNC-001: first selection, poll only, single pickup marker
    ColdStart,

    /// SYNC-002: push location moves the current marker
    MotionUpdate,

    /// SYNC-003: channel drop, backoff sequence, re-subscription
    Reconnect,

    /// SYNC-004: late poll for a previous selection is discarded
    EpochCancel,

    /// SYNC-005: newer push beats an older poll arriving later
    OutOfOrder,

    /// SYNC-006: random drops, refused handshakes and failing polls
    FlakyNetwork,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::ColdStart,
            ScenarioId::MotionUpdate,
            ScenarioId::Reconnect,
            ScenarioId::EpochCancel,
            ScenarioId::OutOfOrder,
            ScenarioId::FlakyNetwork,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::ColdStart => "cold_start",
            ScenarioId::MotionUpdate => "motion_update",
            ScenarioId::Reconnect => "reconnect",
            ScenarioId::EpochCancel => "epoch_cancel",
            ScenarioId::OutOfOrder => "out_of_order",
            ScenarioId::FlakyNetwork => "flaky_network",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::ColdStart => "Select a shipment with no push data; poll drives Loading -> Ready",
            ScenarioId::MotionUpdate => "Push a second location; pickup + current markers and a 2-point route",
            ScenarioId::Reconnect => "Drop the channel, refuse two handshakes, verify 1s/2s/4s backoff and re-subscribe",
            ScenarioId::EpochCancel => "Hold A's poll, switch to B, release A; A's result must not surface",
            ScenarioId::OutOfOrder => "Newer push status, older poll arriving later; push wins, history stays sorted",
            ScenarioId::FlakyNetwork => "Seeded drops, refused handshakes and failing polls; view converges on ground truth",
        }
    }

    /// Returns true if this scenario injects random faults.
    pub fn is_chaotic(&self) -> bool {
        matches!(self, ScenarioId::FlakyNetwork)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cold_start" | "coldstart" | "sync-001" => Ok(ScenarioId::ColdStart),
            "motion_update" | "motionupdate" | "sync-002" => Ok(ScenarioId::MotionUpdate),
            "reconnect" | "sync-003" => Ok(ScenarioId::Reconnect),
            "epoch_cancel" | "epochcancel" | "sync-004" => Ok(ScenarioId::EpochCancel),
            "out_of_order" | "outoforder" | "sync-005" => Ok(ScenarioId::OutOfOrder),
            "flaky_network" | "flakynetwork" | "sync-006" => Ok(ScenarioId::FlakyNetwork),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
