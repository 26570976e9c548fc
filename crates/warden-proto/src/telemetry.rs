use serde::{Deserialize, Serialize};

/// Remote-reported ground/air/transition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LandedState {
    #[default]
    Unknown,
    OnGround,
    InAir,
    Takeoff,
    Landing,
}

impl LandedState {
    pub fn is_landed(self) -> bool {
        self == LandedState::OnGround
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    /// Metres above mean sea level.
    pub alt_m: f64,
}

/// Last-known-good telemetry for one session. `None` means the value has not
/// been observed since the session was opened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub position: Option<Position>,
    // Battery monitoring
    pub battery_remaining: Option<u8>,
    pub battery_voltage: Option<f32>,
    pub battery_current: Option<f32>,
    // From the peer heartbeat
    pub system_status: Option<u8>,
    pub armed: bool,
    pub landed_state: LandedState,
}
