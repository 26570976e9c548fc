use std::time::Instant;

use serde::Serialize;
use warden_proto::telemetry::TelemetrySnapshot;

use crate::channel::PeerKind;
use crate::session::Session;

/// Link diagnostics, served as JSON on `STATUS`.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub endpoint: String,
    pub peer: PeerKind,
    pub session: u64,
    pub alive: bool,
    pub closed: bool,
    pub hb_age_ms: Option<u64>,
    pub heartbeats: u64,
    pub reconnects: u32,
    pub target_sys: u8,
    pub target_comp: u8,
    pub telemetry: TelemetrySnapshot,
    pub ts_unix_ms: i64,
}

impl LinkStatus {
    pub fn of(session: &Session, reconnects: u32) -> Self {
        let now = Instant::now();
        let target = session.target();
        Self {
            endpoint: session.endpoint().to_string(),
            peer: session.peer(),
            session: session.id(),
            alive: session.is_alive_at(now),
            closed: session.is_closed(),
            hb_age_ms: session
                .last_heartbeat()
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            heartbeats: session.heartbeat_count(),
            reconnects,
            target_sys: target.system,
            target_comp: target.component,
            telemetry: session.snapshot(),
            ts_unix_ms: time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64 / 1_000_000,
        }
    }
}
