pub mod autodetect;
pub mod channel;
pub mod commands;
pub mod error;
pub mod params;
pub mod session;
pub mod state;
pub mod supervisor;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use channel::{Channel, Connector, Endpoint, MavConnector, PeerKind};
pub use error::{ChannelError, ConnectionError, ConnectionLost, ProtocolError};
pub use session::{Exchange, Session, SessionParams, Target};
pub use supervisor::{Supervisor, SupervisorConfig};

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct FcConfig {
    /// Telemetry endpoint, e.g. "serial:/dev/ttyTHS1", "/dev/ttyUSB0",
    /// "udpin:0.0.0.0:14550" or "tcpout:127.0.0.1:5760".
    /// May be omitted when autodetect=true.
    pub endpoint: Option<String>,

    /// Serial baud when the endpoint doesn't carry one.
    pub baud: Option<u32>,

    #[serde(default)]
    pub kind: PeerKind,

    /// If true, probe candidate serial ports/bauds and use the first one
    /// that yields a heartbeat.
    #[serde(default)]
    pub autodetect: bool,

    /// Autodetect candidates (paths). Example:
    /// ["/dev/serial0","/dev/ttyAMA0","/dev/ttyS0","/dev/ttyUSB0","/dev/ttyACM0"]
    pub candidate_devs: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,
    /// Heartbeat wait per probe attempt
    pub probe_timeout_ms: Option<u64>,

    /// MAVLink ids we use (companion side)
    pub sys_id: Option<u8>,
    pub comp_id: Option<u8>,

    /// FC ids. Learned from the first heartbeat when unset.
    pub target_sys: Option<u8>,
    pub target_comp: Option<u8>,

    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub liveness_interval_ms: Option<u64>,
    pub startup_timeout_ms: Option<u64>,

    /// Extra connect attempts after the first one fails.
    pub connect_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,

    /// Telemetry stream rate requested via SET_MESSAGE_INTERVAL.
    pub stream_rate_hz: Option<f32>,
}

pub const DEFAULT_SYS_ID: u8 = 1;
/// MAV_COMP_ID_ONBOARD_COMPUTER
pub const DEFAULT_COMP_ID: u8 = 191;
pub const DEFAULT_BAUD: u32 = 115200;

impl FcConfig {
    pub fn endpoint(&self) -> Result<Endpoint, channel::EndpointError> {
        Endpoint::parse(
            self.endpoint.as_deref().unwrap_or_default(),
            Some(self.baud.unwrap_or(DEFAULT_BAUD)),
        )
    }

    pub fn target(&self) -> Option<Target> {
        match (self.target_sys, self.target_comp) {
            (Some(system), Some(component)) => Some(Target { system, component }),
            (Some(system), None) => Some(Target { system, component: 1 }),
            _ => None,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.unwrap_or(1500))
    }

    /// Supervisor settings for `endpoint`, with defaults filled in.
    pub fn supervisor_config(&self, endpoint: Endpoint) -> SupervisorConfig {
        let mut cfg = SupervisorConfig::new(endpoint, self.kind);
        cfg.sys_id = self.sys_id.unwrap_or(DEFAULT_SYS_ID);
        cfg.comp_id = self.comp_id.unwrap_or(DEFAULT_COMP_ID);
        cfg.target = self.target();
        if let Some(ms) = self.heartbeat_interval_ms {
            cfg.heartbeat_interval = Duration::from_millis(ms);
            cfg.liveness_interval = cfg.heartbeat_interval;
        }
        if let Some(ms) = self.heartbeat_timeout_ms {
            cfg.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.liveness_interval_ms {
            cfg.liveness_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.startup_timeout_ms {
            cfg.startup_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.connect_retries {
            cfg.connect_retries = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            cfg.retry_delay = Duration::from_millis(ms);
        }
        if let Some(hz) = self.stream_rate_hz {
            cfg.stream_rate_hz = hz;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> FcConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse(r#"endpoint = "/dev/ttyTHS1""#);
        assert_eq!(
            cfg.endpoint(),
            Ok(Endpoint::Serial { dev: "/dev/ttyTHS1".into(), baud: DEFAULT_BAUD })
        );
        let sup = cfg.supervisor_config(cfg.endpoint().unwrap());
        assert_eq!(sup.sys_id, 1);
        assert_eq!(sup.comp_id, 191);
        assert_eq!(sup.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(sup.heartbeat_timeout, Duration::from_millis(2500));
        assert_eq!(sup.connect_retries, 0);
        assert!(sup.target.is_none());
    }

    #[test]
    fn overrides_apply() {
        let cfg = parse(
            r#"
            endpoint = "udpin:0.0.0.0:14550"
            kind = "gcs"
            target_sys = 255
            heartbeat_interval_ms = 200
            heartbeat_timeout_ms = 900
            connect_retries = 2
            "#,
        );
        let sup = cfg.supervisor_config(cfg.endpoint().unwrap());
        assert_eq!(sup.peer, PeerKind::Gcs);
        assert_eq!(sup.target, Some(Target { system: 255, component: 1 }));
        assert_eq!(sup.liveness_interval, Duration::from_millis(200));
        assert_eq!(sup.heartbeat_timeout, Duration::from_millis(900));
        assert_eq!(sup.connect_retries, 2);
    }
}
