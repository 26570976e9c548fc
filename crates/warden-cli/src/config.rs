use std::time::Duration;

use anyhow::{Context, Result};
use warden_fc::FcConfig;
use warden_ft::EngineConfig;
use warden_mission::UploadConfig;
use warden_proto::mission::Waypoint;
use warden_server::ServerConfig;

#[derive(Debug, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogCfg,
    pub fc: FcConfig,
    #[serde(default)]
    pub mission: MissionCfg,
    #[serde(default)]
    pub termination: TerminationCfg,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, serde::Deserialize)]
pub struct LogCfg {
    pub level: String,
}

impl Default for LogCfg {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct MissionCfg {
    pub step_timeout_ms: Option<u64>,
    pub home: Option<HomeCfg>,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct HomeCfg {
    pub lat: f64,
    pub lon: f64,
    pub alt: f32,
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct TerminationCfg {
    pub battery_threshold_pct: Option<u8>,
    pub landed_query_timeout_ms: Option<u64>,
    pub landing_wait_timeout_ms: Option<u64>,
    pub landing_poll_interval_ms: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
    pub action_retries: Option<u32>,
}

impl MissionCfg {
    pub fn upload_config(&self) -> UploadConfig {
        let mut c = UploadConfig::default();
        if let Some(ms) = self.step_timeout_ms {
            c.step_timeout = Duration::from_millis(ms);
        }
        c.home = self.home.map(|h| Waypoint { lat: h.lat, lon: h.lon, alt_m: h.alt });
        c
    }
}

impl TerminationCfg {
    pub fn engine_config(&self) -> EngineConfig {
        let d = EngineConfig::default();
        let ms = |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);
        EngineConfig {
            battery_threshold_pct: self.battery_threshold_pct.unwrap_or(d.battery_threshold_pct),
            landed_query_timeout: ms(self.landed_query_timeout_ms, d.landed_query_timeout),
            landing_wait_timeout: ms(self.landing_wait_timeout_ms, d.landing_wait_timeout),
            landing_poll_interval: ms(self.landing_poll_interval_ms, d.landing_poll_interval),
            ack_timeout: ms(self.ack_timeout_ms, d.ack_timeout),
            action_retries: self.action_retries.unwrap_or(d.action_retries),
        }
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

/// Range checks for `warden doctor`.
pub fn check(cfg: &Config) -> Result<()> {
    let fc = &cfg.fc;
    if !fc.autodetect {
        anyhow::ensure!(fc.endpoint.as_ref().is_some_and(|s| !s.is_empty()), "fc.endpoint missing");
        fc.endpoint().context("fc.endpoint")?;
    }
    anyhow::ensure!(fc.baud.map_or(true, |b| b > 0), "fc.baud invalid");

    let sup = fc.supervisor_config(warden_fc::Endpoint::Net(String::new()));
    anyhow::ensure!(!sup.heartbeat_interval.is_zero(), "fc.heartbeat_interval_ms must be > 0");
    anyhow::ensure!(!sup.liveness_interval.is_zero(), "fc.liveness_interval_ms must be > 0");
    anyhow::ensure!(
        sup.heartbeat_timeout > sup.heartbeat_interval,
        "fc.heartbeat_timeout_ms must exceed the heartbeat interval"
    );
    anyhow::ensure!(sup.stream_rate_hz > 0.0, "fc.stream_rate_hz must be > 0");

    let ft = cfg.termination.engine_config();
    anyhow::ensure!(ft.battery_threshold_pct <= 100, "termination.battery_threshold_pct must be <= 100");
    anyhow::ensure!(!ft.ack_timeout.is_zero(), "termination.ack_timeout_ms must be > 0");
    anyhow::ensure!(!ft.landing_poll_interval.is_zero(), "termination.landing_poll_interval_ms must be > 0");

    let up = cfg.mission.upload_config();
    anyhow::ensure!(!up.step_timeout.is_zero(), "mission.step_timeout_ms must be > 0");
    if let Some(home) = up.home {
        anyhow::ensure!(home.lat.abs() <= 90.0 && home.lon.abs() <= 180.0, "mission.home out of range");
    }

    let srv = &cfg.server;
    anyhow::ensure!((16..=65536).contains(&srv.max_frame), "server.max_frame must be 16..=65536");
    anyhow::ensure!(srv.queue_capacity > 0, "server.queue_capacity must be > 0");
    if let Some(dir) = srv.socket_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        anyhow::ensure!(dir.is_dir(), "server.socket_path directory {} does not exist", dir.display());
    }
    Ok(())
}
