use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::channel::{Connector, Endpoint, PeerKind};
use crate::session::{Session, SessionParams, RELEASE_TIMEOUT};

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub dev: String,
    pub baud: u32,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<Endpoint>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyTHS1".into(),
        "/dev/ttyS0".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![57600, 115200, 230400, 921600]
}

/// Candidates plus whatever ports the OS reports, without duplicates.
pub fn with_system_ports(mut devs: Vec<String>) -> Vec<String> {
    match tokio_serial::available_ports() {
        Ok(ports) => {
            for p in ports {
                if !devs.contains(&p.port_name) {
                    devs.push(p.port_name);
                }
            }
        }
        Err(e) => warn!("serial port enumeration failed: {}", e),
    }
    devs
}

/// Tries every device x baud until one yields a heartbeat from `peer`.
/// Every probe is reported, including the winning one.
pub async fn autodetect(
    connector: Arc<dyn Connector>,
    candidate_devs: Vec<String>,
    candidate_bauds: Vec<u32>,
    peer: PeerKind,
    probe_timeout: Duration,
) -> AutodetectResult {
    let mut probes = Vec::new();

    for dev in candidate_devs {
        for baud in &candidate_bauds {
            let start = Instant::now();
            let endpoint = Endpoint::Serial { dev: dev.clone(), baud: *baud };

            let c = connector.clone();
            let ep = endpoint.clone();
            let opened = tokio::task::spawn_blocking(move || c.connect(&ep)).await;

            let (hb_seen, note) = match opened {
                Ok(Ok(channel)) => {
                    let params = SessionParams {
                        endpoint: endpoint.clone(),
                        peer,
                        sys_id: crate::DEFAULT_SYS_ID,
                        comp_id: crate::DEFAULT_COMP_ID,
                        target: None,
                        heartbeat_timeout: probe_timeout,
                    };
                    match Session::open(params, channel) {
                        Ok(session) => {
                            let seen = session.wait_heartbeat(probe_timeout).await;
                            session.close();
                            // the next baud, or the supervisor, reopens this port
                            session.wait_released(RELEASE_TIMEOUT).await;
                            (seen, if seen { "heartbeat".to_string() } else { "no heartbeat".to_string() })
                        }
                        Err(e) => (false, format!("session: {}", e)),
                    }
                }
                Ok(Err(e)) => {
                    warn!("fc autodetect probe failed dev={} baud={} err={}", dev, baud, e);
                    (false, format!("open/connect failed: {}", e))
                }
                Err(e) => (false, format!("probe task failed: {}", e)),
            };

            probes.push(ProbeResult {
                dev: dev.clone(),
                baud: *baud,
                hb_seen,
                elapsed_ms: start.elapsed().as_millis() as u64,
                note,
            });
            if hb_seen {
                info!("fc autodetect: OK {} @ {}", dev, baud);
                return AutodetectResult { chosen: Some(endpoint), probes };
            }
        }
    }

    AutodetectResult { chosen: None, probes }
}
