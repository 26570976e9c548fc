use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavlink::common::{MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::channel::{Connector, Endpoint, PeerKind};
use crate::error::{ChannelError, ConnectionError, ConnectionLost};
use crate::session::{Session, SessionParams, Target, RELEASE_TIMEOUT};
use crate::state::LinkStatus;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub endpoint: Endpoint,
    pub peer: PeerKind,
    pub sys_id: u8,
    pub comp_id: u8,
    pub target: Option<Target>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub liveness_interval: Duration,
    /// Initial wait for the first heartbeat.
    pub startup_timeout: Duration,
    /// Extra attempts after a failed channel open, `retry_delay` apart.
    pub connect_retries: u32,
    pub retry_delay: Duration,
    pub stream_rate_hz: f32,
}

impl SupervisorConfig {
    pub fn new(endpoint: Endpoint, peer: PeerKind) -> Self {
        Self {
            endpoint,
            peer,
            sys_id: crate::DEFAULT_SYS_ID,
            comp_id: crate::DEFAULT_COMP_ID,
            target: None,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: peer.default_heartbeat_timeout(),
            liveness_interval: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(30),
            connect_retries: 0,
            retry_delay: Duration::from_secs(1),
            stream_rate_hz: 1.0,
        }
    }

    fn session_params(&self) -> SessionParams {
        SessionParams {
            endpoint: self.endpoint.clone(),
            peer: self.peer,
            sys_id: self.sys_id,
            comp_id: self.comp_id,
            target: self.target,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}

/// Keeps a live session to one peer. Owns the current [`Session`] and
/// replaces it wholesale on reconnect.
pub struct Supervisor {
    config: SupervisorConfig,
    connector: Arc<dyn Connector>,
    current: watch::Sender<Arc<Session>>,
    reconnects: AtomicU32,
    /// Started by the first `run`; outlives it so termination and reconnects
    /// still announce us. Aborted when the supervisor is dropped.
    heartbeat: Mutex<Option<AbortOnDrop>>,
}

impl Supervisor {
    /// Opens the channel, waits for the first heartbeat and requests the
    /// telemetry streams.
    pub async fn connect(config: SupervisorConfig, connector: Arc<dyn Connector>) -> Result<Self, ConnectionError> {
        info!("connecting to {} on {}", config.peer.name(), config.endpoint);
        let session = open_session(&config, &connector).await?;

        if !session.wait_heartbeat(config.startup_timeout).await {
            session.close();
            return Err(ConnectionError::NoHeartbeat {
                endpoint: config.endpoint.to_string(),
                peer: config.peer.name(),
                timeout: config.startup_timeout,
            });
        }
        info!("heartbeat from {} received", config.peer.name());
        session.request_streams(config.stream_rate_hz);

        Ok(Self {
            config,
            connector,
            current: watch::Sender::new(session),
            reconnects: AtomicU32::new(0),
            heartbeat: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// The session callers should use right now.
    pub fn current(&self) -> Arc<Session> {
        self.current.borrow().clone()
    }

    /// Follows session replacements.
    pub fn sessions(&self) -> watch::Receiver<Arc<Session>> {
        self.current.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.current().is_alive()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus::of(&self.current(), self.reconnects())
    }

    /// Replaces the session. The old one is closed and its port or socket
    /// released before the endpoint is reopened; exchanges still waiting on it
    /// fail with `SessionClosed`.
    pub async fn reconnect(&self) -> Result<Arc<Session>, ConnectionError> {
        let old = self.current();
        info!(old = old.id(), "reconnecting to {}", self.config.endpoint);
        old.close();
        if !old.wait_released(RELEASE_TIMEOUT).await {
            warn!(old = old.id(), "old receiver still running after {:?}", RELEASE_TIMEOUT);
        }

        let session = open_session(&self.config, &self.connector).await?;
        self.current.send_replace(session.clone());
        self.reconnects.fetch_add(1, Ordering::Relaxed);

        if !session.wait_heartbeat(self.config.heartbeat_timeout).await {
            warn!(session = session.id(), "no heartbeat after reconnect");
            return Err(ConnectionError::NoHeartbeat {
                endpoint: self.config.endpoint.to_string(),
                peer: self.config.peer.name(),
                timeout: self.config.heartbeat_timeout,
            });
        }
        session.request_streams(self.config.stream_rate_hz);
        info!(session = session.id(), "reconnected");
        Ok(session)
    }

    /// Runs the liveness checker until the link is lost for good, starting
    /// the heartbeat sender if it is not running yet. The sender keeps going
    /// after this returns. The receiver runs on each session's own thread.
    pub async fn run(&self) -> ConnectionLost {
        self.ensure_heartbeat();
        self.liveness_loop().await
    }

    /// Whether the companion heartbeat sender is running.
    pub fn heartbeat_running(&self) -> bool {
        let hb = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        hb.as_ref().is_some_and(|h| !h.0.is_finished())
    }

    fn ensure_heartbeat(&self) {
        let mut hb = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if hb.as_ref().map_or(true, |h| h.0.is_finished()) {
            *hb = Some(AbortOnDrop(tokio::spawn(heartbeat_loop(
                self.sessions(),
                self.config.heartbeat_interval,
            ))));
        }
    }

    async fn liveness_loop(&self) -> ConnectionLost {
        let mut tick = tokio::time::interval(self.config.liveness_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        tick.tick().await;

        loop {
            tick.tick().await;
            let session = self.current();
            if session.is_alive() {
                continue;
            }

            let age = session.last_heartbeat().map(|t| t.elapsed());
            warn!(session = session.id(), ?age, "{} heartbeat lost", self.config.peer.name());
            if let Err(reason) = self.reconnect().await {
                error!("reconnect failed: {}", reason);
                return ConnectionLost { endpoint: self.config.endpoint.to_string(), reason };
            }
        }
    }
}

async fn open_session(config: &SupervisorConfig, connector: &Arc<dyn Connector>) -> Result<Arc<Session>, ConnectionError> {
    let attempts = config.connect_retries + 1;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let c = connector.clone();
        let endpoint = config.endpoint.clone();
        let opened = tokio::task::spawn_blocking(move || c.connect(&endpoint))
            .await
            .map_err(|e| ConnectionError::Task(e.to_string()))?
            .and_then(|channel| Session::open(config.session_params(), channel));

        match opened {
            Ok(session) => return Ok(session),
            Err(source) if attempt >= attempts => {
                return Err(ConnectionError::Open {
                    endpoint: config.endpoint.to_string(),
                    attempts,
                    source,
                });
            }
            Err(e) => {
                warn!("open {} failed (attempt {}/{}): {}", config.endpoint, attempt, attempts, e);
                tokio::time::sleep(config.retry_delay).await;
            }
        }
    }
}

fn onboard_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

/// Sends our heartbeat on whatever session is current. Send failures are
/// logged and the loop carries on; it only stops when aborted.
async fn heartbeat_loop(mut sessions: watch::Receiver<Arc<Session>>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let msg = onboard_heartbeat();
    loop {
        tick.tick().await;
        let session = sessions.borrow_and_update().clone();
        match session.send(&msg) {
            Ok(()) => debug!(session = session.id(), "heartbeat sent"),
            Err(ChannelError::Closed) => debug!(session = session.id(), "link down, heartbeat skipped"),
            Err(e) => warn!(session = session.id(), "heartbeat send failed: {}", e),
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
