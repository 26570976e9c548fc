use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{error, info, warn};
use warden_fc::commands::LongCommand;
use warden_fc::{ProtocolError, Session};
use warden_proto::telemetry::LandedState;

use crate::decision::{decide, Action, DEFAULT_BATTERY_THRESHOLD_PCT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationState {
    Idle,
    Monitoring,
    Deciding,
    Executing,
    Terminated,
}

/// Why termination was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ConnectionLost,
    Operator,
    /// Hardware or other out-of-band loss signal.
    External(&'static str),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::ConnectionLost => f.write_str("connection lost"),
            Trigger::Operator => f.write_str("operator command"),
            Trigger::External(what) => write!(f, "external: {}", what),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub battery_threshold_pct: u8,
    pub landed_query_timeout: Duration,
    /// Bound on waiting for a LANDING vehicle to reach the ground.
    pub landing_wait_timeout: Duration,
    pub landing_poll_interval: Duration,
    pub ack_timeout: Duration,
    /// Extra attempts per command after the first one fails.
    pub action_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            battery_threshold_pct: DEFAULT_BATTERY_THRESHOLD_PCT,
            landed_query_timeout: Duration::from_millis(1500),
            landing_wait_timeout: Duration::from_secs(60),
            landing_poll_interval: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(3),
            action_retries: 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TerminationError {
    #[error("{action:?}: {command} failed: {source}")]
    Action {
        action: Action,
        command: &'static str,
        source: ProtocolError,
    },
}

/// Flight termination state machine.
///
/// IDLE -> MONITORING -> DECIDING -> EXECUTING -> TERMINATED. TERMINATED is
/// absorbing. A failed action leaves the engine in EXECUTING so a later
/// trigger can try again.
pub struct TerminationEngine {
    config: EngineConfig,
    state: watch::Sender<TerminationState>,
    running: Mutex<()>,
}

impl TerminationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: watch::Sender::new(TerminationState::Idle),
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> TerminationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TerminationState> {
        self.state.subscribe()
    }

    fn transition(&self, to: TerminationState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!("termination: {:?} -> {:?}", from, to);
        }
    }

    /// Link is healthy again. No effect once terminated or mid-decision.
    pub fn monitor(&self) {
        let mut changed = None;
        self.state.send_if_modified(|s| match *s {
            TerminationState::Idle | TerminationState::Executing => {
                changed = Some(*s);
                *s = TerminationState::Monitoring;
                true
            }
            _ => false,
        });
        if let Some(from) = changed {
            info!("termination: {:?} -> Monitoring", from);
        }
    }

    /// The link is back on `session`. A termination cut short by the outage
    /// is carried out again; unless that finishes it, the engine returns to
    /// MONITORING.
    pub async fn link_restored(&self, session: &Session) -> Result<Option<Action>, TerminationError> {
        let result = if self.state() == TerminationState::Executing {
            info!("link restored with termination pending, retrying");
            self.execute(session, Trigger::ConnectionLost).await
        } else {
            Ok(None)
        };
        self.monitor();
        result
    }

    /// Decides on and carries out the safety action. Returns `None` when the
    /// engine has already terminated.
    pub async fn execute(&self, session: &Session, trigger: Trigger) -> Result<Option<Action>, TerminationError> {
        let _running = self.running.lock().await;
        if self.state() == TerminationState::Terminated {
            info!("termination requested ({}) but already terminated", trigger);
            return Ok(None);
        }

        warn!("flight termination triggered: {}", trigger);
        self.transition(TerminationState::Deciding);

        let (landed, forced) = self.landed(session).await;
        let snap = session.snapshot();
        let action = if forced {
            Action::LandThenDisarm
        } else {
            decide(landed, snap.armed, snap.battery_remaining, self.config.battery_threshold_pct)
        };
        info!(
            landed,
            armed = snap.armed,
            battery = ?snap.battery_remaining,
            "termination action: {:?}",
            action
        );

        self.transition(TerminationState::Executing);
        match action {
            Action::Disarm => self.run(session, action, "DISARM", LongCommand::disarm()).await?,
            Action::AlreadyDisarmed => info!("already disarmed, nothing to do"),
            Action::LandThenDisarm => {
                self.run(session, action, "LAND", LongCommand::land()).await?;
                self.run(session, action, "DISARM", LongCommand::disarm()).await?;
            }
            Action::ReturnToLaunch => {
                self.run(session, action, "RTL", LongCommand::return_to_launch()).await?
            }
        }

        self.transition(TerminationState::Terminated);
        Ok(Some(action))
    }

    /// Landed state for the decision, and whether a LAND must be forced
    /// because a landing never finished.
    async fn landed(&self, session: &Session) -> (bool, bool) {
        if !session.is_alive() {
            warn!("link is down, assuming airborne");
            return (false, false);
        }
        match session.query_landed_state(self.config.landed_query_timeout).await {
            Ok(LandedState::Landing) => {
                if self.wait_on_ground(session).await {
                    (true, false)
                } else {
                    warn!("still landing after {:?}, forcing LAND", self.config.landing_wait_timeout);
                    (false, true)
                }
            }
            Ok(state) => (state.is_landed(), false),
            Err(e) => {
                warn!("landed state unavailable ({}), assuming airborne", e);
                (false, false)
            }
        }
    }

    async fn wait_on_ground(&self, session: &Session) -> bool {
        info!("vehicle is landing, waiting for touchdown");
        let deadline = Instant::now() + self.config.landing_wait_timeout;
        while Instant::now() < deadline {
            tokio::time::sleep(self.config.landing_poll_interval).await;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout = self.config.landed_query_timeout.min(remaining);
            match session.query_landed_state(timeout).await {
                Ok(LandedState::OnGround) => return true,
                Ok(_) => {}
                Err(e) if e.is_timeout() => {}
                Err(e) => {
                    warn!("landed state poll failed: {}", e);
                    return false;
                }
            }
        }
        false
    }

    async fn run(
        &self,
        session: &Session,
        action: Action,
        command: &'static str,
        cmd: LongCommand,
    ) -> Result<(), TerminationError> {
        let attempts = self.config.action_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!("termination: sending {} (attempt {}/{})", command, attempt, attempts);
            match session.command(cmd, self.config.ack_timeout).await {
                Ok(()) => {
                    info!("termination: {} acknowledged", command);
                    return Ok(());
                }
                Err(source) if attempt >= attempts || matches!(source, ProtocolError::SessionClosed) => {
                    error!("termination: {} failed: {}", command, source);
                    return Err(TerminationError::Action { action, command, source });
                }
                Err(e) => warn!("termination: {} failed: {}, retrying", command, e),
            }
        }
    }
}
