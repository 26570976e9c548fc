use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use mavlink::common::{MavLandedState, MavMessage, MavModeFlag, SYS_STATUS_DATA};
use mavlink::MavHeader;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use warden_proto::telemetry::{LandedState, Position, TelemetrySnapshot};

use crate::channel::{Channel, Endpoint, PeerKind};
use crate::error::{ChannelError, ProtocolError};

const REPLY_BUFFER: usize = 256;

/// Upper bound on waiting for a closed session to let go of its endpoint.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Remote system/component we address commands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub system: u8,
    pub component: u8,
}

impl Target {
    /// Used until the first heartbeat tells us who is on the other end.
    pub const BROADCAST: Target = Target { system: 0, component: 0 };

    /// Whether a heartbeat comes from this system and component. Zero matches
    /// any id.
    pub fn matches(&self, header: &MavHeader) -> bool {
        (self.system == 0 || self.system == header.system_id)
            && (self.component == 0 || self.component == header.component_id)
    }
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub endpoint: Endpoint,
    pub peer: PeerKind,
    pub sys_id: u8,
    pub comp_id: u8,
    /// Fixed target; learned from the first accepted heartbeat when `None`.
    pub target: Option<Target>,
    pub heartbeat_timeout: Duration,
}

#[derive(Debug, Default)]
struct SessionState {
    last_heartbeat: Option<Instant>,
    target: Option<Target>,
    snapshot: TelemetrySnapshot,
}

/// One live logical connection to a telemetry peer.
///
/// The receive thread is the only writer of the cached telemetry. Protocol
/// exchanges go through [`Session::exchange`], which hands out one
/// [`Exchange`] at a time. A session is never reopened: reconnecting builds a
/// new one and closes this one, which fails any exchange still waiting on it.
pub struct Session {
    id: u64,
    params: SessionParams,
    channel: Arc<dyn Channel>,
    seq: AtomicU8,
    state: Mutex<SessionState>,
    replies: broadcast::Sender<MavMessage>,
    heartbeats: watch::Sender<u64>,
    closed: watch::Sender<bool>,
    /// Sender lives on the receive thread; it is dropped when the thread exits.
    receiver_done: watch::Receiver<()>,
    turn: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.params.endpoint)
            .field("peer", &self.params.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Wraps an open channel and starts its receive thread.
    pub fn open(params: SessionParams, channel: Arc<dyn Channel>) -> Result<Arc<Session>, ChannelError> {
        let (replies, _) = broadcast::channel(REPLY_BUFFER);
        let (done_tx, receiver_done) = watch::channel(());
        let session = Arc::new(Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SessionState { target: params.target, ..Default::default() }),
            params,
            channel: channel.clone(),
            seq: AtomicU8::new(0),
            replies,
            heartbeats: watch::Sender::new(0),
            closed: watch::Sender::new(false),
            receiver_done,
            turn: tokio::sync::Mutex::new(()),
        });

        let weak = Arc::downgrade(&session);
        std::thread::Builder::new()
            .name(format!("mav-rx-{}", session.id))
            .spawn(move || {
                let _done = done_tx;
                receive_loop(channel, weak);
            })?;

        info!(session = session.id, "session open on {} ({})", session.params.endpoint, session.params.peer.name());
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.params.endpoint
    }

    pub fn peer(&self) -> PeerKind {
        self.params.peer
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.params.heartbeat_timeout
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // Poisoning only means a panic elsewhere mid-update; the cached values
        // are still last-known-good.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.state().snapshot.clone()
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.state().last_heartbeat
    }

    pub fn target(&self) -> Target {
        self.state().target.unwrap_or(Target::BROADCAST)
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive_at(Instant::now())
    }

    /// `now - last_heartbeat <= heartbeat_timeout`. A session that has never
    /// seen a heartbeat is not alive yet.
    pub fn is_alive_at(&self, now: Instant) -> bool {
        !self.is_closed()
            && self
                .last_heartbeat()
                .map_or(false, |t| now.saturating_duration_since(t) <= self.params.heartbeat_timeout)
    }

    pub fn heartbeat_count(&self) -> u64 {
        *self.heartbeats.borrow()
    }

    /// Waits until at least one peer heartbeat has been received.
    pub async fn wait_heartbeat(&self, timeout: Duration) -> bool {
        let mut rx = self.heartbeats.subscribe();
        let mut closed = self.closed.subscribe();
        let seen = async move { rx.wait_for(|n| *n > 0).await.is_ok() };
        tokio::select! {
            r = tokio::time::timeout(timeout, seen) => r.unwrap_or(false),
            _ = closed_signal(&mut closed) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Closes the channel and fails every exchange waiting on this session.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            self.channel.close();
            info!(session = self.id, "session closed");
        }
    }

    /// Waits until the receive thread has exited, which is when a closed
    /// channel has let go of its port or socket. False on timeout.
    pub async fn wait_released(&self, timeout: Duration) -> bool {
        let mut done = self.receiver_done.clone();
        let exited = async move { while done.changed().await.is_ok() {} };
        tokio::time::timeout(timeout, exited).await.is_ok()
    }

    /// Fire-and-forget send. Does not take the exchange turn.
    pub fn send(&self, msg: &MavMessage) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let header = MavHeader {
            system_id: self.params.sys_id,
            component_id: self.params.comp_id,
            sequence: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.channel.send(&header, msg)
    }

    /// Waits for the exchange turn. Replies are captured from the moment this
    /// returns, so a reply racing the request is never missed.
    pub async fn exchange(&self) -> Result<Exchange<'_>, ProtocolError> {
        let mut closed = self.closed.subscribe();
        let turn = tokio::select! {
            guard = self.turn.lock() => guard,
            _ = closed_signal(&mut closed) => return Err(ProtocolError::SessionClosed),
        };
        if self.is_closed() {
            return Err(ProtocolError::SessionClosed);
        }
        Ok(Exchange { session: self, replies: self.replies.subscribe(), closed, _turn: turn })
    }

    /// Applies one received message to the cached state.
    pub(crate) fn ingest(&self, header: &MavHeader, msg: MavMessage) {
        if let MavMessage::HEARTBEAT(hb) = &msg {
            if !self.params.peer.accepts(hb) {
                debug!(sys = header.system_id, "ignoring heartbeat from {:?}", hb.mavtype);
                return;
            }
            {
                let mut st = self.state();
                let known = st.target;
                if let Some(t) = known {
                    if !t.matches(header) {
                        debug!(sys = header.system_id, comp = header.component_id, "ignoring heartbeat from another vehicle");
                        return;
                    }
                } else {
                    let target = Target { system: header.system_id, component: header.component_id };
                    info!(session = self.id, "{} is {}/{}", self.params.peer.name(), target.system, target.component);
                    st.target = Some(target);
                }
                st.last_heartbeat = Some(Instant::now());
                st.snapshot.system_status = Some(hb.system_status as u8);
                if self.params.peer == PeerKind::Autopilot {
                    st.snapshot.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                }
            }
            self.heartbeats.send_modify(|n| *n += 1);
            debug!(session = self.id, "heartbeat from {}/{}", header.system_id, header.component_id);
            return;
        }

        if !self.from_target(header) {
            return;
        }

        match &msg {
            MavMessage::GLOBAL_POSITION_INT(p) => {
                self.state().snapshot.position = Some(Position {
                    lat: p.lat as f64 / 1e7,
                    lon: p.lon as f64 / 1e7,
                    alt_m: p.alt as f64 / 1000.0,
                });
            }
            MavMessage::SYS_STATUS(s) => update_battery(&mut self.state().snapshot, s),
            MavMessage::EXTENDED_SYS_STATE(s) => {
                self.state().snapshot.landed_state = landed_state_from(s.landed_state);
            }
            MavMessage::RC_CHANNELS(rc) => {
                info!(
                    "rc ch1={} ch2={} ch3={} ch4={}",
                    rc.chan1_raw, rc.chan2_raw, rc.chan3_raw, rc.chan4_raw
                );
            }
            MavMessage::STATUSTEXT(t) => {
                let text: Vec<u8> = t.text.iter().copied().take_while(|b| *b != 0).collect();
                info!("fc: {}", String::from_utf8_lossy(&text));
            }
            _ => {}
        }

        if is_reply(&msg) {
            // no subscribers is fine
            let _ = self.replies.send(msg);
        }
    }

    fn from_target(&self, header: &MavHeader) -> bool {
        match self.state().target {
            Some(t) => t.system == 0 || header.system_id == t.system,
            None => true,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.channel.close();
    }
}

fn is_reply(msg: &MavMessage) -> bool {
    matches!(
        msg,
        MavMessage::COMMAND_ACK(_)
            | MavMessage::MISSION_REQUEST(_)
            | MavMessage::MISSION_REQUEST_INT(_)
            | MavMessage::MISSION_ACK(_)
            | MavMessage::PARAM_VALUE(_)
            | MavMessage::EXTENDED_SYS_STATE(_)
    )
}

fn update_battery(snap: &mut TelemetrySnapshot, status: &SYS_STATUS_DATA) {
    // voltage_battery is in millivolts
    if status.voltage_battery != u16::MAX {
        snap.battery_voltage = Some(status.voltage_battery as f32 / 1000.0);
    }
    // current_battery is in centiamps, -1 means invalid
    if status.current_battery != -1 {
        snap.battery_current = Some(status.current_battery as f32 / 100.0);
    }
    // battery_remaining is percentage 0-100, -1 means invalid
    if (0..=100).contains(&status.battery_remaining) {
        snap.battery_remaining = Some(status.battery_remaining as u8);
    }
}

pub fn landed_state_from(s: MavLandedState) -> LandedState {
    match s {
        MavLandedState::MAV_LANDED_STATE_ON_GROUND => LandedState::OnGround,
        MavLandedState::MAV_LANDED_STATE_IN_AIR => LandedState::InAir,
        MavLandedState::MAV_LANDED_STATE_TAKEOFF => LandedState::Takeoff,
        MavLandedState::MAV_LANDED_STATE_LANDING => LandedState::Landing,
        _ => LandedState::Unknown,
    }
}

/// Resolves once the session is closed.
async fn closed_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}

fn receive_loop(channel: Arc<dyn Channel>, session: Weak<Session>) {
    loop {
        let received = channel.recv();
        let Some(session) = session.upgrade() else { return };
        if session.is_closed() {
            return;
        }
        match received {
            Ok((header, msg)) => session.ingest(&header, msg),
            Err(ChannelError::Malformed(e)) => debug!(session = session.id, "discarding malformed frame: {}", e),
            Err(ChannelError::Closed) => {
                debug!(session = session.id, "channel closed, receiver exiting");
                return;
            }
            Err(ChannelError::Io(e)) => {
                // Liveness notices a dead link; don't spin on a failing port.
                warn!(session = session.id, "receive error: {}", e);
                drop(session);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// One request/reply conversation on a session. At most one exists per
/// session at a time.
pub struct Exchange<'a> {
    session: &'a Session,
    replies: broadcast::Receiver<MavMessage>,
    closed: watch::Receiver<bool>,
    _turn: tokio::sync::MutexGuard<'a, ()>,
}

impl<'a> Exchange<'a> {
    pub fn session(&self) -> &'a Session {
        self.session
    }

    pub fn target(&self) -> Target {
        self.session.target()
    }

    pub fn send(&self, msg: &MavMessage) -> Result<(), ProtocolError> {
        match self.session.send(msg) {
            Err(ChannelError::Closed) => Err(ProtocolError::SessionClosed),
            other => other.map_err(ProtocolError::Send),
        }
    }

    /// Waits for the first reply `pick` accepts. Replies it rejects are
    /// dropped.
    pub async fn wait_for<T>(
        &mut self,
        waiting_for: &'static str,
        timeout: Duration,
        mut pick: impl FnMut(&MavMessage) -> Option<T>,
    ) -> Result<T, ProtocolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::select! {
                r = self.replies.recv() => match r {
                    Ok(msg) => {
                        if let Some(v) = pick(&msg) {
                            return Ok(v);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(session = self.session.id, "exchange lagged, {} replies dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(ProtocolError::SessionClosed),
                },
                _ = closed_signal(&mut self.closed) => return Err(ProtocolError::SessionClosed),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ProtocolError::Timeout { waiting_for, after: timeout });
                }
            }
        }
    }
}
