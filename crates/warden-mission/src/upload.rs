use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavMissionResult, MISSION_CLEAR_ALL_DATA, MISSION_COUNT_DATA,
    MISSION_ITEM_DATA, MISSION_ITEM_INT_DATA,
};
use tracing::{debug, info, warn};
use warden_fc::commands::IntCommand;
use warden_fc::{ProtocolError, Session, Target};
use warden_proto::mission::{Mission, MissionItem, Waypoint};

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Bound on every wait in the handshake. The item phase as a whole gets
    /// one step per item plus one for the final ack.
    pub step_timeout: Duration,
    /// Set home to this before uploading.
    pub home: Option<Waypoint>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { step_timeout: Duration::from_secs(5), home: None }
    }
}

/// Final MISSION_ACK of an upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissionAck {
    pub result: MavMissionResult,
    pub items: u16,
}

impl MissionAck {
    pub fn is_accepted(&self) -> bool {
        self.result == MavMissionResult::MAV_MISSION_ACCEPTED
    }
}

impl fmt::Display for MissionAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} items, {:?}", self.items, self.result)
    }
}

enum Step {
    Request { seq: u16, int: bool },
    Ack(MavMissionResult),
}

fn mission_step(msg: &MavMessage) -> Option<Step> {
    match msg {
        MavMessage::MISSION_REQUEST_INT(r) => Some(Step::Request { seq: r.seq, int: true }),
        MavMessage::MISSION_REQUEST(r) => Some(Step::Request { seq: r.seq, int: false }),
        MavMessage::MISSION_ACK(a) => Some(Step::Ack(a.mavtype)),
        _ => None,
    }
}

/// Drives the mission upload handshake. Holds no state between uploads.
#[derive(Debug, Clone, Default)]
pub struct MissionUploader {
    config: UploadConfig,
}

impl MissionUploader {
    pub fn new(config: UploadConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Clears the remote mission, announces the count, answers item requests
    /// and returns the final ack. The whole handshake is one exchange on
    /// `session`; a timeout aborts the upload but leaves the session usable.
    pub async fn upload(&self, session: &Session, mission: &Mission) -> Result<MissionAck, ProtocolError> {
        let step_timeout = self.config.step_timeout;
        let n = mission.len() as u16;
        let mut ex = session.exchange().await?;
        let target = ex.target();

        if let Some(home) = self.config.home {
            info!("setting home: lat={} lon={} alt={}", home.lat, home.lon, home.alt_m);
            ex.command_int(IntCommand::set_home(home), step_timeout).await?;
        }

        ex.send(&MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
            target_system: target.system,
            target_component: target.component,
            ..Default::default()
        }))?;
        let cleared = ex
            .wait_for("MISSION_ACK (clear)", step_timeout, |msg| match msg {
                MavMessage::MISSION_ACK(a) => Some(a.mavtype),
                _ => None,
            })
            .await;
        match cleared {
            Ok(r) => debug!("mission clear: {:?}", r),
            // some autopilots don't ack a clear
            Err(e) if e.is_timeout() => warn!("no ack for mission clear, continuing"),
            Err(e) => return Err(e),
        }

        info!("uploading {} mission items", n);
        ex.send(&MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count: n,
            target_system: target.system,
            target_component: target.component,
            ..Default::default()
        }))?;

        // repeated or out-of-range requests must not stretch this forever
        let budget = step_timeout * (u32::from(n) + 1);
        let deadline = tokio::time::Instant::now() + budget;
        let mut sent: BTreeSet<u16> = BTreeSet::new();
        loop {
            let waiting_for = if (sent.len() as u16) < n { "MISSION_REQUEST" } else { "MISSION_ACK" };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!("mission upload unfinished after {:?} ({}/{} items sent)", budget, sent.len(), n);
                return Err(ProtocolError::Timeout { waiting_for, after: budget });
            }
            match ex.wait_for(waiting_for, step_timeout.min(remaining), mission_step).await? {
                Step::Request { seq, .. } if seq >= n => {
                    warn!("autopilot requested item {} of a {}-item mission, ignoring", seq, n);
                }
                Step::Request { seq, int } => {
                    // Mission guarantees seq < len maps to an item
                    let Some(item) = mission.get(seq) else { continue };
                    info!("sending waypoint {}/{}", seq, n - 1);
                    ex.send(&encode_item(item, target, int))?;
                    sent.insert(seq);
                }
                Step::Ack(MavMissionResult::MAV_MISSION_ACCEPTED) if (sent.len() as u16) < n => {
                    debug!("ignoring early MISSION_ACK ({}/{} items sent)", sent.len(), n);
                }
                Step::Ack(result) => {
                    let ack = MissionAck { result, items: n };
                    if ack.is_accepted() {
                        info!("mission accepted ({} items)", n);
                    } else {
                        warn!("mission rejected: {:?}", result);
                    }
                    return Ok(ack);
                }
            }
        }
    }
}

/// Wire form of one item, answering a MISSION_REQUEST_INT with
/// MISSION_ITEM_INT and a legacy MISSION_REQUEST with MISSION_ITEM.
pub fn encode_item(item: &MissionItem, target: Target, int: bool) -> MavMessage {
    let wp = item.target;
    if int {
        MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
            param1: item.hold_time_s,
            param2: item.accept_radius_m,
            param3: item.pass_radius_m,
            param4: f32::NAN,
            x: (wp.lat * 1e7).round() as i32,
            y: (wp.lon * 1e7).round() as i32,
            z: wp.alt_m,
            seq: item.seq,
            command: MavCmd::MAV_CMD_NAV_WAYPOINT,
            target_system: target.system,
            target_component: target.component,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            current: item.current as u8,
            autocontinue: item.autocontinue as u8,
            ..Default::default()
        })
    } else {
        MavMessage::MISSION_ITEM(MISSION_ITEM_DATA {
            param1: item.hold_time_s,
            param2: item.accept_radius_m,
            param3: item.pass_radius_m,
            param4: f32::NAN,
            x: wp.lat as f32,
            y: wp.lon as f32,
            z: wp.alt_m,
            seq: item.seq,
            command: MavCmd::MAV_CMD_NAV_WAYPOINT,
            target_system: target.system,
            target_component: target.component,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
            current: item.current as u8,
            autocontinue: item.autocontinue as u8,
            ..Default::default()
        })
    }
}
