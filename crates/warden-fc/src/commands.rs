use std::time::Duration;

use mavlink::common::{MavCmd, MavFrame, MavMessage, MavResult, COMMAND_INT_DATA, COMMAND_LONG_DATA};
use tracing::{debug, info, warn};
use warden_proto::mission::Waypoint;
use warden_proto::telemetry::LandedState;

use crate::error::{ChannelError, ProtocolError};
use crate::session::{landed_state_from, Exchange, Session, Target};

pub const MSG_ID_SYS_STATUS: u32 = 1;
pub const MSG_ID_ATTITUDE: u32 = 30;
pub const MSG_ID_GLOBAL_POSITION_INT: u32 = 33;
pub const MSG_ID_EXTENDED_SYS_STATE: u32 = 245;

/// Telemetry the supervisor asks for on every new session.
pub const STREAMED_MESSAGES: [u32; 4] = [
    MSG_ID_GLOBAL_POSITION_INT,
    MSG_ID_SYS_STATUS,
    MSG_ID_ATTITUDE,
    MSG_ID_EXTENDED_SYS_STATE,
];

/// A COMMAND_LONG with its seven parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LongCommand {
    pub command: MavCmd,
    pub params: [f32; 7],
}

impl LongCommand {
    pub fn new(command: MavCmd) -> Self {
        Self { command, params: [0.0; 7] }
    }

    /// Sets param `n` (1-based, as in the MAVLink docs).
    pub fn param(mut self, n: usize, value: f32) -> Self {
        if (1..=7).contains(&n) {
            self.params[n - 1] = value;
        }
        self
    }

    pub fn arm() -> Self {
        Self::new(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM).param(1, 1.0)
    }

    pub fn disarm() -> Self {
        Self::new(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM).param(1, 0.0)
    }

    pub fn land() -> Self {
        Self::new(MavCmd::MAV_CMD_NAV_LAND)
    }

    pub fn return_to_launch() -> Self {
        Self::new(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH)
    }

    pub fn takeoff(alt_m: f32) -> Self {
        Self::new(MavCmd::MAV_CMD_NAV_TAKEOFF).param(4, f32::NAN).param(7, alt_m)
    }

    pub fn start_mission() -> Self {
        Self::new(MavCmd::MAV_CMD_MISSION_START)
    }

    pub fn request_message(message_id: u32) -> Self {
        Self::new(MavCmd::MAV_CMD_REQUEST_MESSAGE).param(1, message_id as f32)
    }

    /// `rate_hz <= 0` restores the autopilot default rate.
    pub fn set_message_interval(message_id: u32, rate_hz: f32) -> Self {
        let interval_us = if rate_hz > 0.0 { 1_000_000.0 / rate_hz } else { 0.0 };
        Self::new(MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL)
            .param(1, message_id as f32)
            .param(2, interval_us)
    }

    pub fn to_message(&self, target: Target) -> MavMessage {
        let [param1, param2, param3, param4, param5, param6, param7] = self.params;
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: target.system,
            target_component: target.component,
            command: self.command,
            confirmation: 0,
            param1,
            param2,
            param3,
            param4,
            param5,
            param6,
            param7,
        })
    }

    pub fn name(&self) -> String {
        format!("{:?}", self.command)
    }
}

/// A COMMAND_INT: positional commands whose lat/lon need more precision
/// than an f32 param carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntCommand {
    pub command: MavCmd,
    pub frame: MavFrame,
    pub params: [f32; 4],
    /// Latitude in degE7.
    pub x: i32,
    /// Longitude in degE7.
    pub y: i32,
    pub z: f32,
}

impl IntCommand {
    /// Home at `home`, altitude above mean sea level.
    pub fn set_home(home: Waypoint) -> Self {
        Self {
            command: MavCmd::MAV_CMD_DO_SET_HOME,
            frame: MavFrame::MAV_FRAME_GLOBAL,
            params: [0.0, f32::NAN, f32::NAN, f32::NAN],
            x: (home.lat * 1e7).round() as i32,
            y: (home.lon * 1e7).round() as i32,
            z: home.alt_m,
        }
    }

    pub fn to_message(&self, target: Target) -> MavMessage {
        let [param1, param2, param3, param4] = self.params;
        MavMessage::COMMAND_INT(COMMAND_INT_DATA {
            target_system: target.system,
            target_component: target.component,
            command: self.command,
            frame: self.frame,
            param1,
            param2,
            param3,
            param4,
            x: self.x,
            y: self.y,
            z: self.z,
            ..Default::default()
        })
    }
}

impl Exchange<'_> {
    /// Sends `cmd` and waits for its COMMAND_ACK. An IN_PROGRESS ack restarts
    /// the wait; any other non-accepted result is `Rejected`.
    pub async fn command(&mut self, cmd: LongCommand, ack_timeout: Duration) -> Result<(), ProtocolError> {
        let msg = cmd.to_message(self.target());
        self.acked(&msg, cmd.command, ack_timeout).await
    }

    /// [`Exchange::command`] for a COMMAND_INT.
    pub async fn command_int(&mut self, cmd: IntCommand, ack_timeout: Duration) -> Result<(), ProtocolError> {
        let msg = cmd.to_message(self.target());
        self.acked(&msg, cmd.command, ack_timeout).await
    }

    async fn acked(&mut self, msg: &MavMessage, command: MavCmd, ack_timeout: Duration) -> Result<(), ProtocolError> {
        self.send(msg)?;
        loop {
            let result = self
                .wait_for("COMMAND_ACK", ack_timeout, |msg| match msg {
                    MavMessage::COMMAND_ACK(ack) if ack.command == command => Some(ack.result),
                    _ => None,
                })
                .await?;
            match result {
                MavResult::MAV_RESULT_ACCEPTED => {
                    debug!("{:?} accepted", command);
                    return Ok(());
                }
                MavResult::MAV_RESULT_IN_PROGRESS => debug!("{:?} in progress", command),
                other => {
                    return Err(ProtocolError::Rejected {
                        command: format!("{:?}", command),
                        result: format!("{:?}", other),
                    });
                }
            }
        }
    }
}

impl Session {
    /// One acknowledged long command as its own exchange.
    pub async fn command(&self, cmd: LongCommand, ack_timeout: Duration) -> Result<(), ProtocolError> {
        let mut ex = self.exchange().await?;
        ex.command(cmd, ack_timeout).await
    }

    pub async fn arm(&self, ack_timeout: Duration) -> Result<(), ProtocolError> {
        info!("FC: arming");
        self.command(LongCommand::arm(), ack_timeout).await
    }

    pub async fn disarm(&self, ack_timeout: Duration) -> Result<(), ProtocolError> {
        info!("FC: disarming");
        self.command(LongCommand::disarm(), ack_timeout).await
    }

    pub async fn land(&self, ack_timeout: Duration) -> Result<(), ProtocolError> {
        info!("FC: sending LAND");
        self.command(LongCommand::land(), ack_timeout).await
    }

    pub async fn return_to_launch(&self, ack_timeout: Duration) -> Result<(), ProtocolError> {
        info!("FC: sending RTL");
        self.command(LongCommand::return_to_launch(), ack_timeout).await
    }

    pub async fn takeoff(&self, alt_m: f32, ack_timeout: Duration) -> Result<(), ProtocolError> {
        info!("FC: takeoff to {} m", alt_m);
        self.command(LongCommand::takeoff(alt_m), ack_timeout).await
    }

    pub async fn start_mission(&self, ack_timeout: Duration) -> Result<(), ProtocolError> {
        info!("FC: starting mission");
        self.command(LongCommand::start_mission(), ack_timeout).await
    }

    /// Asks for one EXTENDED_SYS_STATE and returns its landed state.
    pub async fn query_landed_state(&self, timeout: Duration) -> Result<LandedState, ProtocolError> {
        let mut ex = self.exchange().await?;
        ex.send(&LongCommand::request_message(MSG_ID_EXTENDED_SYS_STATE).to_message(ex.target()))?;
        ex.wait_for("EXTENDED_SYS_STATE", timeout, |msg| match msg {
            MavMessage::EXTENDED_SYS_STATE(s) => Some(landed_state_from(s.landed_state)),
            _ => None,
        })
        .await
    }

    /// Fire-and-forget SET_MESSAGE_INTERVAL.
    pub fn set_message_interval(&self, message_id: u32, rate_hz: f32) -> Result<(), ChannelError> {
        self.send(&LongCommand::set_message_interval(message_id, rate_hz).to_message(self.target()))
    }

    /// Requests every streamed telemetry message. Failures are logged only.
    pub fn request_streams(&self, rate_hz: f32) {
        for id in STREAMED_MESSAGES {
            if let Err(e) = self.set_message_interval(id, rate_hz) {
                warn!(session = self.id(), "stream request for msg {} failed: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_interval_is_in_microseconds() {
        let c = LongCommand::set_message_interval(MSG_ID_GLOBAL_POSITION_INT, 4.0);
        assert_eq!(c.command, MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL);
        assert_eq!(c.params[0], 33.0);
        assert_eq!(c.params[1], 250_000.0);
        assert_eq!(LongCommand::set_message_interval(1, 0.0).params[1], 0.0);
    }

    #[test]
    fn arm_and_disarm_differ_only_in_param1() {
        assert_eq!(LongCommand::arm().params[0], 1.0);
        assert_eq!(LongCommand::disarm().params[0], 0.0);
        assert_eq!(LongCommand::arm().command, LongCommand::disarm().command);
    }

    #[test]
    fn command_long_carries_target() {
        let msg = LongCommand::takeoff(12.0).to_message(Target { system: 1, component: 1 });
        match msg {
            MavMessage::COMMAND_LONG(c) => {
                assert_eq!(c.target_system, 1);
                assert_eq!(c.command, MavCmd::MAV_CMD_NAV_TAKEOFF);
                assert_eq!(c.param7, 12.0);
                assert!(c.param4.is_nan());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn set_home_keeps_full_coordinate_precision() {
        let home = Waypoint { lat: 49.8142336, lon: -97.1205414, alt_m: 231.5 };
        match IntCommand::set_home(home).to_message(Target { system: 1, component: 1 }) {
            MavMessage::COMMAND_INT(c) => {
                assert_eq!(c.command, MavCmd::MAV_CMD_DO_SET_HOME);
                assert_eq!(c.frame, MavFrame::MAV_FRAME_GLOBAL);
                assert_eq!(c.param1, 0.0);
                assert_eq!(c.x, 498_142_336);
                assert_eq!(c.y, -971_205_414);
                assert_eq!(c.z, 231.5);
                assert_eq!(c.target_component, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn out_of_range_param_is_ignored() {
        assert_eq!(LongCommand::land().param(0, 5.0).param(8, 5.0), LongCommand::land());
    }
}
