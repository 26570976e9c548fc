//! Scripted in-process autopilot. Speaks just enough MAVLink over an
//! in-memory channel to drive sessions, supervisors and the protocol code in
//! tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mavlink::common::{
    MavAutopilot, MavCmd, MavLandedState, MavMessage, MavMissionResult, MavModeFlag, MavParamType,
    MavResult, MavState, MavType, COMMAND_ACK_DATA, EXTENDED_SYS_STATE_DATA, GLOBAL_POSITION_INT_DATA,
    HEARTBEAT_DATA, MISSION_ACK_DATA, MISSION_REQUEST_DATA, MISSION_REQUEST_INT_DATA, PARAM_VALUE_DATA,
    SYS_STATUS_DATA,
};
use mavlink::MavHeader;
use warden_proto::telemetry::LandedState;

use crate::channel::{Channel, Connector, Endpoint};
use crate::error::ChannelError;

type Frame = (MavHeader, MavMessage);

/// Our end of an in-memory link to a [`SimAutopilot`].
pub struct SimChannel {
    inbound: Mutex<Receiver<Frame>>,
    outbound: Mutex<Sender<Frame>>,
    closed: AtomicBool,
}

impl Channel for SimChannel {
    fn send(&self, header: &MavHeader, msg: &MavMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let tx = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        tx.send((*header, msg.clone())).map_err(|_| {
            ChannelError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sim autopilot gone"))
        })
    }

    fn recv(&self) -> Result<Frame, ChannelError> {
        let rx = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ChannelError::Closed);
            }
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(frame) => return Ok(frame),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(ChannelError::Closed),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl SimChannel {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// What the simulated vehicle does. Tweak it while running with
/// [`SimAutopilot::set`].
#[derive(Debug, Clone)]
pub struct SimBehavior {
    pub send_heartbeats: bool,
    pub heartbeat_every: Duration,
    pub vehicle_type: MavType,
    pub autopilot: MavAutopilot,
    pub armed: bool,
    pub landed: LandedState,
    /// `None` reports "unknown" (-1) in SYS_STATUS.
    pub battery_remaining: Option<u8>,
    pub ack_commands: bool,
    /// Result for flight commands. Stream and message requests are always accepted.
    pub command_result: MavResult,
    pub answer_landed_query: bool,
    /// A LAND command leaves the vehicle on the ground; otherwise it stays LANDING.
    pub land_completes: bool,
    pub serve_mission: bool,
    pub ack_mission: bool,
    pub mission_result: MavMissionResult,
    pub use_int_requests: bool,
    /// Request order for the next upload. `None` asks 0, 1, ... in order.
    pub request_order: Option<Vec<u16>>,
    pub params: Vec<(String, f32)>,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            send_heartbeats: true,
            heartbeat_every: Duration::from_millis(50),
            vehicle_type: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            armed: false,
            landed: LandedState::OnGround,
            battery_remaining: Some(100),
            ack_commands: true,
            command_result: MavResult::MAV_RESULT_ACCEPTED,
            answer_landed_query: true,
            land_completes: true,
            serve_mission: true,
            ack_mission: true,
            mission_result: MavMissionResult::MAV_MISSION_ACCEPTED,
            use_int_requests: true,
            request_order: None,
            params: Vec::new(),
        }
    }
}

struct Shared {
    behavior: Mutex<SimBehavior>,
    received: Mutex<Vec<MavMessage>>,
    stop: AtomicBool,
}

impl Shared {
    fn behavior(&self) -> SimBehavior {
        self.behavior.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update(&self, f: impl FnOnce(&mut SimBehavior)) {
        f(&mut self.behavior.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

pub struct SimAutopilot {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimAutopilot {
    pub fn spawn(behavior: SimBehavior) -> (SimAutopilot, Arc<SimChannel>) {
        let (to_us, inbound) = mpsc::channel();
        let (outbound, from_us) = mpsc::channel();
        let channel = Arc::new(SimChannel {
            inbound: Mutex::new(inbound),
            outbound: Mutex::new(outbound),
            closed: AtomicBool::new(false),
        });
        let shared = Arc::new(Shared {
            behavior: Mutex::new(behavior),
            received: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });

        let s = shared.clone();
        let thread = std::thread::spawn(move || Vehicle::new(s, to_us, from_us).run());
        (SimAutopilot { shared, thread: Mutex::new(Some(thread)) }, channel)
    }

    pub fn set(&self, f: impl FnOnce(&mut SimBehavior)) {
        self.shared.update(f);
    }

    pub fn behavior(&self) -> SimBehavior {
        self.shared.behavior()
    }

    /// Everything the vehicle received, in order.
    pub fn received(&self) -> Vec<MavMessage> {
        self.shared.received.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// COMMAND_LONG commands received, in order.
    pub fn sent_commands(&self) -> Vec<MavCmd> {
        self.received()
            .into_iter()
            .filter_map(|m| match m {
                MavMessage::COMMAND_LONG(c) => Some(c.command),
                _ => None,
            })
            .collect()
    }

    /// Flight commands only, without stream and message requests.
    pub fn flight_commands(&self) -> Vec<MavCmd> {
        self.sent_commands()
            .into_iter()
            .filter(|c| {
                !matches!(c, MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL | MavCmd::MAV_CMD_REQUEST_MESSAGE)
            })
            .collect()
    }

    pub fn heartbeats_received(&self) -> usize {
        self.received().iter().filter(|m| matches!(m, MavMessage::HEARTBEAT(_))).count()
    }

    /// Item sequence numbers received, in order, across all uploads.
    pub fn mission_items(&self) -> Vec<u16> {
        self.received()
            .into_iter()
            .filter_map(|m| match m {
                MavMessage::MISSION_ITEM_INT(i) => Some(i.seq),
                MavMessage::MISSION_ITEM(i) => Some(i.seq),
                _ => None,
            })
            .collect()
    }

    /// Stops the vehicle thread. Its end of the channel goes away with it.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

impl Drop for SimAutopilot {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Upload {
    count: u16,
    order: Vec<u16>,
    next: usize,
}

struct Vehicle {
    shared: Arc<Shared>,
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    seq: u8,
    upload: Option<Upload>,
}

impl Vehicle {
    fn new(shared: Arc<Shared>, tx: Sender<Frame>, rx: Receiver<Frame>) -> Self {
        Self { shared, tx, rx, seq: 0, upload: None }
    }

    fn run(mut self) {
        let mut last_hb: Option<Instant> = None;
        while !self.shared.stop.load(Ordering::Acquire) {
            let b = self.shared.behavior();
            if b.send_heartbeats && last_hb.map_or(true, |t| t.elapsed() >= b.heartbeat_every) {
                last_hb = Some(Instant::now());
                self.telemetry(&b);
            }

            match self.rx.recv_timeout(Duration::from_millis(5)) {
                Ok((_, msg)) => {
                    self.shared.received.lock().unwrap_or_else(|e| e.into_inner()).push(msg.clone());
                    self.handle(msg);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn send(&mut self, msg: MavMessage) {
        self.seq = self.seq.wrapping_add(1);
        let header = MavHeader { system_id: 1, component_id: 1, sequence: self.seq };
        // the session may be gone already
        let _ = self.tx.send((header, msg));
    }

    fn telemetry(&mut self, b: &SimBehavior) {
        let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if b.armed {
            base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        self.send(MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: b.vehicle_type,
            autopilot: b.autopilot,
            base_mode,
            system_status: if b.armed { MavState::MAV_STATE_ACTIVE } else { MavState::MAV_STATE_STANDBY },
            mavlink_version: 3,
        }));
        self.send(MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            voltage_battery: 15800,
            current_battery: 420,
            battery_remaining: b.battery_remaining.map_or(-1, |p| p as i8),
            ..Default::default()
        }));
        self.send(MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 498_142_336,
            lon: -971_205_414,
            alt: 231_500,
            relative_alt: 20_000,
            ..Default::default()
        }));
    }

    fn ack(&mut self, command: MavCmd, result: MavResult) {
        self.send(MavMessage::COMMAND_ACK(COMMAND_ACK_DATA { command, result, ..Default::default() }));
    }

    fn mission_ack(&mut self, mavtype: MavMissionResult) {
        self.send(MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            target_system: 1,
            target_component: 191,
            mavtype,
            ..Default::default()
        }));
    }

    fn request_item(&mut self, seq: u16, use_int: bool) {
        if use_int {
            self.send(MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
                seq,
                target_system: 1,
                target_component: 191,
                ..Default::default()
            }));
        } else {
            self.send(MavMessage::MISSION_REQUEST(MISSION_REQUEST_DATA {
                seq,
                target_system: 1,
                target_component: 191,
                ..Default::default()
            }));
        }
    }

    fn handle(&mut self, msg: MavMessage) {
        let b = self.shared.behavior();
        match msg {
            MavMessage::COMMAND_LONG(c) => match c.command {
                MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL => self.ack(c.command, MavResult::MAV_RESULT_ACCEPTED),
                MavCmd::MAV_CMD_REQUEST_MESSAGE => {
                    if c.param1 as u32 == 245 && b.answer_landed_query {
                        self.ack(c.command, MavResult::MAV_RESULT_ACCEPTED);
                        self.send(MavMessage::EXTENDED_SYS_STATE(EXTENDED_SYS_STATE_DATA {
                            landed_state: mav_landed_state(b.landed),
                            ..Default::default()
                        }));
                    }
                }
                cmd => {
                    if !b.ack_commands {
                        return;
                    }
                    if b.command_result == MavResult::MAV_RESULT_ACCEPTED {
                        self.apply(cmd, c.param1);
                    }
                    self.ack(cmd, b.command_result);
                }
            },
            MavMessage::COMMAND_INT(c) if b.ack_commands => self.ack(c.command, b.command_result),
            MavMessage::MISSION_CLEAR_ALL(_) if b.serve_mission => {
                self.mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED);
            }
            MavMessage::MISSION_COUNT(c) if b.serve_mission => {
                let order = b.request_order.clone().unwrap_or_else(|| (0..c.count).collect());
                self.upload = Some(Upload { count: c.count, order, next: 0 });
                self.next_request(&b);
            }
            MavMessage::MISSION_ITEM_INT(_) | MavMessage::MISSION_ITEM(_) => self.next_request(&b),
            MavMessage::PARAM_REQUEST_LIST(_) => {
                let count = b.params.len() as u16;
                for (i, (name, value)) in b.params.iter().enumerate() {
                    let mut param_id = [0u8; 16];
                    let n = name.len().min(16);
                    param_id[..n].copy_from_slice(&name.as_bytes()[..n]);
                    self.send(MavMessage::PARAM_VALUE(PARAM_VALUE_DATA {
                        param_value: *value,
                        param_count: count,
                        param_index: i as u16,
                        param_id,
                        param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
                    }));
                }
            }
            _ => {}
        }
    }

    /// Asks for the next item in the scripted order. A request for an item
    /// past the end gets no answer, so the vehicle moves straight on.
    fn next_request(&mut self, b: &SimBehavior) {
        loop {
            let Some(up) = self.upload.as_mut() else { return };
            if up.next >= up.order.len() {
                self.upload = None;
                if b.ack_mission {
                    self.mission_ack(b.mission_result);
                }
                return;
            }
            let seq = up.order[up.next];
            let in_range = seq < up.count;
            up.next += 1;
            self.request_item(seq, b.use_int_requests);
            if in_range {
                return;
            }
        }
    }

    fn apply(&mut self, cmd: MavCmd, param1: f32) {
        match cmd {
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => self.shared.update(|b| b.armed = param1 == 1.0),
            MavCmd::MAV_CMD_NAV_LAND => self.shared.update(|b| {
                b.landed = if b.land_completes { LandedState::OnGround } else { LandedState::Landing };
            }),
            MavCmd::MAV_CMD_NAV_TAKEOFF => self.shared.update(|b| b.landed = LandedState::InAir),
            _ => {}
        }
    }
}

fn mav_landed_state(s: LandedState) -> MavLandedState {
    match s {
        LandedState::Unknown => MavLandedState::MAV_LANDED_STATE_UNDEFINED,
        LandedState::OnGround => MavLandedState::MAV_LANDED_STATE_ON_GROUND,
        LandedState::InAir => MavLandedState::MAV_LANDED_STATE_IN_AIR,
        LandedState::Takeoff => MavLandedState::MAV_LANDED_STATE_TAKEOFF,
        LandedState::Landing => MavLandedState::MAV_LANDED_STATE_LANDING,
    }
}

/// Hands out scripted links, one per connect call. An empty script or a
/// `None` entry fails the connect.
#[derive(Default)]
pub struct SimConnector {
    links: Mutex<VecDeque<Option<Arc<SimChannel>>>>,
    connects: AtomicUsize,
}

impl SimConnector {
    pub fn new(links: impl IntoIterator<Item = Option<Arc<SimChannel>>>) -> Self {
        Self { links: Mutex::new(links.into_iter().collect()), connects: AtomicUsize::new(0) }
    }

    pub fn push(&self, link: Option<Arc<SimChannel>>) {
        self.links.lock().unwrap_or_else(|e| e.into_inner()).push_back(link);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

impl Connector for SimConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Channel>, ChannelError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let next = self.links.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match next {
            Some(Some(channel)) => Ok(channel as Arc<dyn Channel>),
            _ => Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no sim link for {}", endpoint),
            ))),
        }
    }
}
