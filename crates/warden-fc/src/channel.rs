use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mavlink::common::{MavAutopilot, MavMessage, MavType, HEARTBEAT_DATA};
use mavlink::error::MessageReadError;
use mavlink::{read_versioned_msg, write_versioned_msg, MavHeader, MavlinkVersion};
use serde::{Deserialize, Serialize};
use tokio_serial::SerialPort;
use tracing::info;

use crate::error::ChannelError;

pub const DEFAULT_SERIAL_BAUD: u32 = 57600;

/// Where the telemetry peer lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial { dev: String, baud: u32 },
    /// A mavlink network address such as `udpin:0.0.0.0:14550`.
    Net(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EndpointError {
    #[error("empty endpoint")]
    Empty,
    #[error("unsupported endpoint `{0}` (expected serial:, udpin:, udpout:, udpbcast:, tcpin:, tcpout: or a device path)")]
    Unsupported(String),
    #[error("invalid baud rate in `{0}`")]
    Baud(String),
}

const NET_SCHEMES: [&str; 5] = ["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:"];

impl Endpoint {
    /// Accepts `serial:<dev>[:<baud>]`, a bare device path, or a mavlink
    /// network address. `baud` applies to serial endpoints that don't carry one.
    pub fn parse(s: &str, baud: Option<u32>) -> Result<Self, EndpointError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty);
        }
        if NET_SCHEMES.iter().any(|p| s.starts_with(p)) {
            return Ok(Endpoint::Net(s.to_string()));
        }
        let dev_part = s.strip_prefix("serial:").unwrap_or(s);
        if !(dev_part.starts_with('/') || dev_part.to_ascii_uppercase().starts_with("COM")) {
            return Err(EndpointError::Unsupported(s.to_string()));
        }
        // serial:/dev/ttyUSB0:115200
        let (dev, inline_baud) = match dev_part.rsplit_once(':') {
            Some((dev, b)) if !b.is_empty() && b.chars().all(|c| c.is_ascii_digit()) => {
                let b: u32 = b.parse().map_err(|_| EndpointError::Baud(s.to_string()))?;
                (dev.to_string(), Some(b))
            }
            _ => (dev_part.to_string(), None),
        };
        let baud = inline_baud.or(baud).unwrap_or(DEFAULT_SERIAL_BAUD);
        if baud == 0 {
            return Err(EndpointError::Baud(s.to_string()));
        }
        Ok(Endpoint::Serial { dev, baud })
    }

    pub fn mavlink_url(&self) -> String {
        match self {
            Endpoint::Serial { dev, baud } => format!("serial:{}:{}", dev, baud),
            Endpoint::Net(addr) => addr.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial { dev, baud } => write!(f, "{} @ {}", dev, baud),
            Endpoint::Net(addr) => f.write_str(addr),
        }
    }
}

/// The kind of telemetry peer a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    #[default]
    Autopilot,
    Gcs,
}

impl PeerKind {
    pub fn name(self) -> &'static str {
        match self {
            PeerKind::Autopilot => "autopilot",
            PeerKind::Gcs => "GCS",
        }
    }

    pub fn default_heartbeat_timeout(self) -> Duration {
        match self {
            PeerKind::Autopilot => Duration::from_millis(2500),
            PeerKind::Gcs => Duration::from_millis(2500),
        }
    }

    /// Whether a heartbeat comes from this kind of peer. Other traffic on a
    /// shared link (e.g. a GCS next to the autopilot) must not keep us alive.
    pub fn accepts(self, hb: &HEARTBEAT_DATA) -> bool {
        match self {
            PeerKind::Autopilot => {
                hb.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID && hb.mavtype != MavType::MAV_TYPE_GCS
            }
            PeerKind::Gcs => hb.mavtype == MavType::MAV_TYPE_GCS,
        }
    }
}

/// Message-oriented transport to one telemetry peer.
pub trait Channel: Send + Sync {
    fn send(&self, header: &MavHeader, msg: &MavMessage) -> Result<(), ChannelError>;

    /// Blocks until the next message arrives.
    fn recv(&self) -> Result<(MavHeader, MavMessage), ChannelError>;

    fn close(&self);
}

/// Opens channels. Blocking; callers run it off the async executor.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Channel>, ChannelError>;
}

/// MAVLink v2 over a serial port or a socket.
///
/// Reads time out every [`READ_POLL`] so a closed channel's receiver notices
/// and lets go of its half. [`Channel::close`] drops the write half; once the
/// receiver has returned [`ChannelError::Closed`] the port or socket is free
/// to be opened again.
pub struct MavChannel {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    closed: AtomicBool,
}

/// Longest a blocked read goes without checking for close.
pub const READ_POLL: Duration = Duration::from_millis(100);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted)
}

impl MavChannel {
    fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        }
    }

    fn serial(dev: &str, baud: u32) -> Result<Self, ChannelError> {
        let port = tokio_serial::new(dev, baud).timeout(READ_POLL).open().map_err(|e| {
            ChannelError::Io(io::Error::new(io::ErrorKind::NotFound, format!("open serial device {}: {}", dev, e)))
        })?;
        let writer = port.try_clone().map_err(io::Error::from)?;
        Ok(Self::new(Box::new(port), Box::new(writer)))
    }

    fn net(addr: &str) -> Result<Self, ChannelError> {
        let unsupported = || ChannelError::Io(io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported address {}", addr)));
        let (scheme, rest) = addr.split_once(':').ok_or_else(unsupported)?;
        let sock_addr = rest
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("cannot resolve {}", rest)))?;

        match scheme {
            "udpin" => Self::udp(UdpSocket::bind(sock_addr)?, None),
            "udpout" => Self::udp(UdpSocket::bind("0.0.0.0:0")?, Some(sock_addr)),
            "udpbcast" => {
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket.set_broadcast(true)?;
                Self::udp(socket, Some(sock_addr))
            }
            "tcpout" => Self::tcp(TcpStream::connect(sock_addr)?),
            "tcpin" => {
                // one peer; the listener is dropped once it is accepted
                let (stream, peer) = TcpListener::bind(sock_addr)?.accept()?;
                info!("tcp peer {} connected", peer);
                Self::tcp(stream)
            }
            _ => Err(unsupported()),
        }
    }

    /// `dest` is fixed for udpout/udpbcast; udpin replies to whoever spoke last.
    fn udp(socket: UdpSocket, dest: Option<SocketAddr>) -> Result<Self, ChannelError> {
        socket.set_read_timeout(Some(READ_POLL))?;
        let learn = dest.is_none();
        let dest = Arc::new(Mutex::new(dest));
        let reader = UdpReader {
            socket: socket.try_clone()?,
            buf: vec![0; 65536],
            start: 0,
            end: 0,
            peer: learn.then(|| dest.clone()),
        };
        Ok(Self::new(Box::new(reader), Box::new(UdpWriter { socket, dest })))
    }

    fn tcp(stream: TcpStream) -> Result<Self, ChannelError> {
        stream.set_read_timeout(Some(READ_POLL))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self::new(Box::new(stream), Box::new(writer)))
    }
}

impl Channel for MavChannel {
    fn send(&self, header: &MavHeader, msg: &MavMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let mut frame = Vec::with_capacity(280);
        write_versioned_msg(&mut frame, MavlinkVersion::V2, *header, msg)
            .map_err(|e| ChannelError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        let mut writer = lock(&self.writer);
        let w = writer.as_mut().ok_or(ChannelError::Closed)?;
        w.write_all(&frame)?;
        Ok(())
    }

    fn recv(&self) -> Result<(MavHeader, MavMessage), ChannelError> {
        let mut reader = lock(&self.reader);
        loop {
            if self.closed.load(Ordering::Acquire) {
                reader.take();
                return Err(ChannelError::Closed);
            }
            let r = reader.as_mut().ok_or(ChannelError::Closed)?;
            match read_versioned_msg::<MavMessage, _>(r, MavlinkVersion::V2) {
                Ok(pair) => return Ok(pair),
                Err(MessageReadError::Io(e)) if is_poll_timeout(&e) => continue,
                Err(MessageReadError::Io(e)) => return Err(ChannelError::Io(e)),
                Err(MessageReadError::Parse(e)) => return Err(ChannelError::Malformed(e.to_string())),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.writer).take();
        // a receiver blocked in recv drops the read half itself
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }
}

/// Serves one datagram at a time to the frame parser.
struct UdpReader {
    socket: UdpSocket,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    peer: Option<Arc<Mutex<Option<SocketAddr>>>>,
}

impl Read for UdpReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.start == self.end {
            let (len, src) = self.socket.recv_from(&mut self.buf)?;
            if let Some(peer) = &self.peer {
                *lock(peer) = Some(src);
            }
            self.start = 0;
            self.end = len;
        }
        let n = (self.end - self.start).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
        self.start += n;
        Ok(n)
    }
}

struct UdpWriter {
    socket: UdpSocket,
    dest: Arc<Mutex<Option<SocketAddr>>>,
}

impl Write for UdpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let dest = *lock(&self.dest);
        match dest {
            Some(addr) => self.socket.send_to(buf, addr),
            // udpin before the peer has spoken
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens [`MavChannel`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MavConnector;

impl Connector for MavConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Channel>, ChannelError> {
        let channel = match endpoint {
            Endpoint::Serial { dev, baud } => MavChannel::serial(dev, *baud)?,
            Endpoint::Net(addr) => MavChannel::net(addr)?,
        };
        info!("mavlink channel open: {}", endpoint.mavlink_url());
        Ok(Arc::new(channel))
    }
}
