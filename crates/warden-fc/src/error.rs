use std::time::Duration;

/// Failure of the underlying telemetry transport.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel i/o: {0}")]
    Io(#[from] std::io::Error),
    /// Bytes arrived but did not decode to a message. Logged and discarded.
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("channel closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not open {endpoint} after {attempts} attempt(s): {source}")]
    Open {
        endpoint: String,
        attempts: u32,
        source: ChannelError,
    },
    #[error("no heartbeat from the {peer} on {endpoint} within {timeout:?}")]
    NoHeartbeat {
        endpoint: String,
        peer: &'static str,
        timeout: Duration,
    },
    #[error("connect task failed: {0}")]
    Task(String),
}

/// Liveness check and the follow-up reconnect both failed. The owner of the
/// supervisor must hand this to flight termination.
#[derive(Debug, thiserror::Error)]
#[error("connection to {endpoint} lost: {reason}")]
pub struct ConnectionLost {
    pub endpoint: String,
    #[source]
    pub reason: ConnectionError,
}

/// Failure of one request/reply exchange. The session stays usable.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        after: Duration,
    },
    #[error("{command} rejected: {result}")]
    Rejected { command: String, result: String },
    #[error("session closed")]
    SessionClosed,
    #[error("send failed: {0}")]
    Send(#[source] ChannelError),
}

impl ProtocolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout { .. })
    }
}
