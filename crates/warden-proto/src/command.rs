use serde::{Deserialize, Serialize};

use crate::mission::{parse_plan, PlanError, Waypoint};

/// Dispatch priority. Lower value is dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanSource {
    /// Plan file on the companion computer.
    Path(String),
    Inline(Vec<Waypoint>),
}

/// Operator command vocabulary accepted on the local socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Terminate,
    ReturnToLaunch,
    Land,
    Arm,
    Takeoff { alt_m: f32 },
    StartMission,
    MissionPlan(PlanSource),
    Status,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RequestError {
    #[error("empty command")]
    Empty,
    #[error("command is not valid UTF-8")]
    NotUtf8,
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("{0}: missing argument")]
    MissingArgument(&'static str),
    #[error("{0}: invalid argument `{1}`")]
    InvalidArgument(&'static str, String),
    #[error("mission plan: {0}")]
    Plan(#[from] PlanError),
}

fn head(text: &str) -> Option<String> {
    text.split_whitespace().next().map(|t| t.to_ascii_uppercase())
}

impl Priority {
    /// Classifies a raw frame by its leading token without fully parsing it.
    /// Anything unrecognised is queued at `Low` and rejected by the dispatcher.
    pub fn of_frame(frame: &[u8]) -> Self {
        let text = String::from_utf8_lossy(frame);
        match head(&text).as_deref() {
            Some("TERMINATE" | "FT" | "BEGIN_FLIGHT_TERMINATION") => Priority::Critical,
            Some("RTL" | "LAND") => Priority::High,
            Some("ARM" | "TAKEOFF" | "START_MISSION" | "MISSION_PLAN") => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

impl Request {
    pub fn parse(frame: &[u8]) -> Result<Self, RequestError> {
        let text = std::str::from_utf8(frame).map_err(|_| RequestError::NotUtf8)?;
        let text = text.trim_matches(char::from(0)).trim();
        let (first_line, rest) = match text.split_once('\n') {
            Some((a, b)) => (a.trim(), b),
            None => (text, ""),
        };
        let mut tokens = first_line.split_whitespace();
        let Some(cmd) = tokens.next() else {
            return Err(RequestError::Empty);
        };

        match cmd.to_ascii_uppercase().as_str() {
            "TERMINATE" | "FT" | "BEGIN_FLIGHT_TERMINATION" => Ok(Request::Terminate),
            "RTL" => Ok(Request::ReturnToLaunch),
            "LAND" => Ok(Request::Land),
            "ARM" => Ok(Request::Arm),
            "START_MISSION" => Ok(Request::StartMission),
            "STATUS" => Ok(Request::Status),
            "TAKEOFF" => {
                let arg = tokens.next().ok_or(RequestError::MissingArgument("TAKEOFF"))?;
                let alt_m: f32 = arg
                    .parse()
                    .ok()
                    .filter(|a: &f32| a.is_finite() && *a > 0.0)
                    .ok_or_else(|| RequestError::InvalidArgument("TAKEOFF", arg.to_string()))?;
                Ok(Request::Takeoff { alt_m })
            }
            "MISSION_PLAN" => match tokens.next() {
                Some(path) => Ok(Request::MissionPlan(PlanSource::Path(path.to_string()))),
                None => {
                    let waypoints = parse_plan(rest)?;
                    if waypoints.is_empty() {
                        return Err(RequestError::MissingArgument("MISSION_PLAN"));
                    }
                    Ok(Request::MissionPlan(PlanSource::Inline(waypoints)))
                }
            },
            other => Err(RequestError::Unknown(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Terminate => "TERMINATE",
            Request::ReturnToLaunch => "RTL",
            Request::Land => "LAND",
            Request::Arm => "ARM",
            Request::Takeoff { .. } => "TAKEOFF",
            Request::StartMission => "START_MISSION",
            Request::MissionPlan(_) => "MISSION_PLAN",
            Request::Status => "STATUS",
        }
    }
}

/// One reply line per command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(String),
    Err(String),
}

impl Reply {
    pub fn ok(detail: impl Into<String>) -> Self {
        Reply::Ok(detail.into())
    }

    pub fn err(reason: impl std::fmt::Display) -> Self {
        Reply::Err(reason.to_string())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }

    pub fn to_line(&self) -> String {
        let (tag, body) = match self {
            Reply::Ok(s) => ("OK", s),
            Reply::Err(s) => ("ERR", s),
        };
        // replies are single-line
        let body = body.replace('\n', " ");
        if body.is_empty() {
            format!("{tag}\n")
        } else {
            format!("{tag} {body}\n")
        }
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end();
        let (tag, body) = line.split_once(' ').unwrap_or((line, ""));
        match tag {
            "OK" => Some(Reply::Ok(body.to_string())),
            "ERR" => Some(Reply::Err(body.to_string())),
            _ => None,
        }
    }
}
