use serde::{Deserialize, Serialize};

pub const MIN_LATITUDE: f64 = -90.0;
pub const MAX_LATITUDE: f64 = 90.0;
pub const MIN_LONGITUDE: f64 = -180.0;
pub const MAX_LONGITUDE: f64 = 180.0;

pub const DEFAULT_ACCEPT_RADIUS_M: f32 = 1.0;
pub const DEFAULT_PASS_RADIUS_M: f32 = 20.0;

pub fn valid_lat_lon(lat: f64, lon: f64) -> bool {
    (MIN_LATITUDE..=MAX_LATITUDE).contains(&lat) && (MIN_LONGITUDE..=MAX_LONGITUDE).contains(&lon)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    /// Relative to home.
    pub alt_m: f32,
}

/// One waypoint in an uploaded flight plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionItem {
    pub seq: u16,
    pub target: Waypoint,
    pub hold_time_s: f32,
    pub accept_radius_m: f32,
    pub pass_radius_m: f32,
    pub current: bool,
    pub autocontinue: bool,
}

impl MissionItem {
    pub fn waypoint(seq: u16, target: Waypoint) -> Self {
        Self {
            seq,
            target,
            hold_time_s: 0.0,
            accept_radius_m: DEFAULT_ACCEPT_RADIUS_M,
            pass_radius_m: DEFAULT_PASS_RADIUS_M,
            current: false,
            autocontinue: true,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MissionError {
    #[error("mission item at position {index} has seq {seq}")]
    OutOfOrder { index: usize, seq: u16 },
    #[error("mission has {0} items marked current (at most one allowed)")]
    MultipleCurrent(usize),
    #[error("mission too long ({0} items)")]
    TooLong(usize),
}

/// Ordered mission whose sequence numbers are exactly `0..len`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mission {
    items: Vec<MissionItem>,
}

impl Mission {
    pub fn new(items: Vec<MissionItem>) -> Result<Self, MissionError> {
        if items.len() > u16::MAX as usize {
            return Err(MissionError::TooLong(items.len()));
        }
        for (index, item) in items.iter().enumerate() {
            if item.seq as usize != index {
                return Err(MissionError::OutOfOrder { index, seq: item.seq });
            }
        }
        let current = items.iter().filter(|i| i.current).count();
        if current > 1 {
            return Err(MissionError::MultipleCurrent(current));
        }
        Ok(Self { items })
    }

    pub fn from_waypoints(waypoints: &[Waypoint]) -> Result<Self, MissionError> {
        let items = waypoints
            .iter()
            .enumerate()
            .map(|(i, wp)| MissionItem::waypoint(i as u16, *wp))
            .collect();
        Self::new(items)
    }

    pub fn items(&self) -> &[MissionItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, seq: u16) -> Option<&MissionItem> {
        self.items.get(seq as usize)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PlanError {
    #[error("line {line}: expected `lat,lon,alt`")]
    Shape { line: usize },
    #[error("line {line}: {field} is not a number")]
    Number { line: usize, field: &'static str },
    #[error("line {line}: coordinates out of range ({lat}, {lon})")]
    Range { line: usize, lat: f64, lon: f64 },
}

/// Parses a mission plan: one `lat,lon,alt` per line. Blank lines and `#`
/// comments are skipped.
pub fn parse_plan(text: &str) -> Result<Vec<Waypoint>, PlanError> {
    let mut out = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = i + 1;
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(PlanError::Shape { line });
        }
        let lat: f64 = parts[0].parse().map_err(|_| PlanError::Number { line, field: "lat" })?;
        let lon: f64 = parts[1].parse().map_err(|_| PlanError::Number { line, field: "lon" })?;
        let alt_m: f32 = parts[2].parse().map_err(|_| PlanError::Number { line, field: "alt" })?;
        if !valid_lat_lon(lat, lon) {
            return Err(PlanError::Range { line, lat, lon });
        }
        out.push(Waypoint { lat, lon, alt_m });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lat_lon_bounds_are_inclusive() {
        assert!(valid_lat_lon(MIN_LATITUDE, MIN_LONGITUDE));
        assert!(valid_lat_lon(MAX_LATITUDE, MAX_LONGITUDE));
        assert!(!valid_lat_lon(MAX_LATITUDE + 1.0, 0.0));
        assert!(!valid_lat_lon(0.0, MIN_LONGITUDE - 1.0));
    }

    #[test]
    fn parse_plan_skips_comments_and_blanks() {
        let text = "# home field\n49.8142336, -97.1205414, 20\n\n49.8122997,-97.1186914,20\n";
        let wps = parse_plan(text).unwrap();
        assert_eq!(wps.len(), 2);
        assert_eq!(wps[0].lat, 49.8142336);
        assert_eq!(wps[1].alt_m, 20.0);
    }

    #[test]
    fn parse_plan_reports_line_numbers() {
        assert_eq!(parse_plan("1,2,3\n1,2\n"), Err(PlanError::Shape { line: 2 }));
        assert_eq!(
            parse_plan("1,x,3"),
            Err(PlanError::Number { line: 1, field: "lon" })
        );
        assert!(matches!(parse_plan("95,0,10"), Err(PlanError::Range { line: 1, .. })));
    }

    #[test]
    fn mission_requires_contiguous_sequence() {
        let wp = Waypoint { lat: 1.0, lon: 2.0, alt_m: 10.0 };
        let ok = Mission::from_waypoints(&[wp, wp, wp]).unwrap();
        assert_eq!(ok.len(), 3);
        assert_eq!(ok.get(2).map(|i| i.seq), Some(2));

        let bad = vec![MissionItem::waypoint(0, wp), MissionItem::waypoint(2, wp)];
        assert_eq!(Mission::new(bad), Err(MissionError::OutOfOrder { index: 1, seq: 2 }));
    }

    #[test]
    fn mission_allows_one_current_marker() {
        let wp = Waypoint { lat: 1.0, lon: 2.0, alt_m: 10.0 };
        let mut a = MissionItem::waypoint(0, wp);
        let mut b = MissionItem::waypoint(1, wp);
        a.current = true;
        assert!(Mission::new(vec![a.clone(), b.clone()]).is_ok());
        b.current = true;
        assert_eq!(Mission::new(vec![a, b]), Err(MissionError::MultipleCurrent(2)));
    }
}
