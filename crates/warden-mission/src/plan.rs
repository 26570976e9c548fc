use std::path::{Path, PathBuf};

use warden_proto::mission::{parse_plan, Mission, MissionError, PlanError};

#[derive(Debug, thiserror::Error)]
pub enum PlanFileError {
    #[error("read plan {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("plan {path}: {source}")]
    Parse {
        path: PathBuf,
        source: PlanError,
    },
    #[error("plan {0} has no waypoints")]
    Empty(PathBuf),
    #[error(transparent)]
    Mission(#[from] MissionError),
}

/// Reads a `lat,lon,alt` plan file into a mission.
pub async fn load_plan_file(path: impl AsRef<Path>) -> Result<Mission, PlanFileError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PlanFileError::Io { path: path.to_path_buf(), source })?;
    let waypoints = parse_plan(&text).map_err(|source| PlanFileError::Parse { path: path.to_path_buf(), source })?;
    if waypoints.is_empty() {
        return Err(PlanFileError::Empty(path.to_path_buf()));
    }
    Ok(Mission::from_waypoints(&waypoints)?)
}
