pub mod plan;
pub mod upload;

pub use plan::{load_plan_file, PlanFileError};
pub use upload::{MissionAck, MissionUploader, UploadConfig};
