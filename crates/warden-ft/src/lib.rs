pub mod decision;
pub mod engine;

pub use decision::{decide, Action, DEFAULT_BATTERY_THRESHOLD_PCT};
pub use engine::{EngineConfig, TerminationEngine, TerminationError, TerminationState, Trigger};
