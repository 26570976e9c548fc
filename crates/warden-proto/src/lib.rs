pub mod command;
pub mod mission;
pub mod telemetry;
