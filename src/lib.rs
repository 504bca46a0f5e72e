// src/lib.rs
// 电化学阻抗谱 (EIS) 测量引擎
pub mod config;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod status;
pub mod types;

pub use config::EngineConfig;
pub use engine::{run_measurement, RunContext, RunReport};
pub use types::{RunParameters, RunStatus};
