// src/types.rs
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::drivers::{EisError, FrontEndMode};

// 激励类型 (与仪表板参数文件中的缩写一致)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StimulusFamily {
    #[serde(rename = "S")]
    Tone,
    #[serde(rename = "MS")]
    Multisine,
    #[serde(rename = "MLS")]
    Mls,
}
impl StimulusFamily {
    /// Tag used in artifact file names.
    pub fn tag(&self) -> &'static str {
        match self {
            StimulusFamily::Tone => "single",
            StimulusFamily::Multisine => "multi",
            StimulusFamily::Mls => "mls",
        }
    }
}

// 前端板模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardMode {
    Potentiostat,
    Galvanostat,
    Off,
}
impl From<BoardMode> for FrontEndMode {
    fn from(mode: BoardMode) -> Self {
        match mode {
            BoardMode::Potentiostat => FrontEndMode::Potentiostat,
            BoardMode::Galvanostat => FrontEndMode::Galvanostat,
            BoardMode::Off => FrontEndMode::Off,
        }
    }
}

/// Parameter record written by the operator dashboard for one measurement run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub board_mode: BoardMode,
    pub signal_type: StimulusFamily,
    #[serde(default)]
    pub gain_v: Option<f64>,
    #[serde(default)]
    pub gain_i: Option<f64>,
    #[serde(rename = "repeated_measurements")]
    pub repeats: u32,
    /// Voltage channel range (V).
    pub a_daq1: f64,
    /// Current channel range (V).
    pub a_daq2: f64,
    #[serde(rename = "DEIS_offset", default)]
    pub dynamic_offset: f64,
    /// Overrides the configured tone/multisine frequency grid.
    #[serde(default)]
    pub frequencies: Option<Vec<f64>>,
    #[serde(default = "default_mls_order")]
    pub mls_order: u32,
    #[serde(default = "default_mls_repeats")]
    pub mls_repeats: usize,
}
impl RunParameters {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EisError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
    pub fn validate(&self) -> Result<(), EisError> {
        if self.repeats == 0 {
            return Err(EisError::Config("repeated_measurements must be at least 1".into()));
        }
        if !(self.a_daq1 > 0.0) || !(self.a_daq2 > 0.0) {
            return Err(EisError::Config(format!(
                "channel ranges must be positive, got {} / {}",
                self.a_daq1, self.a_daq2
            )));
        }
        Ok(())
    }
}
fn default_mls_order() -> u32 {
    13
}
fn default_mls_repeats() -> usize {
    10
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Error,
}

/// Progress record polled by external observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub status: RunState,
    pub completed: u32,
    pub start_time: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
impl RunStatus {
    pub fn running(start_time: DateTime<Local>, completed: u32) -> Self {
        Self {
            status: RunState::Running,
            completed,
            start_time,
            message: None,
        }
    }
    pub fn is_terminal(&self) -> bool {
        self.status != RunState::Running
    }
}

/// One row of the impedance table.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ImpedancePoint {
    #[serde(rename = "Frequency [Hz]")]
    pub frequency_hz: f64,
    #[serde(rename = "Re(Z)")]
    pub real: f64,
    #[serde(rename = "Im(Z)")]
    pub imag: f64,
}
