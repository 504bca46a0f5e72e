use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::drivers::EisError;

/// Instrument variant. Both share the U23xx SCPI dialect; they differ in DAC depth and in
/// which analog input carries the current signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum DeviceModel {
    U2351A,
    U2331A,
}
impl DeviceModel {
    /// Output DAC resolution in bits.
    pub fn output_bits(&self) -> u32 {
        match self {
            DeviceModel::U2351A => 16,
            DeviceModel::U2331A => 12,
        }
    }
    /// Analog input wired to the voltage sense amplifier.
    pub fn voltage_input(&self) -> u16 {
        101
    }
    /// Analog input wired to the current shunt amplifier.
    pub fn current_input(&self) -> u16 {
        match self {
            DeviceModel::U2351A => 108,
            DeviceModel::U2331A => 104,
        }
    }
}
impl Default for DeviceModel {
    fn default() -> Self {
        DeviceModel::U2331A
    }
}

/// Two-point linear calibration: `calibrated = (raw - intercept) / slope`.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct LinearCalibration {
    pub slope: f64,
    pub intercept: f64,
}
impl LinearCalibration {
    pub const IDENTITY: LinearCalibration = LinearCalibration {
        slope: 1.0,
        intercept: 0.0,
    };
    pub fn apply(&self, raw: f64) -> f64 {
        (raw - self.intercept) / self.slope
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub voltage: LinearCalibration,
    pub current: LinearCalibration,
}
impl Default for CalibrationConfig {
    fn default() -> Self {
        // Fitted on the bench front end with the 10x voltage amplifier and 0.1 ohm shunt.
        Self {
            voltage: LinearCalibration {
                slope: 9.9108,
                intercept: -0.4180,
            },
            current: LinearCalibration {
                slope: 8.8758,
                intercept: -0.0028,
            },
        }
    }
}
impl CalibrationConfig {
    pub fn identity() -> Self {
        Self {
            voltage: LinearCalibration::IDENTITY,
            current: LinearCalibration::IDENTITY,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    pub amplitude: f64,
    pub samples_per_period: usize,
    pub periods: usize,
    pub frequencies_hz: Vec<f64>,
}
impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            amplitude: 0.005,
            samples_per_period: 100,
            periods: 4,
            frequencies_hz: default_grid(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MultisineConfig {
    pub amplitude: f64,
    pub generation_rate_hz: f64,
    pub acquisition_rate_hz: f64,
    pub duration_s: f64,
    pub frequencies_hz: Vec<f64>,
}
impl Default for MultisineConfig {
    fn default() -> Self {
        Self {
            amplitude: 0.005,
            generation_rate_hz: 2.0e4,
            acquisition_rate_hz: 1.0e4,
            duration_s: 40.0,
            frequencies_hz: default_grid(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MlsConfig {
    pub amplitude: f64,
    pub sample_rate_hz: f64,
}
impl Default for MlsConfig {
    fn default() -> Self {
        Self {
            amplitude: 0.005,
            sample_rate_hz: 2.0e3,
        }
    }
}

/// Timing and levels used by the protocol sequencer.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Volts on output channel 2 while a stimulus is playing.
    pub bias_volts: f64,
    /// Volts on output channel 2 after teardown.
    pub idle_bias_volts: f64,
    /// Volts parked on output channel 1 after teardown (offset null of the driver stage).
    pub park_volts: f64,
    pub max_polls: u64,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    #[serde(with = "millis")]
    pub bit_delay: Duration,
}
impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            bias_volts: 0.0,
            idle_bias_volts: 0.0,
            park_volts: -0.0231,
            max_polls: 100_000,
            poll_interval: Duration::ZERO,
            bit_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceModel,
    pub tone: ToneConfig,
    pub multisine: MultisineConfig,
    pub mls: MlsConfig,
    pub sequencer: SequencerConfig,
    pub calibration: CalibrationConfig,
    pub output_dir: PathBuf,
    pub clear_previous_artifacts: bool,
    pub seed: u64,
}
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceModel::default(),
            tone: ToneConfig::default(),
            multisine: MultisineConfig::default(),
            mls: MlsConfig::default(),
            sequencer: SequencerConfig::default(),
            calibration: CalibrationConfig::default(),
            output_dir: PathBuf::from("output_csv"),
            clear_previous_artifacts: true,
            seed: 1,
        }
    }
}
impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EisError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn default_grid() -> Vec<f64> {
    vec![
        0.05, 0.1, 0.2, 0.4, 1.0, 2.0, 4.0, 10.0, 20.0, 40.0, 100.0, 200.0, 400.0, 1000.0,
    ]
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
