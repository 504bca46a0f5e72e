// src/recorder.rs
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;

use crate::drivers::{DecodedSignal, EisError};
use crate::types::{ImpedancePoint, StimulusFamily};

#[derive(Serialize)]
struct SampleRow {
    #[serde(rename = "Time [s]")]
    time_s: f64,
    #[serde(rename = "Voltage [V]")]
    voltage: f64,
    #[serde(rename = "Current [I]")]
    current: f64,
}

#[derive(Serialize)]
struct ToneSampleRow {
    #[serde(rename = "Time [s]")]
    time_s: f64,
    #[serde(rename = "Frequency [Hz]")]
    frequency_hz: f64,
    #[serde(rename = "Voltage [V]")]
    voltage: f64,
    #[serde(rename = "Current [I]")]
    current: f64,
}

/// Writes the per-measurement CSV artifacts into one output directory.
///
/// Multisine and MLS measurements produce one file pair per repetition. Tone sweeps append
/// every frequency of a repetition to the same pair; the header is written only when the
/// file is created.
pub struct ArtifactWriter {
    dir: PathBuf,
}
impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>, clear_previous: bool) -> Result<Self, EisError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let writer = Self { dir };
        if clear_previous {
            writer.clear()?;
        }
        Ok(writer)
    }
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Removes stale `*.csv` artifacts from earlier runs.
    pub fn clear(&self) -> Result<usize, EisError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "csv") {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => warn!("could not remove {}: {err}", path.display()),
                }
            }
        }
        if removed > 0 {
            info!("removed {removed} previous artifacts from {}", self.dir.display());
        }
        Ok(removed)
    }

    pub fn time_series_path(&self, family: StimulusFamily, index: u32) -> PathBuf {
        self.dir
            .join(format!("sig_V_I_{}_{index}.csv", family.tag()))
    }
    pub fn impedance_path(&self, family: StimulusFamily, index: u32) -> PathBuf {
        self.dir
            .join(format!("z_vector_{}_{index}.csv", family.tag()))
    }

    /// Decoded (uncalibrated) capture of one acquisition. `tone_hz` selects the tone
    /// layout with its frequency column.
    pub fn write_time_series(
        &self,
        family: StimulusFamily,
        index: u32,
        signal: &DecodedSignal,
        tone_hz: Option<f64>,
    ) -> Result<PathBuf, EisError> {
        let path = self.time_series_path(family, index);
        let rows = signal
            .time_base()
            .zip(signal.voltage.iter().zip(&signal.current));
        match tone_hz {
            Some(frequency_hz) => {
                let mut writer = open_csv(&path, family == StimulusFamily::Tone)?;
                for (time_s, (&voltage, &current)) in rows {
                    writer.serialize(ToneSampleRow {
                        time_s,
                        frequency_hz,
                        voltage,
                        current,
                    })?;
                }
                writer.flush()?;
            }
            None => {
                let mut writer = open_csv(&path, false)?;
                for (time_s, (&voltage, &current)) in rows {
                    writer.serialize(SampleRow {
                        time_s,
                        voltage,
                        current,
                    })?;
                }
                writer.flush()?;
            }
        }
        Ok(path)
    }

    pub fn write_impedance(
        &self,
        family: StimulusFamily,
        index: u32,
        points: &[ImpedancePoint],
    ) -> Result<PathBuf, EisError> {
        let path = self.impedance_path(family, index);
        let mut writer = open_csv(&path, family == StimulusFamily::Tone)?;
        for point in points {
            writer.serialize(point)?;
        }
        writer.flush()?;
        Ok(path)
    }
}

/// Truncating writer, or an appending one that emits the header only for a new file.
fn open_csv(path: &Path, append: bool) -> Result<csv::Writer<fs::File>, EisError> {
    let exists = path.exists();
    let file = if append {
        OpenOptions::new().create(true).append(true).open(path)?
    } else {
        fs::File::create(path)?
    };
    Ok(csv::WriterBuilder::new()
        .has_headers(!(append && exists))
        .from_writer(file))
}
