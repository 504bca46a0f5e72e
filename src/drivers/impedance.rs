//! Impedance extraction from a decoded voltage/current capture.
//!
//! - The first half of the record is settling transient and is dropped.
//! - Each channel is calibrated and its residual mean removed.
//! - Both channels are transformed and normalized by the analysed length.
//! - The current spectrum is re-aligned to the voltage spectrum, either by the fixed
//!   half-sample ADC skew or by a delay measured with cross-correlation (MLS).
//! - `Z = V[k] / I[k]` at the nearest bin of every target frequency.
use log::{info, warn};
use rustfft::num_complex::Complex64;

use crate::config::CalibrationConfig;
use crate::drivers::decoder::DecodedSignal;
use crate::drivers::fft::SpectrumBuilder;
use crate::drivers::waveform::bin_index;
use crate::drivers::EisError;
use crate::types::ImpedancePoint;

/// Fraction of the channel range above which a capture is flagged as saturated.
pub const SATURATION_FRACTION: f64 = 0.95;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelayCorrection {
    /// Current channel is sampled half a period ahead of the voltage channel.
    HalfSample,
    /// Measure the channel-to-channel lag from the data.
    CrossCorrelation,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelStats {
    pub mean: f64,
    pub std_dev: f64,
    pub peak: f64,
}
impl ChannelStats {
    pub fn of(data: &[f64]) -> Self {
        if data.is_empty() {
            return Self::default();
        }
        let mean = mean(data);
        let variance = data
            .iter()
            .map(|v| {
                let delta = v - mean;
                delta * delta
            })
            .sum::<f64>()
            / data.len() as f64;
        let peak = data.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
        Self {
            mean,
            std_dev: variance.sqrt(),
            peak,
        }
    }
}

/// Peak amplitudes of voltage and current at one target bin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BinAmplitude {
    pub frequency_hz: f64,
    pub voltage_peak: f64,
    pub current_peak: f64,
}

#[derive(Clone, Debug)]
pub struct Extraction {
    pub impedance: Vec<ImpedancePoint>,
    pub amplitudes: Vec<BinAmplitude>,
    pub voltage_stats: ChannelStats,
    pub current_stats: ChannelStats,
    pub voltage_saturated: bool,
    pub current_saturated: bool,
    /// Lag of the current channel behind the voltage channel, when measured.
    pub delay_samples: Option<isize>,
}

pub struct ImpedanceExtractor {
    calibration: CalibrationConfig,
    spectra: SpectrumBuilder,
}
impl ImpedanceExtractor {
    pub fn new(calibration: CalibrationConfig) -> Self {
        Self {
            calibration,
            spectra: SpectrumBuilder::new(),
        }
    }

    pub fn extract(
        &mut self,
        signal: &DecodedSignal,
        voltage_range: f64,
        current_range: f64,
        targets_hz: &[f64],
        correction: DelayCorrection,
    ) -> Result<Extraction, EisError> {
        if signal.voltage.len() != signal.current.len() {
            return Err(EisError::Decode(format!(
                "channel lengths differ: {} voltage vs {} current samples",
                signal.voltage.len(),
                signal.current.len()
            )));
        }
        if signal.len() < 2 {
            return Err(EisError::Decode(format!(
                "capture of {} samples is too short to analyse",
                signal.len()
            )));
        }
        let fs = signal.sample_rate_hz;
        let voltage_stats = ChannelStats::of(&signal.voltage);
        let current_stats = ChannelStats::of(&signal.current);
        info!(
            "voltage mean {:.6} V std {:.6} V, current mean {:.6} V std {:.6} V",
            voltage_stats.mean, voltage_stats.std_dev, current_stats.mean, current_stats.std_dev
        );
        let voltage_saturated = is_saturated(&signal.voltage, voltage_range);
        let current_saturated = is_saturated(&signal.current, current_range);
        if voltage_saturated {
            warn!("voltage channel saturated (peak {:.4} V, range {voltage_range} V)", voltage_stats.peak);
        }
        if current_saturated {
            warn!("current channel saturated (peak {:.4} V, range {current_range} V)", current_stats.peak);
        }

        let start = signal.len() / 2;
        let v = steady_state(&signal.voltage[start..], |x| self.calibration.voltage.apply(x));
        let i = steady_state(&signal.current[start..], |x| self.calibration.current.apply(x));
        let n = v.len();

        let delay_samples = match correction {
            DelayCorrection::HalfSample => None,
            DelayCorrection::CrossCorrelation => {
                let lag = self.estimate_delay(&v, &i);
                info!("current lags voltage by {lag} samples ({:.6} s)", lag as f64 / fs);
                Some(lag)
            }
        };

        let v_spec = self.spectra.compute(&v, fs);
        let mut i_spec = self.spectra.compute(&i, fs);
        match delay_samples {
            None => i_spec.apply_delay(0.5 / fs),
            Some(lag) => i_spec.apply_delay(-(lag as f64) / fs),
        }

        let mut impedance = Vec::with_capacity(targets_hz.len());
        let mut amplitudes = Vec::with_capacity(targets_hz.len());
        for &target in targets_hz {
            let k = bin_index(target, fs, n);
            if k >= n {
                return Err(EisError::Config(format!(
                    "{target} Hz is beyond the {n}-sample analysis record"
                )));
            }
            let z: Complex64 = v_spec.bins[k] / i_spec.bins[k];
            let frequency_hz = v_spec.frequencies_hz[k];
            impedance.push(ImpedancePoint {
                frequency_hz,
                real: z.re,
                imag: z.im,
            });
            amplitudes.push(BinAmplitude {
                frequency_hz,
                voltage_peak: v_spec.peak_amplitude(k),
                current_peak: i_spec.peak_amplitude(k),
            });
        }
        Ok(Extraction {
            impedance,
            amplitudes,
            voltage_stats,
            current_stats,
            voltage_saturated,
            current_saturated,
            delay_samples,
        })
    }

    /// Lag `d` maximizing `sum v[n] * i[n + d]`; positive when the current trails.
    pub fn estimate_delay(&mut self, voltage: &[f64], current: &[f64]) -> isize {
        let mut best = (0isize, f64::NEG_INFINITY);
        for (lag, r) in self.spectra.cross_correlation(voltage, current) {
            if r > best.1 {
                best = (lag, r);
            }
        }
        best.0
    }
}

/// True when any sample exceeds `SATURATION_FRACTION` of the channel range.
pub fn is_saturated(data: &[f64], range: f64) -> bool {
    let limit = SATURATION_FRACTION * range;
    data.iter().any(|v| v.abs() > limit)
}

fn steady_state(data: &[f64], calibrate: impl Fn(f64) -> f64) -> Vec<f64> {
    let calibrated: Vec<f64> = data.iter().map(|&x| calibrate(x)).collect();
    let mean = mean(&calibrated);
    calibrated.into_iter().map(|x| x - mean).collect()
}

fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}
