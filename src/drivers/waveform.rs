//! Excitation planning: sample rates, record lengths, frequency grid and the quantized
//! pattern uploaded to the generator's waveform memory.
use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{DeviceModel, EngineConfig};
use crate::drivers::{mls, EisError};
use crate::types::StimulusFamily;

/// Largest normalized excursion allowed before quantization.
pub const DESIGN_HEADROOM: f64 = 0.95;

/// Everything a run needs to play one stimulus and capture its response.
#[derive(Clone, Debug)]
pub struct StimulusPlan {
    pub family: StimulusFamily,
    pub generation_rate_hz: f64,
    pub generation_len: usize,
    /// Time base of the generated record (s).
    pub time_base: Vec<f64>,
    /// Normalized stimulus in [-1, 1].
    pub signal: Vec<f64>,
    /// Unsigned DAC codes, centred at mid-scale.
    pub codes: Vec<u16>,
    pub frequencies_hz: Vec<f64>,
    pub acquisition_rate_hz: f64,
    pub acquisition_len: usize,
}
impl StimulusPlan {
    /// Wire format for the waveform-memory write: LSB then MSB for every code.
    pub fn packed(&self) -> Vec<u8> {
        pack_codes(&self.codes)
    }
    /// Number of samples the extractor analyses after dropping the settling half.
    pub fn analysis_len(&self) -> usize {
        self.acquisition_len - self.acquisition_len / 2
    }
}

/// Computes stimulus plans for the three excitation families.
pub struct WaveformPlanner<'a> {
    config: &'a EngineConfig,
    rng: StdRng,
}
impl<'a> WaveformPlanner<'a> {
    pub fn new(config: &'a EngineConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }
    fn model(&self) -> DeviceModel {
        self.config.device
    }

    /// Single sinusoid sampled at a fixed number of points per period, so the capture
    /// always holds an integer number of periods.
    pub fn tone(&mut self, frequency_hz: f64) -> Result<StimulusPlan, EisError> {
        if !(frequency_hz > 0.0) || !frequency_hz.is_finite() {
            return Err(EisError::Config(format!(
                "tone frequency must be positive, got {frequency_hz}"
            )));
        }
        let tone = &self.config.tone;
        let per_period = tone.samples_per_period;
        let rate = per_period as f64 * frequency_hz;
        let len = per_period * tone.periods;
        let time_base = time_base(rate, len);
        let signal: Vec<f64> = time_base
            .iter()
            .map(|t| tone.amplitude * (2.0 * PI * frequency_hz * t).sin())
            .collect();
        let codes = quantize(&signal, self.model().output_bits())?;
        Ok(StimulusPlan {
            family: StimulusFamily::Tone,
            generation_rate_hz: rate,
            generation_len: len,
            time_base,
            signal,
            codes,
            frequencies_hz: vec![frequency_hz],
            acquisition_rate_hz: rate,
            acquisition_len: len,
        })
    }

    /// Sum of sinusoids at every grid frequency with independent random phases, plus a
    /// constant bias.
    pub fn multisine(
        &mut self,
        frequencies_hz: &[f64],
        dynamic_offset: f64,
    ) -> Result<StimulusPlan, EisError> {
        let ms = &self.config.multisine;
        let gen_rate = ms.generation_rate_hz;
        let acq_rate = ms.acquisition_rate_hz;
        let gen_len = (ms.duration_s * gen_rate).ceil() as usize;
        let acq_len = (ms.duration_s * acq_rate).round() as usize;
        validate_grid(frequencies_hz, acq_rate, acq_len)?;
        let phases: Vec<f64> = frequencies_hz
            .iter()
            .map(|_| 2.0 * PI * self.rng.gen::<f64>())
            .collect();
        let time_base = time_base(gen_rate, gen_len);
        let signal: Vec<f64> = time_base
            .iter()
            .map(|t| {
                let tones: f64 = frequencies_hz
                    .iter()
                    .zip(&phases)
                    .map(|(f, phase)| ms.amplitude * (2.0 * PI * f * t + phase).sin())
                    .sum();
                tones + dynamic_offset
            })
            .collect();
        let codes = quantize(&signal, self.model().output_bits())?;
        Ok(StimulusPlan {
            family: StimulusFamily::Multisine,
            generation_rate_hz: gen_rate,
            generation_len: gen_len,
            time_base,
            signal,
            codes,
            frequencies_hz: frequencies_hz.to_vec(),
            acquisition_rate_hz: acq_rate,
            acquisition_len: acq_len,
        })
    }

    /// Bipolar MLS tiled `repeats` times. Only every `repeats`-th bin of the capture
    /// carries stimulus energy, so those bins form the grid.
    ///
    /// The analysed second half must hold whole periods, so `repeats` is even and at
    /// least 2.
    pub fn mls(&mut self, order: u32, repeats: usize) -> Result<StimulusPlan, EisError> {
        if repeats < 2 || repeats % 2 != 0 {
            return Err(EisError::Config(format!(
                "MLS repeat count must be even and at least 2, got {repeats}"
            )));
        }
        let seq = mls::max_len_seq(order)?;
        let cfg = &self.config.mls;
        let rate = cfg.sample_rate_hz;
        let len = seq.len() * repeats;
        let signal: Vec<f64> = seq
            .iter()
            .cycle()
            .take(len)
            .map(|&bit| cfg.amplitude * (2.0 * bit as f64 - 1.0))
            .collect();
        let bin_width = rate / len as f64;
        let frequencies_hz: Vec<f64> = (1..)
            .map(|k| k * repeats)
            .take_while(|&bin| 2 * bin < len)
            .map(|bin| bin as f64 * bin_width)
            .collect();
        let codes = quantize(&signal, self.model().output_bits())?;
        Ok(StimulusPlan {
            family: StimulusFamily::Mls,
            generation_rate_hz: rate,
            generation_len: len,
            time_base: time_base(rate, len),
            signal,
            codes,
            frequencies_hz,
            acquisition_rate_hz: rate,
            acquisition_len: len,
        })
    }
}

fn time_base(rate_hz: f64, len: usize) -> Vec<f64> {
    (0..len).map(|n| n as f64 / rate_hz).collect()
}

/// FFT bin of `frequency_hz` in a record of `len` samples.
pub fn bin_index(frequency_hz: f64, sample_rate_hz: f64, len: usize) -> usize {
    (len as f64 * frequency_hz / sample_rate_hz).round() as usize
}

/// A grid is usable when every frequency lands on its own non-DC bin below Nyquist of
/// the analysed (second) half of the capture.
pub fn validate_grid(
    frequencies_hz: &[f64],
    acquisition_rate_hz: f64,
    acquisition_len: usize,
) -> Result<(), EisError> {
    if frequencies_hz.is_empty() {
        return Err(EisError::Config("frequency grid is empty".into()));
    }
    let analysed = acquisition_len - acquisition_len / 2;
    let mut bins = Vec::with_capacity(frequencies_hz.len());
    for &f in frequencies_hz {
        if !(f > 0.0) || 2.0 * f >= acquisition_rate_hz {
            return Err(EisError::Config(format!(
                "{f} Hz is outside (0, {}) Hz",
                acquisition_rate_hz / 2.0
            )));
        }
        let bin = bin_index(f, acquisition_rate_hz, analysed);
        if bin == 0 {
            return Err(EisError::Config(format!(
                "{f} Hz is below the {} Hz resolution of the record",
                acquisition_rate_hz / analysed as f64
            )));
        }
        if bins.contains(&bin) {
            return Err(EisError::Config(format!("{f} Hz shares FFT bin {bin} with another frequency")));
        }
        bins.push(bin);
    }
    Ok(())
}

/// Maps a normalized signal onto unsigned `bits`-wide DAC codes centred at mid-scale.
pub fn quantize(signal: &[f64], bits: u32) -> Result<Vec<u16>, EisError> {
    let peak = signal.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if !(peak <= DESIGN_HEADROOM) {
        return Err(EisError::Config(format!(
            "stimulus peak {peak:.4} exceeds {DESIGN_HEADROOM} of full scale"
        )));
    }
    let half = (1u32 << (bits - 1)) as f64;
    let max_code = ((1u32 << bits) - 1) as f64;
    Ok(signal
        .iter()
        .map(|v| ((v * half).floor() + half).clamp(0.0, max_code) as u16)
        .collect())
}

pub fn pack_codes(codes: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(codes.len() * 2);
    for &code in codes {
        out.push((code & 0xff) as u8);
        out.push((code >> 8) as u8);
    }
    out
}

pub fn unpack_codes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| pair[0] as u16 | (pair[1] as u16) << 8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    fn config() -> EngineConfig {
        EngineConfig::default()
    }
    #[test]
    fn tone_rates_follow_frequency() {
        let cfg = config();
        let mut planner = WaveformPlanner::new(&cfg, 1);
        for f in [0.05, 1.0, 10.0, 333.3, 1000.0] {
            let plan = planner.tone(f).unwrap();
            assert_eq!(plan.generation_rate_hz, 100.0 * f);
            assert_eq!(plan.acquisition_rate_hz, 100.0 * f);
            assert_eq!(plan.generation_len, 400);
            assert_eq!(plan.acquisition_len, 400);
            assert_eq!(plan.codes.len(), 400);
        }
    }
    #[test]
    fn ten_hz_tone_spans_four_periods() {
        let cfg = config();
        let plan = WaveformPlanner::new(&cfg, 1).tone(10.0).unwrap();
        assert_eq!(plan.generation_rate_hz, 1000.0);
        let duration = plan.generation_len as f64 / plan.generation_rate_hz;
        assert!((duration * 10.0 - 4.0).abs() < 1e-12);
        // Zero crossings with positive slope at the start of every period.
        let rising = plan
            .signal
            .windows(2)
            .filter(|w| w[0] <= 0.0 && w[1] > 0.0)
            .count();
        assert_eq!(rising, 4);
    }
    #[test]
    fn packed_buffer_reproduces_codes() {
        let cfg = EngineConfig {
            device: DeviceModel::U2351A,
            ..config()
        };
        let plan = WaveformPlanner::new(&cfg, 1).tone(25.0).unwrap();
        let packed = plan.packed();
        assert_eq!(packed.len(), 2 * plan.generation_len);
        assert_eq!(unpack_codes(&packed), plan.codes);
        assert_eq!(packed[0], (plan.codes[0] & 0xff) as u8);
        assert_eq!(packed[1], (plan.codes[0] >> 8) as u8);
    }
    #[test]
    fn quantization_is_centred_at_mid_scale() {
        let codes = quantize(&[0.0, 0.5, -0.5, 0.95], 12).unwrap();
        assert_eq!(codes, vec![2048, 3072, 1024, 3993]);
        let codes = quantize(&[0.0, -0.95], 16).unwrap();
        assert_eq!(codes, vec![32768, 1638]);
    }
    #[test]
    fn overdriven_design_is_a_config_error() {
        assert!(matches!(quantize(&[0.2, 0.951], 16), Err(EisError::Config(_))));
        let mut cfg = config();
        cfg.tone.amplitude = 0.99;
        assert!(WaveformPlanner::new(&cfg, 1).tone(10.0).is_err());
    }
    #[test]
    fn multisine_grid_maps_to_distinct_bins() {
        let mut cfg = config();
        cfg.multisine.generation_rate_hz = 4000.0;
        let plan = WaveformPlanner::new(&cfg, 1)
            .multisine(&cfg.multisine.frequencies_hz.clone(), 0.0)
            .unwrap();
        let analysed = plan.analysis_len();
        let mut bins: Vec<usize> = plan
            .frequencies_hz
            .iter()
            .map(|&f| bin_index(f, plan.acquisition_rate_hz, analysed))
            .collect();
        let total = bins.len();
        bins.sort_unstable();
        bins.dedup();
        assert_eq!(bins.len(), total);
        assert!(bins[0] > 0);
    }
    #[test]
    fn aliasing_grid_is_rejected() {
        // 10 s at 1 kHz analysed over 5 s: 0.2 Hz resolution.
        assert!(validate_grid(&[1.0, 1.02], 1000.0, 10_000).is_err());
        assert!(validate_grid(&[0.01], 1000.0, 10_000).is_err());
        assert!(validate_grid(&[600.0], 1000.0, 10_000).is_err());
        assert!(validate_grid(&[1.0, 1.1, 499.0], 1000.0, 10_000).is_ok());
    }
    #[test]
    fn multisine_phases_are_reproducible_per_seed() {
        let mut cfg = config();
        cfg.multisine.duration_s = 2.0;
        cfg.multisine.generation_rate_hz = 2000.0;
        cfg.multisine.acquisition_rate_hz = 1000.0;
        let grid = [1.0, 5.0, 20.0];
        let a = WaveformPlanner::new(&cfg, 7).multisine(&grid, 0.1).unwrap();
        let b = WaveformPlanner::new(&cfg, 7).multisine(&grid, 0.1).unwrap();
        let c = WaveformPlanner::new(&cfg, 8).multisine(&grid, 0.1).unwrap();
        assert_eq!(a.codes, b.codes);
        assert_ne!(a.codes, c.codes);
        let mean = a.signal.iter().sum::<f64>() / a.signal.len() as f64;
        assert!((mean - 0.1).abs() < 1e-3);
    }
    #[test]
    fn mls_plan_tiles_sequence_and_selects_every_repeat_bin() {
        let cfg = config();
        let plan = WaveformPlanner::new(&cfg, 1).mls(7, 4).unwrap();
        assert_eq!(plan.generation_len, 127 * 4);
        assert_eq!(plan.acquisition_len, plan.generation_len);
        assert_eq!(&plan.signal[..127], &plan.signal[127..254]);
        assert!(plan
            .signal
            .iter()
            .all(|v| (v.abs() - cfg.mls.amplitude).abs() < 1e-15));
        let bin_width = plan.acquisition_rate_hz / plan.acquisition_len as f64;
        assert_eq!(plan.frequencies_hz.len(), 63);
        for (k, f) in plan.frequencies_hz.iter().enumerate() {
            let bin = (f / bin_width).round() as usize;
            assert_eq!(bin, 4 * (k + 1));
        }
    }
    #[test]
    fn mls_rejects_repeats_that_split_a_period() {
        let cfg = config();
        let mut planner = WaveformPlanner::new(&cfg, 1);
        for repeats in [0, 1, 3, 5] {
            assert!(
                matches!(planner.mls(7, repeats), Err(EisError::Config(_))),
                "repeats = {repeats}"
            );
        }
        // Second half of an even tiling is whole periods, so every grid bin of the
        // analysed record is distinct.
        let plan = planner.mls(7, 2).unwrap();
        let analysed = plan.acquisition_len / 2;
        let bins: Vec<usize> = plan
            .frequencies_hz
            .iter()
            .map(|&f| bin_index(f, plan.acquisition_rate_hz, analysed))
            .collect();
        let mut unique = bins.clone();
        unique.dedup();
        assert_eq!(unique, bins);
        assert_eq!(&plan.signal[..127], &plan.signal[127..]);
    }
}
