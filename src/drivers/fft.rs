use rustfft::{num_complex::Complex64, FftPlanner};

/// Complex spectrum of one channel, normalized by the record length.
#[derive(Clone, Debug)]
pub struct ComplexSpectrum {
    pub sample_rate_hz: f64,
    /// Bin frequencies over the full (unfolded) range `0..sample_rate_hz`.
    pub frequencies_hz: Vec<f64>,
    pub bins: Vec<Complex64>,
}
impl ComplexSpectrum {
    pub fn len(&self) -> usize {
        self.bins.len()
    }
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
    /// Peak amplitude of the sinusoid carried by bin `k`.
    pub fn peak_amplitude(&self, k: usize) -> f64 {
        2.0 * self.bins[k].norm()
    }
    /// Multiplies every bin by `exp(-j 2 pi f delay)`, i.e. delays the signal by `delay_s`.
    pub fn apply_delay(&mut self, delay_s: f64) {
        for (bin, f) in self.bins.iter_mut().zip(&self.frequencies_hz) {
            *bin *= Complex64::from_polar(1.0, -2.0 * std::f64::consts::PI * f * delay_s);
        }
    }
}

/// Plans FFTs once and reuses them for both channels of a record.
pub struct SpectrumBuilder {
    planner: FftPlanner<f64>,
}
impl SpectrumBuilder {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }
    pub fn compute(&mut self, samples: &[f64], sample_rate_hz: f64) -> ComplexSpectrum {
        let n = samples.len();
        let mut buffer: Vec<Complex64> = samples.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        if n > 0 {
            let fft = self.planner.plan_fft_forward(n);
            fft.process(&mut buffer);
        }
        let scale = 1.0 / n.max(1) as f64;
        for bin in &mut buffer {
            *bin *= scale;
        }
        let frequencies_hz = (0..n)
            .map(|k| k as f64 * sample_rate_hz / n as f64)
            .collect();
        ComplexSpectrum {
            sample_rate_hz,
            frequencies_hz,
            bins: buffer,
        }
    }
    /// Cross-correlation `r[d] = sum_n x[n] * y[n + d]` for every lag
    /// `-(x.len()-1)..=(y.len()-1)`, computed through a zero-padded FFT.
    pub fn cross_correlation(&mut self, x: &[f64], y: &[f64]) -> Vec<(isize, f64)> {
        if x.is_empty() || y.is_empty() {
            return Vec::new();
        }
        let size = (x.len() + y.len() - 1).next_power_of_two();
        let forward = self.planner.plan_fft_forward(size);
        let inverse = self.planner.plan_fft_inverse(size);
        let mut bx: Vec<Complex64> = x.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        bx.resize(size, Complex64::new(0.0, 0.0));
        let mut by: Vec<Complex64> = y.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        by.resize(size, Complex64::new(0.0, 0.0));
        forward.process(&mut bx);
        forward.process(&mut by);
        for (cx, cy) in bx.iter_mut().zip(&by) {
            *cx = cx.conj() * cy;
        }
        inverse.process(&mut bx);
        let scale = 1.0 / size as f64;
        let min_lag = -(x.len() as isize - 1);
        let max_lag = y.len() as isize - 1;
        (min_lag..=max_lag)
            .map(|lag| {
                let idx = lag.rem_euclid(size as isize) as usize;
                (lag, bx[idx].re * scale)
            })
            .collect()
    }
}
impl Default for SpectrumBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;
    #[test]
    fn integer_period_sine_lands_in_one_bin() {
        let n = 200;
        let fs = 1000.0;
        let x: Vec<f64> = (0..n)
            .map(|i| 0.3 * (2.0 * PI * 10.0 * i as f64 / fs).sin())
            .collect();
        let spec = SpectrumBuilder::new().compute(&x, fs);
        assert_eq!(spec.len(), n);
        assert_eq!(spec.frequencies_hz[2], 10.0);
        assert!((spec.peak_amplitude(2) - 0.3).abs() < 1e-12);
        assert!(spec.bins[3].norm() < 1e-12);
    }
    #[test]
    fn cross_correlation_matches_direct_sum() {
        let x = [1.0, -2.0, 0.5, 3.0];
        let y = [0.25, 1.0, -1.0];
        let r = SpectrumBuilder::new().cross_correlation(&x, &y);
        assert_eq!(r.len(), x.len() + y.len() - 1);
        for (lag, value) in r {
            let direct: f64 = (0..x.len() as isize)
                .filter_map(|n| {
                    let m = n + lag;
                    (m >= 0 && (m as usize) < y.len()).then(|| x[n as usize] * y[m as usize])
                })
                .sum();
            assert!((value - direct).abs() < 1e-12, "lag {lag}");
        }
    }
}
