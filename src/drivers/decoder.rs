use crate::drivers::EisError;

/// Length of the `#8nnnnnnnn` block header in front of every capture.
pub const CAPTURE_HEADER_LEN: usize = 10;
const FULL_SCALE: f64 = 32768.0;

/// Voltage/current pair in physical units (V at the ADC input).
#[derive(Clone, Debug)]
pub struct DecodedSignal {
    pub sample_rate_hz: f64,
    pub voltage: Vec<f64>,
    pub current: Vec<f64>,
}
impl DecodedSignal {
    pub fn len(&self) -> usize {
        self.voltage.len()
    }
    pub fn is_empty(&self) -> bool {
        self.voltage.is_empty()
    }
    pub fn duration_seconds(&self) -> f64 {
        self.len() as f64 / self.sample_rate_hz
    }
    pub fn time_base(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len()).map(move |n| n as f64 / self.sample_rate_hz)
    }
}

/// Splits an interleaved two-channel capture. Channel B is sign-inverted: the current
/// amplifier output is wired with reversed polarity on every front end revision.
pub fn decode_capture(
    raw: &[u8],
    sample_rate_hz: f64,
    voltage_range: f64,
    current_range: f64,
) -> Result<DecodedSignal, EisError> {
    if raw.len() < CAPTURE_HEADER_LEN {
        return Err(EisError::Decode(format!(
            "capture of {} bytes is shorter than its header",
            raw.len()
        )));
    }
    let body = &raw[CAPTURE_HEADER_LEN..];
    if body.len() % 4 != 0 {
        return Err(EisError::Decode(format!(
            "{} payload bytes is not a whole number of sample pairs",
            body.len()
        )));
    }
    let v_scale = voltage_range / FULL_SCALE;
    let i_scale = current_range / FULL_SCALE;
    let pairs = body.len() / 4;
    let mut voltage = Vec::with_capacity(pairs);
    let mut current = Vec::with_capacity(pairs);
    for frame in body.chunks_exact(4) {
        let a = i16::from_le_bytes([frame[0], frame[1]]);
        let b = i16::from_le_bytes([frame[2], frame[3]]);
        voltage.push(a as f64 * v_scale);
        current.push(-(b as f64) * i_scale);
    }
    Ok(DecodedSignal {
        sample_rate_hz,
        voltage,
        current,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    fn capture(samples: &[i16]) -> Vec<u8> {
        let mut raw = format!("#8{:08}", samples.len() * 2).into_bytes();
        for s in samples {
            raw.extend_from_slice(&s.to_le_bytes());
        }
        raw
    }
    #[test]
    fn deinterleaves_and_scales() {
        let raw = capture(&[16384, -16384, -32768, 8192]);
        let sig = decode_capture(&raw, 1000.0, 10.0, 5.0).unwrap();
        assert_eq!(sig.voltage, vec![5.0, -10.0]);
        assert_eq!(sig.current, vec![2.5, -1.25]);
        assert_eq!(sig.len(), 2);
        assert!((sig.duration_seconds() - 0.002).abs() < 1e-15);
    }
    #[test]
    fn odd_payload_is_rejected() {
        let mut raw = capture(&[1, 2, 3, 4]);
        raw.pop();
        assert!(matches!(
            decode_capture(&raw, 1000.0, 10.0, 10.0),
            Err(EisError::Decode(_))
        ));
        let raw = capture(&[1, 2, 3]);
        assert!(decode_capture(&raw, 1000.0, 10.0, 10.0).is_err());
        assert!(decode_capture(b"#8", 1000.0, 10.0, 10.0).is_err());
    }
    #[test]
    fn empty_payload_decodes_to_nothing() {
        let sig = decode_capture(&capture(&[]), 1000.0, 10.0, 10.0).unwrap();
        assert!(sig.is_empty());
    }
}
