//! In-process stand-in for the DAQ, for tests and dry runs without hardware.
//!
//! It keeps the subset of instrument state the measurement flow depends on (record length,
//! rates, ranges, uploaded pattern, trigger line) and synthesizes a capture when the
//! waveform is read back.
use std::collections::VecDeque;

use crate::config::DeviceModel;
use crate::drivers::decoder::CAPTURE_HEADER_LEN;
use crate::drivers::waveform::unpack_codes;
use crate::drivers::{EisError, InstrumentChannel};

/// Output full scale of the analog outputs (V).
const OUTPUT_FULL_SCALE: f64 = 10.0;
const VI_ERROR_TMO: i32 = -1_073_807_339;

/// Settings the simulator was programmed with when a capture is requested.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureRequest {
    pub record_len: usize,
    pub sample_rate_hz: f64,
    pub generation_rate_hz: f64,
    pub voltage_range: f64,
    pub current_range: f64,
    /// Uploaded pattern converted back to output volts.
    pub stimulus: Vec<f64>,
}
impl CaptureRequest {
    /// Stimulus value at `t` seconds after the trigger, linearly interpolated; zero after
    /// the single-shot pattern has finished.
    pub fn stimulus_at(&self, t: f64) -> f64 {
        if self.stimulus.is_empty() || self.generation_rate_hz <= 0.0 {
            return 0.0;
        }
        let pos = t * self.generation_rate_hz;
        let idx = pos.floor() as usize;
        let frac = pos - idx as f64;
        let a = self.stimulus.get(idx).copied().unwrap_or(0.0);
        let b = self.stimulus.get(idx + 1).copied().unwrap_or(0.0);
        a + (b - a) * frac
    }
}

type Synthesizer = Box<dyn FnMut(&CaptureRequest) -> (Vec<f64>, Vec<f64>)>;

pub struct SimulatedInstrument {
    model: DeviceModel,
    commands: Vec<String>,
    blocks: Vec<Vec<u8>>,
    pending_text: VecDeque<String>,
    pending_raw: Option<Vec<u8>>,
    error_queue: VecDeque<String>,
    rejections: Vec<(String, i32, String)>,
    record_len: usize,
    sample_rate_hz: f64,
    generation_rate_hz: f64,
    ranges: Vec<f64>,
    digitizing: bool,
    triggered: bool,
    polls: u64,
    complete_after: Option<u64>,
    close_after_polls: Option<u64>,
    closed: bool,
    synthesizer: Synthesizer,
}
impl SimulatedInstrument {
    /// A U2331A wired to a purely resistive dummy cell of 10 ohm behind a unity shunt
    /// amplifier, with the current channel sampled half a sample after the voltage channel.
    pub fn new() -> Self {
        Self::with_synthesizer(resistive_cell(10.0))
    }
    pub fn with_synthesizer(
        synthesizer: impl FnMut(&CaptureRequest) -> (Vec<f64>, Vec<f64>) + 'static,
    ) -> Self {
        Self {
            model: DeviceModel::U2331A,
            commands: Vec::new(),
            blocks: Vec::new(),
            pending_text: VecDeque::new(),
            pending_raw: None,
            error_queue: VecDeque::new(),
            rejections: Vec::new(),
            record_len: 1000,
            sample_rate_hz: 1000.0,
            generation_rate_hz: 0.0,
            ranges: Vec::new(),
            digitizing: false,
            triggered: false,
            polls: 0,
            complete_after: Some(3),
            close_after_polls: None,
            closed: false,
            synthesizer: Box::new(synthesizer),
        }
    }
    pub fn with_model(mut self, model: DeviceModel) -> Self {
        self.model = model;
        self
    }
    /// `None` keeps answering `NO` to completion polls forever.
    pub fn completing_after(mut self, polls: Option<u64>) -> Self {
        self.complete_after = polls;
        self
    }
    /// Simulates the caller closing the channel while the capture is being polled.
    pub fn closing_after_polls(mut self, polls: u64) -> Self {
        self.close_after_polls = Some(polls);
        self
    }
    /// Queues an instrument error whenever a command starting with `prefix` is received.
    pub fn rejecting(mut self, prefix: &str, code: i32, message: &str) -> Self {
        self.rejections
            .push((prefix.to_string(), code, message.to_string()));
        self
    }
    pub fn commands(&self) -> &[String] {
        &self.commands
    }
    pub fn blocks(&self) -> &[Vec<u8>] {
        &self.blocks
    }
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn check_open(&self) -> Result<(), EisError> {
        if self.closed {
            Err(EisError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn apply(&mut self, command: &str) {
        for (prefix, code, message) in &self.rejections {
            if command.starts_with(prefix.as_str()) {
                self.error_queue.push_back(format!("{code},\"{message}\""));
            }
        }
        let (head, args) = command.split_once(' ').unwrap_or((command, ""));
        match head {
            "*IDN?" => self.reply(format!(
                "Agilent Technologies,{:?},SIM00001,1.0",
                self.model
            )),
            "*RST;*CLS" => {
                self.error_queue.clear();
                self.digitizing = false;
                self.triggered = false;
            }
            "SYST:ERR?" => {
                let entry = self
                    .error_queue
                    .pop_front()
                    .unwrap_or_else(|| "+0,\"No error\"".to_string());
                self.reply(entry);
            }
            "ACQ:POIN" => {
                if let Ok(n) = args.trim().parse() {
                    self.record_len = n;
                }
            }
            "ACQ:SRAT" => {
                if let Ok(rate) = args.trim().parse() {
                    self.sample_rate_hz = rate;
                }
            }
            "OUTP:WAV:SRAT" => {
                if let Ok(rate) = args.trim().parse() {
                    self.generation_rate_hz = rate;
                }
            }
            "ROUT:SCAN" => self.ranges.clear(),
            "ROUT:CHAN:RANG" => {
                if let Some(Ok(range)) = args.split(',').next().map(|a| a.trim().parse()) {
                    self.ranges.push(range);
                }
            }
            "ACQ:POIN?" => self.reply(self.record_len.to_string()),
            "ACQ:SRAT?" => self.reply(self.sample_rate_hz.to_string()),
            "OUTP:WAV:SRAT?" => self.reply(self.generation_rate_hz.to_string()),
            "DIG" => {
                self.digitizing = true;
                self.triggered = false;
                self.polls = 0;
            }
            "SOUR:DIG:DATA:BIT" if args == "1, 0,(@501)" => self.triggered = self.digitizing,
            "WAV:COMP?" => {
                self.polls += 1;
                let done = self.triggered
                    && self.complete_after.map_or(false, |after| self.polls > after);
                self.reply(if done { "YES" } else { "NO" }.to_string());
            }
            "WAV:DATA?" => {
                let capture = self.synthesize();
                self.pending_raw = Some(capture);
            }
            _ if head.ends_with('?') => self.reply("0".to_string()),
            _ => {}
        }
    }

    fn reply(&mut self, text: String) {
        self.pending_text.push_back(text);
    }

    fn synthesize(&mut self) -> Vec<u8> {
        let voltage_range = self.ranges.first().copied().unwrap_or(10.0);
        let current_range = self.ranges.get(1).copied().unwrap_or(voltage_range);
        let bits = self.model.output_bits();
        let half = (1u32 << (bits - 1)) as f64;
        let stimulus = self
            .blocks
            .last()
            .map(|block| {
                unpack_codes(block)
                    .into_iter()
                    .map(|code| (code as f64 - half) / half * OUTPUT_FULL_SCALE)
                    .collect()
            })
            .unwrap_or_default();
        let request = CaptureRequest {
            record_len: self.record_len,
            sample_rate_hz: self.sample_rate_hz,
            generation_rate_hz: self.generation_rate_hz,
            voltage_range,
            current_range,
            stimulus,
        };
        let (voltage, current) = (self.synthesizer)(&request);
        self.digitizing = false;
        encode_capture(&voltage, &current, voltage_range, current_range)
    }
}
impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentChannel for SimulatedInstrument {
    fn send(&mut self, command: &str) -> Result<(), EisError> {
        self.check_open()?;
        if command == "WAV:COMP?" {
            if let Some(limit) = self.close_after_polls {
                if self.polls >= limit {
                    self.closed = true;
                    return Err(EisError::ChannelClosed);
                }
            }
        }
        self.commands.push(command.to_string());
        self.apply(command);
        Ok(())
    }
    fn write_block(&mut self, header: &str, payload: &[u8]) -> Result<(), EisError> {
        self.check_open()?;
        self.commands.push(header.to_string());
        self.apply(header);
        self.blocks.push(payload.to_vec());
        Ok(())
    }
    fn read_text(&mut self) -> Result<String, EisError> {
        self.check_open()?;
        self.pending_text.pop_front().ok_or(EisError::Visa {
            call: "viRead",
            status: VI_ERROR_TMO,
        })
    }
    fn read_raw(&mut self) -> Result<Vec<u8>, EisError> {
        self.check_open()?;
        self.pending_raw.take().ok_or(EisError::Visa {
            call: "viRead",
            status: VI_ERROR_TMO,
        })
    }
}

/// Dummy cell: `v(t)` is the stimulus, the current channel reads `v / ohms` half a sample
/// later, the way the multiplexed ADC samples its second channel.
pub fn resistive_cell(ohms: f64) -> impl FnMut(&CaptureRequest) -> (Vec<f64>, Vec<f64>) {
    move |req| {
        let ts = 1.0 / req.sample_rate_hz;
        let voltage = (0..req.record_len)
            .map(|n| req.stimulus_at(n as f64 * ts))
            .collect();
        let current = (0..req.record_len)
            .map(|n| req.stimulus_at((n as f64 + 0.5) * ts) / ohms)
            .collect();
        (voltage, current)
    }
}

/// Builds the raw `WAV:DATA?` answer for physical channel values: a `#8` block header
/// followed by interleaved little-endian `i16` pairs, current channel inverted.
pub fn encode_capture(
    voltage: &[f64],
    current: &[f64],
    voltage_range: f64,
    current_range: f64,
) -> Vec<u8> {
    let to_code = |value: f64, range: f64| (value / range * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
    let pairs = voltage.len().min(current.len());
    let mut raw = Vec::with_capacity(CAPTURE_HEADER_LEN + 4 * pairs);
    raw.extend_from_slice(format!("#8{:08}", 4 * pairs).as_bytes());
    for (v, i) in voltage.iter().zip(current) {
        raw.extend_from_slice(&to_code(*v, voltage_range).to_le_bytes());
        raw.extend_from_slice(&to_code(-*i, current_range).to_le_bytes());
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::decode_capture;

    #[test]
    fn encoded_capture_decodes_to_the_same_values() {
        let v = [1.0, -0.5, 0.25];
        let i = [0.1, 0.2, -0.3];
        let raw = encode_capture(&v, &i, 2.0, 1.0);
        let sig = decode_capture(&raw, 100.0, 2.0, 1.0).unwrap();
        for (a, b) in sig.voltage.iter().zip(&v) {
            assert!((a - b).abs() < 1e-4);
        }
        for (a, b) in sig.current.iter().zip(&i) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn completes_only_after_trigger() {
        let mut sim = SimulatedInstrument::new().completing_after(Some(0));
        assert_eq!(sim.query("WAV:COMP?").unwrap(), "NO");
        sim.send("DIG").unwrap();
        assert_eq!(sim.query("WAV:COMP?").unwrap(), "NO");
        sim.send("SOUR:DIG:DATA:BIT 1, 0,(@501)").unwrap();
        assert_eq!(sim.query("WAV:COMP?").unwrap(), "YES");
    }

    #[test]
    fn rejected_commands_fill_the_error_queue() {
        let mut sim = SimulatedInstrument::new().rejecting("ACQ:SRAT", -222, "Data out of range");
        sim.send("ACQ:SRAT 1e9").unwrap();
        assert_eq!(sim.query("SYST:ERR?").unwrap(), "-222,\"Data out of range\"");
        assert_eq!(sim.query("SYST:ERR?").unwrap(), "+0,\"No error\"");
    }

    #[test]
    fn closed_channel_refuses_io() {
        let mut sim = SimulatedInstrument::new();
        sim.close();
        assert!(matches!(sim.send("*IDN?"), Err(EisError::ChannelClosed)));
        assert!(matches!(sim.read_raw(), Err(EisError::ChannelClosed)));
    }

    #[test]
    fn stimulus_is_interpolated_between_pattern_samples() {
        let req = CaptureRequest {
            record_len: 0,
            sample_rate_hz: 1.0,
            generation_rate_hz: 2.0,
            voltage_range: 1.0,
            current_range: 1.0,
            stimulus: vec![0.0, 1.0, 3.0],
        };
        assert_eq!(req.stimulus_at(0.25), 0.5);
        assert_eq!(req.stimulus_at(0.75), 2.0);
        assert_eq!(req.stimulus_at(5.0), 0.0);
    }
}
