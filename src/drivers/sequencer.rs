//! Drives the DAQ through one stimulus/capture cycle and programs the analog front end.
//!
//! ```text
//! Idle -> Configured -> Armed -> Acquiring -> Done | TimedOut
//!   ^                                                  |
//!   +-------------------- teardown --------------------+
//! ```
//! Teardown runs on every exit path of [`ProtocolSequencer::acquire`].
use std::thread;

use log::{debug, error, info, warn};

use crate::config::{DeviceModel, SequencerConfig};
use crate::drivers::frontend::{self, FrontEndMode, SerialTarget, CLOCK_PORT, DATA_PORT, STROBE_PORT};
use crate::drivers::waveform::StimulusPlan;
use crate::drivers::{EisError, InstrumentChannel};

const GENERATOR_OUTPUT: u16 = 201;
const BIAS_OUTPUT: u16 = 202;
/// Bound on `SYST:ERR?` reads per drain.
const MAX_ERROR_READS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Configured,
    Armed,
    Acquiring,
    Done,
    TimedOut,
}

/// Acquisition settings derived from a plan and the operator's channel ranges.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionConfig {
    pub record_len: usize,
    pub sample_rate_hz: f64,
    pub voltage_range: f64,
    pub current_range: f64,
    pub voltage_input: u16,
    pub current_input: u16,
}
impl AcquisitionConfig {
    pub fn for_plan(
        plan: &StimulusPlan,
        model: DeviceModel,
        voltage_range: f64,
        current_range: f64,
    ) -> Self {
        Self {
            record_len: plan.acquisition_len,
            sample_rate_hz: plan.acquisition_rate_hz,
            voltage_range,
            current_range,
            voltage_input: model.voltage_input(),
            current_input: model.current_input(),
        }
    }
    fn scan_list(&self) -> String {
        format!("(@{},{})", self.voltage_input, self.current_input)
    }
}

/// One entry of the instrument error queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstrumentError {
    pub code: i32,
    pub message: String,
}
impl InstrumentError {
    /// Parses `+0,"No error"` style responses.
    pub fn parse(response: &str) -> Result<Self, EisError> {
        let (code, message) = response.split_once(',').unwrap_or((response, ""));
        let code = code.trim().parse().map_err(|_| {
            EisError::Decode(format!("unexpected error-queue response {response:?}"))
        })?;
        Ok(Self {
            code,
            message: message.trim().trim_matches('"').to_string(),
        })
    }
}

pub struct ProtocolSequencer<'a, C: InstrumentChannel + ?Sized> {
    channel: &'a mut C,
    config: &'a SequencerConfig,
    state: SequencerState,
}
impl<'a, C: InstrumentChannel + ?Sized> ProtocolSequencer<'a, C> {
    pub fn new(channel: &'a mut C, config: &'a SequencerConfig) -> Self {
        Self {
            channel,
            config,
            state: SequencerState::Idle,
        }
    }
    pub fn state(&self) -> SequencerState {
        self.state
    }

    fn expect(&self, expected: SequencerState) -> Result<(), EisError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EisError::Sequence {
                expected,
                actual: self.state,
            })
        }
    }

    /// Reads the error queue until it reports code 0. Entries are logged; with `essential`
    /// the first non-zero entry is returned as an error.
    pub fn drain_errors(&mut self, essential: bool) -> Result<(), EisError> {
        let mut first = None;
        for _ in 0..MAX_ERROR_READS {
            let entry = InstrumentError::parse(&self.channel.query("SYST:ERR?")?)?;
            if entry.code == 0 {
                break;
            }
            warn!("instrument error {}: {}", entry.code, entry.message);
            first.get_or_insert(entry);
        }
        match first {
            Some(entry) if essential => Err(EisError::Command {
                code: entry.code,
                message: entry.message,
            }),
            _ => Ok(()),
        }
    }

    /// Configures the three bit-serial lines as outputs and parks every strobe high.
    pub fn init_side_channel(&mut self) -> Result<(), EisError> {
        for port in [STROBE_PORT, DATA_PORT, CLOCK_PORT] {
            self.channel.send(&format!("CONF:DIG:DIR OUTP,(@{port})"))?;
        }
        for target in [
            SerialTarget::Mode,
            SerialTarget::VoltageGain,
            SerialTarget::CurrentGain,
        ] {
            self.channel
                .send(&frontend::bit_command(true, target.strobe_bit(), STROBE_PORT))?;
        }
        self.drain_errors(false)
    }

    pub fn set_front_end_mode(&mut self, mode: FrontEndMode) -> Result<(), EisError> {
        info!("front end -> {mode:?}");
        self.shift(SerialTarget::Mode, mode.pattern())
    }

    pub fn set_voltage_gain(&mut self, gain: f64) -> Result<(), EisError> {
        let code = frontend::voltage_gain_code(gain)?;
        info!("voltage gain {gain} -> code {code}");
        self.shift(SerialTarget::VoltageGain, code)
    }

    pub fn set_current_gain(&mut self, gain: f64) -> Result<(), EisError> {
        let code = frontend::current_gain_code(gain)?;
        info!("current gain {gain} -> code {code}");
        self.shift(SerialTarget::CurrentGain, code)
    }

    fn shift(&mut self, target: SerialTarget, word: u8) -> Result<(), EisError> {
        for step in frontend::shift_sequence(target, word) {
            self.channel.send(&step.command)?;
            if step.settle && !self.config.bit_delay.is_zero() {
                thread::sleep(self.config.bit_delay);
            }
        }
        Ok(())
    }

    /// Uploads the pattern, programs the generator and the acquisition. `Idle -> Configured`.
    pub fn configure(
        &mut self,
        plan: &StimulusPlan,
        acquisition: &AcquisitionConfig,
    ) -> Result<(), EisError> {
        self.expect(SequencerState::Idle)?;
        let ch = &mut *self.channel;
        ch.send(&format!("ROUT:ENAB OFF,(@{GENERATOR_OUTPUT})"))?;
        ch.send(&format!("ROUT:ENAB OFF,(@{BIAS_OUTPUT})"))?;
        ch.send(&format!("ROUT:ENAB ON,(@{GENERATOR_OUTPUT})"))?;
        let payload = plan.packed();
        ch.write_block(&format!("DATA #8{:08}", payload.len()), &payload)?;
        ch.send("OUTP:WAV:ITER 1")?;
        ch.send(&format!("OUTP:WAV:SRAT {}", plan.generation_rate_hz))?;
        ch.send(&format!("APPL:USER (@{GENERATOR_OUTPUT})"))?;
        let rate = ch.query("OUTP:WAV:SRAT?")?;
        debug!("generator rate read back {rate}");
        ch.send(&format!(
            "SOUR:VOLT {}, (@{BIAS_OUTPUT})",
            self.config.bias_volts
        ))?;
        self.drain_errors(true)?;

        let ch = &mut *self.channel;
        ch.send("OUTP:TRIG:SOUR EXTD")?;
        ch.send("OUTP:TRIG:DTRG:POL POS")?;
        ch.send("OUTP:TRIG:TYP POST")?;
        ch.send(&format!("ACQ:POIN {}", acquisition.record_len))?;
        ch.send(&format!("ACQ:SRAT {}", acquisition.sample_rate_hz))?;
        ch.send("TRIG:SOUR NONE")?;
        ch.send("TRIG:SOUR EXTD")?;
        ch.send("TRIG:DTRG:POL POS")?;
        ch.send("TRIG:TYP POST")?;
        let scan = acquisition.scan_list();
        ch.send(&format!("ROUT:SCAN {scan}"))?;
        ch.send(&format!("ROUT:CHAN:STYP DIFF,(@{})", acquisition.current_input))?;
        ch.send(&format!("ROUT:CHAN:STYP DIFF,(@{})", acquisition.voltage_input))?;
        ch.send(&format!("ROUT:CHAN:POL BIP,{scan}"))?;
        ch.send(&format!(
            "ROUT:CHAN:RANG {},(@{})",
            acquisition.voltage_range, acquisition.voltage_input
        ))?;
        ch.send(&format!(
            "ROUT:CHAN:RANG {},(@{})",
            acquisition.current_range, acquisition.current_input
        ))?;
        let points = ch.query("ACQ:POIN?")?;
        let rate = ch.query("ACQ:SRAT?")?;
        debug!("acquisition {points} points at {rate} Hz");
        self.drain_errors(true)?;
        self.state = SequencerState::Configured;
        Ok(())
    }

    /// Single-shot digitize, output on, trigger high. `Configured -> Armed`.
    pub fn arm(&mut self) -> Result<(), EisError> {
        self.expect(SequencerState::Configured)?;
        self.channel.send("DIG")?;
        self.channel.send("OUTP ON")?;
        self.drain_errors(true)?;
        self.channel
            .send(&frontend::bit_command(true, 0, STROBE_PORT))?;
        self.state = SequencerState::Armed;
        Ok(())
    }

    /// Polls `WAV:COMP?` up to the configured bound. `Armed -> Acquiring -> Done | TimedOut`.
    /// A channel closed underneath the poll counts as a timeout.
    pub fn wait_complete(&mut self) -> Result<u64, EisError> {
        self.expect(SequencerState::Armed)?;
        self.state = SequencerState::Acquiring;
        let mut polls = 0u64;
        while polls < self.config.max_polls {
            polls += 1;
            let answer = match self.channel.query("WAV:COMP?") {
                Ok(answer) => answer,
                Err(EisError::ChannelClosed) => {
                    self.state = SequencerState::TimedOut;
                    return Err(EisError::Timeout { polls });
                }
                Err(err) => return Err(err),
            };
            if answer.trim() == "YES" {
                self.state = SequencerState::Done;
                debug!("capture complete after {polls} polls");
                return Ok(polls);
            }
            if !self.config.poll_interval.is_zero() {
                thread::sleep(self.config.poll_interval);
            }
        }
        self.state = SequencerState::TimedOut;
        Err(EisError::Timeout { polls })
    }

    /// Transfers the finished capture (block header included).
    pub fn read_capture(&mut self) -> Result<Vec<u8>, EisError> {
        self.expect(SequencerState::Done)?;
        self.channel.send("WAV:DATA?")?;
        self.channel.read_raw()
    }

    /// Trigger low, output off, outputs parked. Every command is attempted; the first
    /// failure is returned. Always leaves the sequencer `Idle`.
    pub fn teardown(&mut self) -> Result<(), EisError> {
        let commands = [
            frontend::bit_command(false, 0, STROBE_PORT),
            "OUTP OFF".to_string(),
            format!(
                "SOUR:VOLT {}, (@{GENERATOR_OUTPUT})",
                self.config.park_volts
            ),
            format!(
                "SOUR:VOLT {}, (@{BIAS_OUTPUT})",
                self.config.idle_bias_volts
            ),
        ];
        let mut first = None;
        for command in &commands {
            if let Err(err) = self.channel.send(command) {
                error!("teardown command {command:?} failed: {err}");
                first.get_or_insert(err);
            }
        }
        self.state = SequencerState::Idle;
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Full cycle for one plan. Teardown runs whatever happens; a teardown failure only
    /// surfaces when the cycle itself succeeded.
    pub fn acquire(
        &mut self,
        plan: &StimulusPlan,
        acquisition: &AcquisitionConfig,
    ) -> Result<Vec<u8>, EisError> {
        let result = self.run_cycle(plan, acquisition);
        let teardown = self.teardown();
        match (result, teardown) {
            (Ok(raw), Ok(())) => Ok(raw),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), _) => {
                error!("acquisition aborted: {err}");
                Err(err)
            }
        }
    }

    fn run_cycle(
        &mut self,
        plan: &StimulusPlan,
        acquisition: &AcquisitionConfig,
    ) -> Result<Vec<u8>, EisError> {
        self.configure(plan, acquisition)?;
        self.arm()?;
        self.wait_complete()?;
        self.read_capture()
    }
}
