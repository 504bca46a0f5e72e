// src/engine.rs
use chrono::{DateTime, Local};
use log::{error, info, warn};

use crate::config::EngineConfig;
use crate::drivers::{
    decode_capture, AcquisitionConfig, DelayCorrection, EisError, Extraction, FrontEndMode,
    ImpedanceExtractor, InstrumentChannel, ProtocolSequencer, StimulusPlan, WaveformPlanner,
};
use crate::recorder::ArtifactWriter;
use crate::status::StatusSink;
use crate::types::{RunParameters, RunState, RunStatus, StimulusFamily};

/// Everything one run reads, passed in explicitly so repeated runs stay independent.
pub struct RunContext<'a> {
    pub config: &'a EngineConfig,
    pub params: &'a RunParameters,
}
impl<'a> RunContext<'a> {
    pub fn new(config: &'a EngineConfig, params: &'a RunParameters) -> Self {
        Self { config, params }
    }
    fn grid(&self) -> Vec<f64> {
        match (&self.params.frequencies, self.params.signal_type) {
            (Some(custom), _) => custom.clone(),
            (None, StimulusFamily::Tone) => self.config.tone.frequencies_hz.clone(),
            (None, _) => self.config.multisine.frequencies_hz.clone(),
        }
    }
}

/// Result of one acquisition.
#[derive(Clone, Debug)]
pub struct MeasurementReport {
    pub repetition: u32,
    /// Set for tone sweeps.
    pub tone_hz: Option<f64>,
    pub extraction: Extraction,
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub family: StimulusFamily,
    pub start_time: DateTime<Local>,
    pub completed: u32,
    pub measurements: Vec<MeasurementReport>,
}

/// Runs a whole measurement: front end set-up, `repeats` repetitions, front end off.
///
/// A `running` record is published first and exactly one terminal record (`completed` or
/// `error`) last, whatever happens in between. Artifacts already written when a repetition
/// fails are left in place.
pub fn run_measurement<C, S>(
    channel: &mut C,
    ctx: &RunContext,
    status: &mut S,
) -> Result<RunReport, EisError>
where
    C: InstrumentChannel + ?Sized,
    S: StatusSink + ?Sized,
{
    let start_time = Local::now();
    status.publish(&RunStatus::running(start_time, 0))?;
    info!(
        "run started: {:?}, {} repetition(s)",
        ctx.params.signal_type, ctx.params.repeats
    );

    let mut report = RunReport {
        family: ctx.params.signal_type,
        start_time,
        completed: 0,
        measurements: Vec::new(),
    };
    let outcome = execute(channel, ctx, status, &mut report);

    let mut sequencer = ProtocolSequencer::new(channel, &ctx.config.sequencer);
    if let Err(err) = sequencer.set_front_end_mode(FrontEndMode::Off) {
        error!("could not switch the front end off: {err}");
    }

    let terminal = match &outcome {
        Ok(()) => RunStatus {
            status: RunState::Completed,
            completed: report.completed,
            start_time,
            message: None,
        },
        Err(err) => RunStatus {
            status: RunState::Error,
            completed: report.completed,
            start_time,
            message: Some(err.to_string()),
        },
    };
    if let Err(err) = status.publish(&terminal) {
        error!("could not publish terminal status {:?}: {err}", terminal.status);
    }
    match outcome {
        Ok(()) => {
            info!("run completed ({} repetition(s))", report.completed);
            Ok(report)
        }
        Err(err) => {
            error!("run failed after {} repetition(s): {err}", report.completed);
            Err(err)
        }
    }
}

fn execute<C, S>(
    channel: &mut C,
    ctx: &RunContext,
    status: &mut S,
    report: &mut RunReport,
) -> Result<(), EisError>
where
    C: InstrumentChannel + ?Sized,
    S: StatusSink + ?Sized,
{
    let params = ctx.params;
    let config = ctx.config;
    params.validate()?;
    let writer = ArtifactWriter::new(&config.output_dir, config.clear_previous_artifacts)?;
    let mut sequencer = ProtocolSequencer::new(channel, &config.sequencer);
    sequencer.init_side_channel()?;
    sequencer.set_front_end_mode(params.board_mode.into())?;
    if let Some(gain) = params.gain_v {
        sequencer.set_voltage_gain(gain)?;
    }
    if let Some(gain) = params.gain_i {
        sequencer.set_current_gain(gain)?;
    }

    let mut planner = WaveformPlanner::new(config, config.seed);
    let mut extractor = ImpedanceExtractor::new(config.calibration);
    let grid = ctx.grid();
    let mut step = Step {
        sequencer: &mut sequencer,
        extractor: &mut extractor,
        writer: &writer,
        ctx,
    };
    let fixed_plan = match params.signal_type {
        StimulusFamily::Tone => None,
        StimulusFamily::Multisine => Some(planner.multisine(&grid, params.dynamic_offset)?),
        StimulusFamily::Mls => Some(planner.mls(params.mls_order, params.mls_repeats)?),
    };

    for repetition in 0..params.repeats {
        match &fixed_plan {
            Some(plan) => {
                let extraction = step.measure(plan, repetition, None)?;
                report.measurements.push(MeasurementReport {
                    repetition,
                    tone_hz: None,
                    extraction,
                });
            }
            None => {
                for &frequency in &grid {
                    let plan = planner.tone(frequency)?;
                    let extraction = step.measure(&plan, repetition, Some(frequency))?;
                    info!("{frequency} Hz done");
                    report.measurements.push(MeasurementReport {
                        repetition,
                        tone_hz: Some(frequency),
                        extraction,
                    });
                }
            }
        }
        report.completed = repetition + 1;
        if let Err(err) = status.publish(&RunStatus::running(report.start_time, report.completed)) {
            warn!("progress update failed: {err}");
        }
    }
    Ok(())
}

/// One stimulus -> capture -> artifacts pass.
struct Step<'s, 'a, C: InstrumentChannel + ?Sized> {
    sequencer: &'s mut ProtocolSequencer<'a, C>,
    extractor: &'s mut ImpedanceExtractor,
    writer: &'s ArtifactWriter,
    ctx: &'s RunContext<'s>,
}
impl<'s, 'a, C: InstrumentChannel + ?Sized> Step<'s, 'a, C> {
    fn measure(
        &mut self,
        plan: &StimulusPlan,
        repetition: u32,
        tone_hz: Option<f64>,
    ) -> Result<Extraction, EisError> {
        let params = self.ctx.params;
        let acquisition = AcquisitionConfig::for_plan(
            plan,
            self.ctx.config.device,
            params.a_daq1,
            params.a_daq2,
        );
        let raw = self.sequencer.acquire(plan, &acquisition)?;
        let signal = decode_capture(&raw, plan.acquisition_rate_hz, params.a_daq1, params.a_daq2)?;
        self.writer
            .write_time_series(plan.family, repetition, &signal, tone_hz)?;
        let correction = match plan.family {
            StimulusFamily::Mls => DelayCorrection::CrossCorrelation,
            StimulusFamily::Tone | StimulusFamily::Multisine => DelayCorrection::HalfSample,
        };
        let extraction = self.extractor.extract(
            &signal,
            params.a_daq1,
            params.a_daq2,
            &plan.frequencies_hz,
            correction,
        )?;
        self.writer
            .write_impedance(plan.family, repetition, &extraction.impedance)?;
        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationConfig;
    use crate::drivers::SimulatedInstrument;
    use crate::types::BoardMode;
    use std::sync::mpsc;
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.output_dir = dir.to_path_buf();
        config.calibration = CalibrationConfig::identity();
        config.sequencer.bit_delay = Duration::ZERO;
        config.sequencer.max_polls = 20;
        config
    }

    fn params(family: StimulusFamily, repeats: u32, frequencies: Option<Vec<f64>>) -> RunParameters {
        RunParameters {
            board_mode: BoardMode::Potentiostat,
            signal_type: family,
            gain_v: Some(1.0),
            gain_i: None,
            repeats,
            a_daq1: 1.0,
            a_daq2: 1.0,
            dynamic_offset: 0.0,
            frequencies,
            mls_order: 7,
            mls_repeats: 4,
        }
    }

    fn assert_close(actual: f64, expected: f64, rel: f64) {
        assert!(
            (actual - expected).abs() <= rel * expected.abs(),
            "{actual} vs {expected}"
        );
    }

    #[test]
    fn tone_sweep_measures_dummy_cell() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let params = params(StimulusFamily::Tone, 1, Some(vec![10.0, 20.0]));
        let ctx = RunContext::new(&config, &params);
        let mut sim = SimulatedInstrument::new();
        let (mut tx, rx) = mpsc::channel::<RunStatus>();
        let report = run_measurement(&mut sim, &ctx, &mut tx).unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.measurements.len(), 2);
        for m in &report.measurements {
            let z = m.extraction.impedance[0];
            assert_eq!(Some(z.frequency_hz), m.tone_hz);
            assert_close(z.real, 10.0, 0.01);
            assert!(z.imag.abs() < 0.1, "{z:?}");
        }
        let z_file = std::fs::read_to_string(dir.path().join("z_vector_single_0.csv")).unwrap();
        assert_eq!(z_file.lines().count(), 3);
        assert!(dir.path().join("sig_V_I_single_0.csv").exists());

        let statuses: Vec<RunStatus> = rx.try_iter().collect();
        assert_eq!(statuses.first().unwrap().status, RunState::Running);
        assert_eq!(statuses.iter().filter(|s| s.is_terminal()).count(), 1);
        let last = statuses.last().unwrap();
        assert_eq!(last.status, RunState::Completed);
        assert_eq!(last.completed, 1);
    }

    #[test]
    fn multisine_repetitions_write_one_pair_each() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.multisine.generation_rate_hz = 2000.0;
        config.multisine.acquisition_rate_hz = 1000.0;
        config.multisine.duration_s = 4.0;
        let params = params(StimulusFamily::Multisine, 2, Some(vec![1.0, 2.0, 5.0, 10.0]));
        let ctx = RunContext::new(&config, &params);
        let mut sim = SimulatedInstrument::new();
        let (mut tx, _rx) = mpsc::channel::<RunStatus>();
        let report = run_measurement(&mut sim, &ctx, &mut tx).unwrap();
        assert_eq!(report.completed, 2);
        for repetition in 0..2 {
            let z = std::fs::read_to_string(dir.path().join(format!("z_vector_multi_{repetition}.csv")))
                .unwrap();
            assert_eq!(z.lines().count(), 5);
        }
        for point in &report.measurements[0].extraction.impedance {
            assert_close(point.real, 10.0, 0.02);
        }
    }

    #[test]
    fn mls_run_estimates_channel_delay() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let params = params(StimulusFamily::Mls, 1, None);
        let ctx = RunContext::new(&config, &params);
        let mut sim = SimulatedInstrument::new();
        let (mut tx, _rx) = mpsc::channel::<RunStatus>();
        let report = run_measurement(&mut sim, &ctx, &mut tx).unwrap();
        let extraction = &report.measurements[0].extraction;
        let lag = extraction.delay_samples.unwrap();
        assert!(lag == 0 || lag == -1, "lag {lag}");
        let first = extraction.impedance[0];
        let magnitude = first.real.hypot(first.imag);
        assert_close(magnitude, 10.0, 0.02);
        assert!(dir.path().join("z_vector_mls_0.csv").exists());
    }

    #[test]
    fn timeout_publishes_error_and_switches_front_end_off() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let params = params(StimulusFamily::Tone, 2, Some(vec![10.0]));
        let ctx = RunContext::new(&config, &params);
        let mut sim = SimulatedInstrument::new().completing_after(None);
        let (mut tx, rx) = mpsc::channel::<RunStatus>();
        let err = run_measurement(&mut sim, &ctx, &mut tx).unwrap_err();
        assert!(matches!(err, EisError::Timeout { polls: 20 }));

        let statuses: Vec<RunStatus> = rx.try_iter().collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[1].status, RunState::Error);
        assert_eq!(statuses[1].completed, 0);
        assert!(statuses[1].message.as_deref().unwrap().contains("20 polls"));

        let cmds = sim.commands();
        let mode_strobes = cmds
            .iter()
            .filter(|c| *c == "SOUR:DIG:DATA:BIT 0, 1,(@501)")
            .count();
        assert_eq!(mode_strobes, 2);
        assert_eq!(cmds.last().unwrap(), "SOUR:DIG:DATA:BIT 1, 1,(@501)");
        assert!(cmds.iter().any(|c| c == "OUTP OFF"));
    }

    #[test]
    fn invalid_parameters_still_end_with_an_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let params = params(StimulusFamily::Tone, 0, None);
        let ctx = RunContext::new(&config, &params);
        let mut sim = SimulatedInstrument::new();
        let (mut tx, rx) = mpsc::channel::<RunStatus>();
        assert!(matches!(
            run_measurement(&mut sim, &ctx, &mut tx),
            Err(EisError::Config(_))
        ));
        let last = rx.try_iter().last().unwrap();
        assert_eq!(last.status, RunState::Error);
    }
}
