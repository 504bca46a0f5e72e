// src/drivers/mod.rs
// 仪器通道、激励规划、采集解码与阻抗计算
pub mod channel;
pub mod decoder;
pub mod error;
pub mod fft;
pub mod frontend;
pub mod impedance;
pub mod mls;
pub mod mock;
pub mod sequencer;
pub mod serial;
pub mod visa;
pub mod waveform;
// 公开导出常用类型，方便外部调用
pub use channel::{connect, handshake, InstrumentChannel};
pub use decoder::{decode_capture, DecodedSignal};
pub use error::EisError;
pub use fft::{ComplexSpectrum, SpectrumBuilder};
pub use frontend::{FrontEndMode, SerialTarget};
pub use impedance::{BinAmplitude, ChannelStats, DelayCorrection, Extraction, ImpedanceExtractor};
pub use mock::{CaptureRequest, SimulatedInstrument};
pub use sequencer::{AcquisitionConfig, ProtocolSequencer, SequencerState};
pub use serial::SerialChannel;
pub use visa::VisaChannel;
pub use waveform::{StimulusPlan, WaveformPlanner};
