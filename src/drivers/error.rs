use thiserror::Error;
#[derive(Debug, Error)]
pub enum EisError {
    #[error("instrument unreachable: {0}")]
    Connection(String),
    #[error("instrument rejected command (code {code}): {message}")]
    Command { code: i32, message: String },
    #[error("acquisition did not complete after {polls} polls")]
    Timeout { polls: u64 },
    #[error("malformed capture: {0}")]
    Decode(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("sequencer in state {actual:?}, expected {expected:?}")]
    Sequence {
        expected: crate::drivers::SequencerState,
        actual: crate::drivers::SequencerState,
    },
    #[error("instrument channel closed")]
    ChannelClosed,
    #[error("VISA call {call} failed with status {status:#010x}")]
    Visa { call: &'static str, status: i32 },
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}
