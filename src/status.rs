// src/status.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use log::debug;

use crate::drivers::EisError;
use crate::types::RunStatus;

/// Destination of run progress records. Observers only ever see whole records.
pub trait StatusSink {
    fn publish(&mut self, status: &RunStatus) -> Result<(), EisError>;
}

/// `measurement_status.json` polled by the dashboard.
pub struct JsonStatusFile {
    path: PathBuf,
}
impl JsonStatusFile {
    pub const DEFAULT_NAME: &'static str = "measurement_status.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn read(&self) -> Result<RunStatus, EisError> {
        let text = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
impl StatusSink for JsonStatusFile {
    fn publish(&mut self, status: &RunStatus) -> Result<(), EisError> {
        // Write beside the target then rename, so a reader never sees a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(status)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("status -> {:?} ({} done)", status.status, status.completed);
        Ok(())
    }
}

/// In-process observers receive every record over a channel. A dropped receiver is not
/// an error for the run.
impl StatusSink for Sender<RunStatus> {
    fn publish(&mut self, status: &RunStatus) -> Result<(), EisError> {
        self.send(status.clone()).ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunState;
    use chrono::Local;
    use std::sync::mpsc;

    #[test]
    fn json_file_round_trips_latest_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonStatusFile::new(dir.path().join(JsonStatusFile::DEFAULT_NAME));
        let start = Local::now();
        sink.publish(&RunStatus::running(start, 0)).unwrap();
        let mut done = RunStatus::running(start, 3);
        done.status = RunState::Completed;
        sink.publish(&done).unwrap();
        let back = sink.read().unwrap();
        assert_eq!(back.status, RunState::Completed);
        assert_eq!(back.completed, 3);
        assert_eq!(back.start_time, start);
        assert!(!dir.path().join("measurement_status.json.tmp").exists());
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (mut tx, rx) = mpsc::channel::<RunStatus>();
        tx.publish(&RunStatus::running(Local::now(), 1)).unwrap();
        assert_eq!(rx.recv().unwrap().completed, 1);
        drop(rx);
        assert!(tx.publish(&RunStatus::running(Local::now(), 2)).is_ok());
    }
}
