use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use crate::drivers::channel::read_definite_block;
use crate::drivers::{EisError, InstrumentChannel};

const DEFAULT_BAUD: u32 = 115_200;
const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// SCPI over a plain serial line.
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}
impl SerialChannel {
    /// `spec` is `<port>` or `<port>@<baud>`.
    pub fn open(spec: &str) -> Result<Self, EisError> {
        let (name, baud) = parse_spec(spec)?;
        let port = serialport::new(name, baud).timeout(IO_TIMEOUT).open()?;
        Ok(Self { port })
    }
}

fn parse_spec(spec: &str) -> Result<(&str, u32), EisError> {
    match spec.rsplit_once('@') {
        Some((name, baud)) => {
            let baud = baud
                .parse()
                .map_err(|_| EisError::Connection(format!("bad baud rate in {spec:?}")))?;
            Ok((name, baud))
        }
        None => Ok((spec, DEFAULT_BAUD)),
    }
}

/// A port that stopped answering or went away reads as a closed channel.
fn closed_or(err: EisError) -> EisError {
    match err {
        EisError::Io(io)
            if matches!(
                io.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ) =>
        {
            EisError::ChannelClosed
        }
        other => other,
    }
}

impl InstrumentChannel for SerialChannel {
    fn send(&mut self, command: &str) -> Result<(), EisError> {
        self.write_parts(&[command.as_bytes(), b"\n"]).map_err(closed_or)
    }
    fn write_block(&mut self, header: &str, payload: &[u8]) -> Result<(), EisError> {
        self.write_parts(&[header.as_bytes(), payload]).map_err(closed_or)
    }
    fn read_text(&mut self) -> Result<String, EisError> {
        self.read_line().map_err(closed_or)
    }
    fn read_raw(&mut self) -> Result<Vec<u8>, EisError> {
        read_definite_block(&mut self.port).map_err(closed_or)
    }
}

impl SerialChannel {
    fn write_parts(&mut self, parts: &[&[u8]]) -> Result<(), EisError> {
        for part in parts {
            self.port.write_all(part)?;
        }
        self.port.flush()?;
        Ok(())
    }
    fn read_line(&mut self) -> Result<String, EisError> {
        loop {
            let mut line = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                self.port.read_exact(&mut byte)?;
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
            let text = String::from_utf8_lossy(&line).trim().to_string();
            // A bare terminator left over from a preceding binary block.
            if !text.is_empty() {
                return Ok(text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn parses_port_and_baud() {
        assert_eq!(parse_spec("/dev/ttyUSB0@9600").unwrap(), ("/dev/ttyUSB0", 9600));
        assert_eq!(parse_spec("COM3").unwrap(), ("COM3", DEFAULT_BAUD));
        assert!(matches!(parse_spec("COM3@fast"), Err(EisError::Connection(_))));
    }

    #[test]
    fn dead_port_errors_read_as_closed_channel() {
        for kind in [ErrorKind::TimedOut, ErrorKind::BrokenPipe, ErrorKind::UnexpectedEof] {
            let err = closed_or(EisError::Io(std::io::Error::from(kind)));
            assert!(matches!(err, EisError::ChannelClosed), "{kind:?}");
        }
        let err = closed_or(EisError::Io(std::io::Error::from(ErrorKind::InvalidData)));
        assert!(matches!(err, EisError::Io(_)));
        assert!(matches!(closed_or(EisError::Decode("x".into())), EisError::Decode(_)));
    }
}
