use std::io::Read;

use log::info;

use crate::drivers::{EisError, SerialChannel, SimulatedInstrument, VisaChannel};

/// Minimal capability surface of a message-based instrument. Only one request may be in
/// flight; implementations are not shared across threads.
pub trait InstrumentChannel {
    /// Writes one newline-terminated command.
    fn send(&mut self, command: &str) -> Result<(), EisError>;
    /// Writes `header` immediately followed by `payload`, with no terminator.
    fn write_block(&mut self, header: &str, payload: &[u8]) -> Result<(), EisError>;
    /// Reads one response line with the terminator stripped.
    fn read_text(&mut self) -> Result<String, EisError>;
    /// Reads one complete binary response, block header included.
    fn read_raw(&mut self) -> Result<Vec<u8>, EisError>;

    fn query(&mut self, command: &str) -> Result<String, EisError> {
        self.send(command)?;
        self.read_text()
    }
}

impl<T: InstrumentChannel + ?Sized> InstrumentChannel for Box<T> {
    fn send(&mut self, command: &str) -> Result<(), EisError> {
        (**self).send(command)
    }
    fn write_block(&mut self, header: &str, payload: &[u8]) -> Result<(), EisError> {
        (**self).write_block(header, payload)
    }
    fn read_text(&mut self) -> Result<String, EisError> {
        (**self).read_text()
    }
    fn read_raw(&mut self) -> Result<Vec<u8>, EisError> {
        (**self).read_raw()
    }
}

/// Resource prefix selecting the serial transport, e.g. `serial:/dev/ttyUSB0@115200`.
pub const SERIAL_PREFIX: &str = "serial:";

/// Resource name of the in-process simulator (10 ohm dummy cell).
pub const SIM_RESOURCE: &str = "sim";

/// Opens `resource`, checks that something answers `*IDN?` and resets it.
/// Every failure on the way is reported as a connection error.
pub fn connect(resource: &str) -> Result<(Box<dyn InstrumentChannel>, String), EisError> {
    let opened: Result<Box<dyn InstrumentChannel>, EisError> =
        if resource == SIM_RESOURCE {
            Ok(Box::new(SimulatedInstrument::new()))
        } else if let Some(spec) = resource.strip_prefix(SERIAL_PREFIX) {
            SerialChannel::open(spec).map(|c| Box::new(c) as Box<dyn InstrumentChannel>)
        } else {
            VisaChannel::open(resource).map(|c| Box::new(c) as Box<dyn InstrumentChannel>)
        };
    let mut channel = opened.map_err(|e| as_connection_error(resource, e))?;
    let identity = handshake(&mut channel).map_err(|e| as_connection_error(resource, e))?;
    Ok((channel, identity))
}

fn as_connection_error(resource: &str, err: EisError) -> EisError {
    match err {
        EisError::Connection(_) => err,
        other => EisError::Connection(format!("{resource}: {other}")),
    }
}

/// Identification query followed by reset and status clear.
pub fn handshake<C: InstrumentChannel + ?Sized>(channel: &mut C) -> Result<String, EisError> {
    let identity = channel.query("*IDN?")?;
    if identity.is_empty() {
        return Err(EisError::Connection("empty *IDN? response".into()));
    }
    info!("connected to {identity}");
    channel.send("*RST;*CLS")?;
    Ok(identity)
}

/// Reads an IEEE-488.2 definite-length block (`#<n><len><payload>`) and returns it with
/// its header.
pub fn read_definite_block<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, EisError> {
    let mut marker = [0u8; 2];
    reader.read_exact(&mut marker)?;
    if marker[0] != b'#' || !marker[1].is_ascii_digit() || marker[1] == b'0' {
        return Err(EisError::Decode(format!(
            "expected a definite-length block, got {:?}",
            String::from_utf8_lossy(&marker)
        )));
    }
    let digits = (marker[1] - b'0') as usize;
    let mut len_field = vec![0u8; digits];
    reader.read_exact(&mut len_field)?;
    let len: usize = std::str::from_utf8(&len_field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            EisError::Decode(format!(
                "bad block length field {:?}",
                String::from_utf8_lossy(&len_field)
            ))
        })?;
    let mut block = Vec::with_capacity(2 + digits + len);
    block.extend_from_slice(&marker);
    block.extend_from_slice(&len_field);
    let start = block.len();
    block.resize(start + len, 0);
    reader.read_exact(&mut block[start..])?;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_block_with_header() {
        let mut src = Cursor::new(b"#14abcd\n".to_vec());
        let block = read_definite_block(&mut src).unwrap();
        assert_eq!(block, b"#14abcd");
        assert_eq!(src.position(), 7);
    }

    #[test]
    fn rejects_indefinite_and_truncated_blocks() {
        assert!(matches!(
            read_definite_block(&mut Cursor::new(b"#0abc".to_vec())),
            Err(EisError::Decode(_))
        ));
        assert!(matches!(
            read_definite_block(&mut Cursor::new(b"#2x1".to_vec())),
            Err(EisError::Decode(_))
        ));
        assert!(matches!(
            read_definite_block(&mut Cursor::new(b"#15ab".to_vec())),
            Err(EisError::Io(_))
        ));
    }

    #[test]
    fn handshake_identifies_then_resets() {
        let mut sim = SimulatedInstrument::new();
        let identity = handshake(&mut sim).unwrap();
        assert!(identity.contains("U2331A"));
        assert_eq!(sim.commands(), &["*IDN?".to_string(), "*RST;*CLS".to_string()]);
    }

    #[test]
    fn simulator_resource_connects() {
        let (_channel, identity) = connect(SIM_RESOURCE).unwrap();
        assert!(identity.starts_with("Agilent Technologies"));
    }

    #[test]
    fn unknown_serial_port_is_a_connection_error() {
        let err = connect("serial:/definitely/not/a/port@9600").err().unwrap();
        assert!(matches!(err, EisError::Connection(_)));
    }
}
