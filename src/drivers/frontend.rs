//! Bit-serial programming of the analog front end (mode switch and the two digital
//! potentiometers that set the voltage and current gain).
//!
//! Three digital lines are used: port 501 carries one active-low strobe per target, port
//! 502 bit 0 is the data line and port 503 bit 0 the clock. Words are shifted MSB first.
use crate::drivers::EisError;

/// Port carrying the per-target strobes (and the trigger on bit 0).
pub const STROBE_PORT: u16 = 501;
pub const DATA_PORT: u16 = 502;
pub const CLOCK_PORT: u16 = 503;

/// End-to-end resistance of the voltage-gain potentiometer (ohm).
const VOLTAGE_POT_OHMS: f64 = 100_000.0;
/// End-to-end resistance of the current-gain potentiometer (ohm).
const CURRENT_POT_OHMS: f64 = 10_000.0;
const POT_STEPS: f64 = 256.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrontEndMode {
    Off,
    Potentiostat,
    Galvanostat,
}
impl FrontEndMode {
    /// Relay pattern latched by the mode register.
    pub fn pattern(&self) -> u8 {
        match self {
            FrontEndMode::Off => 0b0000_0000,
            FrontEndMode::Potentiostat => 0b0000_1011,
            FrontEndMode::Galvanostat => 0b0000_1000,
        }
    }
}

/// Register selected by a strobe line on port 501.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerialTarget {
    Mode,
    VoltageGain,
    CurrentGain,
}
impl SerialTarget {
    pub fn strobe_bit(&self) -> u8 {
        match self {
            SerialTarget::Mode => 1,
            SerialTarget::VoltageGain => 2,
            SerialTarget::CurrentGain => 3,
        }
    }
}

/// Wiper code for a voltage amplifier gain (V/V). Fractional gains are used as given;
/// only the resulting code is floored.
pub fn voltage_gain_code(gain: f64) -> Result<u8, EisError> {
    to_code(
        "voltage gain",
        gain,
        (POT_STEPS / VOLTAGE_POT_OHMS) * (gain * 1.0e4 - 203.0),
    )
}

/// Wiper code for a current amplifier gain (V/V). Gains at or below 1 are unreachable.
pub fn current_gain_code(gain: f64) -> Result<u8, EisError> {
    to_code(
        "current gain",
        gain,
        (POT_STEPS / CURRENT_POT_OHMS) * (19_800.0 / (gain - 1.0) - 150.0),
    )
}

fn to_code(what: &str, gain: f64, raw: f64) -> Result<u8, EisError> {
    let code = raw.floor();
    if !code.is_finite() || !(0.0..=255.0).contains(&code) {
        return Err(EisError::Config(format!(
            "{what} {gain} maps to potentiometer code {code}, outside 0..=255"
        )));
    }
    Ok(code as u8)
}

/// `SOUR:DIG:DATA:BIT` command setting `bit` of `port` to `value`.
pub fn bit_command(value: bool, bit: u8, port: u16) -> String {
    format!("SOUR:DIG:DATA:BIT {}, {bit},(@{port})", value as u8)
}

/// Commands that shift `word` into `target`, in order. The caller waits the inter-edge
/// delay after every data and clock write; the strobe writes need no settling time.
pub fn shift_sequence(target: SerialTarget, word: u8) -> Vec<SerialStep> {
    let strobe = target.strobe_bit();
    let mut steps = Vec::with_capacity(2 + 3 * 8);
    steps.push(SerialStep::immediate(bit_command(false, strobe, STROBE_PORT)));
    for shift in (0..8).rev() {
        let bit = (word >> shift) & 1 == 1;
        steps.push(SerialStep::delayed(bit_command(bit, 0, DATA_PORT)));
        steps.push(SerialStep::delayed(bit_command(true, 0, CLOCK_PORT)));
        steps.push(SerialStep::delayed(bit_command(false, 0, CLOCK_PORT)));
    }
    steps.push(SerialStep::immediate(bit_command(true, strobe, STROBE_PORT)));
    steps
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialStep {
    pub command: String,
    pub settle: bool,
}
impl SerialStep {
    fn immediate(command: String) -> Self {
        Self {
            command,
            settle: false,
        }
    }
    fn delayed(command: String) -> Self {
        Self {
            command,
            settle: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn mode_patterns() {
        assert_eq!(FrontEndMode::Potentiostat.pattern(), 0x0b);
        assert_eq!(FrontEndMode::Galvanostat.pattern(), 0x08);
        assert_eq!(FrontEndMode::Off.pattern(), 0);
    }
    #[test]
    fn gain_codes_follow_potentiometer_law() {
        assert_eq!(voltage_gain_code(1.0).unwrap(), 25);
        assert_eq!(voltage_gain_code(10.0).unwrap(), 255);
        assert_eq!(current_gain_code(10.0).unwrap(), 52);
        assert_eq!(current_gain_code(100.0).unwrap(), 1);
    }
    #[test]
    fn unreachable_gains_are_config_errors() {
        assert!(matches!(voltage_gain_code(11.0), Err(EisError::Config(_))));
        assert!(voltage_gain_code(0.0).is_err());
        assert!(current_gain_code(1.0).is_err());
        assert!(current_gain_code(2.0).is_err());
    }
    #[test]
    fn shifts_msb_first_between_strobes() {
        let steps = shift_sequence(SerialTarget::VoltageGain, 0b1000_0001);
        assert_eq!(steps.len(), 26);
        assert_eq!(steps[0].command, "SOUR:DIG:DATA:BIT 0, 2,(@501)");
        assert!(!steps[0].settle);
        assert_eq!(steps[1].command, "SOUR:DIG:DATA:BIT 1, 0,(@502)");
        assert_eq!(steps[2].command, "SOUR:DIG:DATA:BIT 1, 0,(@503)");
        assert_eq!(steps[3].command, "SOUR:DIG:DATA:BIT 0, 0,(@503)");
        assert_eq!(steps[4].command, "SOUR:DIG:DATA:BIT 0, 0,(@502)");
        assert_eq!(steps[22].command, "SOUR:DIG:DATA:BIT 1, 0,(@502)");
        assert_eq!(steps[25].command, "SOUR:DIG:DATA:BIT 1, 2,(@501)");
        assert_eq!(steps.iter().filter(|s| s.settle).count(), 24);
    }

    #[test]
    fn fractional_gain_is_not_truncated() {
        assert_eq!(voltage_gain_code(1.5).unwrap(), 37);
        assert_eq!(voltage_gain_code(1.0).unwrap(), 25);
    }
}
