//! Character-time estimation and the RTU inter-character/inter-frame
//! deadlines derived from it.
//!
//! RTU frame boundaries are defined purely by silence on the bus: a gap of
//! 1.5 character-times ends the main body of a frame, and 3.5 character-times
//! of total silence finalizes it. Both deadlines derive from the nominal
//! transmission time of one serial character at the configured line settings.
//! ASCII framing does not depend on timing at all.

use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};
use crate::port::SerialPortOptions;

/// Lower bound on the scaled character-time unit.
///
/// At high baud rates the nominal character time shrinks below what serial
/// hardware and the host scheduler can resolve; 250µs keeps the gap detection
/// meaningful (the Modbus spec fixes the inter-frame gap above 19200 baud for
/// the same reason).
pub const MIN_CHARACTER_TIME: Duration = Duration::from_micros(250);

/// Maximum value of the timing scale factor.
pub const MAX_TIMING_SCALE: u16 = 512;

/// Nominal transmission time of one serial character, rounded up to whole
/// nanoseconds.
///
/// `parity_bits` is 0 or 1; the start bit is implicit.
pub fn character_time(
    baud_rate: u32,
    data_bits: u8,
    parity_bits: u8,
    stop_bits: u8,
) -> ModbusResult<Duration> {
    if baud_rate == 0 {
        return Err(ModbusError::configuration("baud rate must be non-zero"));
    }
    if parity_bits > 1 {
        return Err(ModbusError::configuration(format!(
            "parity bits must be 0 or 1, got {parity_bits}"
        )));
    }
    let bits = 1 + u64::from(data_bits) + u64::from(parity_bits) + u64::from(stop_bits);
    let baud = u64::from(baud_rate);
    let nanos = (bits * 1_000_000_000).div_ceil(baud);
    Ok(Duration::from_nanos(nanos))
}

/// The two reception deadlines of the RTU line-idle state machine.
///
/// The unit is one character-time scaled by an integer factor in `1..=512`
/// (useful on busses with slow converters or long lines), floored at
/// [`MIN_CHARACTER_TIME`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialTimings {
    unit: Duration,
}

impl SerialTimings {
    /// Derive the deadlines from the port's line settings and a scale factor.
    pub fn new(options: &SerialPortOptions, scale: u16) -> ModbusResult<Self> {
        if scale == 0 || scale > MAX_TIMING_SCALE {
            return Err(ModbusError::configuration(format!(
                "timing scale must be in 1..={MAX_TIMING_SCALE}, got {scale}"
            )));
        }
        let char_time = character_time(
            options.baud_rate,
            options.data_bits.count(),
            options.parity.bit_count(),
            options.stop_bits.count(),
        )?;
        let unit = (char_time * u32::from(scale)).max(MIN_CHARACTER_TIME);
        Ok(Self { unit })
    }

    /// The scaled character-time unit.
    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// 1.5 character-times: a longer gap ends the main bytes of a frame.
    pub fn inter_character(&self) -> Duration {
        self.unit * 3 / 2
    }

    /// 3.5 character-times: this much total silence finalizes a frame and is
    /// the mandatory settle time after transmitting one.
    pub fn inter_frame(&self) -> Duration {
        self.unit * 7 / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{DataBits, Parity, StopBits};

    #[test]
    fn test_character_time_8n1() {
        // 10 bits at 9600 baud: 1041666.67ns, rounded up.
        let t = character_time(9600, 8, 0, 1).unwrap();
        assert_eq!(t, Duration::from_nanos(1_041_667));
    }

    #[test]
    fn test_character_time_7e1() {
        // 10 bits at 19200 baud.
        let t = character_time(19200, 7, 1, 1).unwrap();
        assert_eq!(t, Duration::from_nanos(520_834));
    }

    #[test]
    fn test_character_time_invalid_inputs() {
        assert!(character_time(0, 8, 0, 1).is_err());
        assert!(character_time(9600, 8, 2, 1).is_err());
    }

    fn options(baud_rate: u32) -> SerialPortOptions {
        SerialPortOptions {
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }

    #[test]
    fn test_timings_at_9600() {
        let timings = SerialTimings::new(&options(9600), 1).unwrap();
        // 10 bits / 9600 baud, just over a millisecond per character.
        assert_eq!(timings.unit(), Duration::from_nanos(1_041_667));
        assert!(timings.inter_character() < timings.inter_frame());
        assert_eq!(timings.inter_frame(), timings.unit() * 7 / 2);
    }

    #[test]
    fn test_timings_floor_at_high_baud() {
        // 10 bits / 115200 baud is ~87µs, below the floor.
        let timings = SerialTimings::new(&options(115_200), 1).unwrap();
        assert_eq!(timings.unit(), MIN_CHARACTER_TIME);
    }

    #[test]
    fn test_timings_scale() {
        let base = SerialTimings::new(&options(9600), 1).unwrap();
        let scaled = SerialTimings::new(&options(9600), 4).unwrap();
        assert_eq!(scaled.unit(), base.unit() * 4);

        assert!(SerialTimings::new(&options(9600), 0).is_err());
        assert!(SerialTimings::new(&options(9600), 513).is_err());
        assert!(SerialTimings::new(&options(9600), 512).is_ok());
    }
}
