//! Frame value objects and raw codecs for the two serial encapsulations.
//!
//! `RtuFrame` and `AsciiFrame` are structurally identical immutable
//! `{address, function, data}` triples, but they are deliberately distinct
//! types: they originate from different wire encodings and must never be
//! handed to the wrong transceiver. The [`SerialFrame`] trait unifies them
//! for the generic master/slave transport wrappers.
//!
//! ## Wire formats
//!
//! RTU raw frame:
//!
//! ```text
//! [address:1][function:1][data:0..252][CRC16:2 little-endian]
//! ```
//!
//! ASCII raw frame (all hex pairs uppercase):
//!
//! ```text
//! ':' [addr:2][function:2][data:0..504]['LRC':2] CR LF
//! ```

use crate::checksum::{crc16, lrc, rtu_frame_is_clean};
use crate::error::{ModbusError, ModbusResult};

/// Precomputed byte → uppercase hex pair table.
const HEX_PAIRS: [[u8; 2]; 256] = build_hex_pairs();

/// Precomputed hex character → nibble table; 0xFF marks an invalid character.
const HEX_NIBBLES: [u8; 256] = build_hex_nibbles();

const fn build_hex_pairs() -> [[u8; 2]; 256] {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let mut table = [[0u8; 2]; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = [DIGITS[i >> 4], DIGITS[i & 0x0F]];
        i += 1;
    }
    table
}

const fn build_hex_nibbles() -> [u8; 256] {
    let mut table = [0xFFu8; 256];
    let mut i = 0u8;
    while i < 10 {
        table[(b'0' + i) as usize] = i;
        i += 1;
    }
    let mut i = 0u8;
    while i < 6 {
        table[(b'A' + i) as usize] = 10 + i;
        table[(b'a' + i) as usize] = 10 + i;
        i += 1;
    }
    table
}

/// Common access surface of the RTU and ASCII frame value objects.
///
/// The generic master and slave transports are written against this trait so
/// the correlation and transaction logic exists once for both encapsulations.
pub trait SerialFrame: Clone + Send + Sync + Sized + 'static {
    /// Construct a frame, validating field ranges and data length.
    fn new(address: u8, function: u8, data: Vec<u8>) -> ModbusResult<Self>;

    /// Bus address (unit identifier) of the frame.
    fn address(&self) -> u8;

    /// Function code, including a possible 0x80 exception bit.
    fn function(&self) -> u8;

    /// Payload bytes (at most [`crate::MAX_PDU_DATA_LENGTH`]).
    fn data(&self) -> &[u8];
}

fn validate_data_length(data: &[u8]) -> ModbusResult<()> {
    if data.len() > crate::MAX_PDU_DATA_LENGTH {
        return Err(ModbusError::invalid_frame(format!(
            "data length {} exceeds maximum of {}",
            data.len(),
            crate::MAX_PDU_DATA_LENGTH
        )));
    }
    Ok(())
}

/// Immutable Modbus RTU frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    address: u8,
    function: u8,
    data: Vec<u8>,
}

impl RtuFrame {
    /// Construct a frame; fails if `data` exceeds the 252-byte PDU limit.
    pub fn new(address: u8, function: u8, data: Vec<u8>) -> ModbusResult<Self> {
        validate_data_length(&data)?;
        Ok(Self {
            address,
            function,
            data,
        })
    }

    /// Encode to raw wire bytes: address, function, data, CRC16 little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.data.len() + 4);
        raw.push(self.address);
        raw.push(self.function);
        raw.extend_from_slice(&self.data);
        let crc = crc16(&raw);
        raw.extend_from_slice(&crc.to_le_bytes());
        raw
    }

    /// Decode a raw wire frame.
    ///
    /// A frame shorter than 4 bytes or with a non-zero CRC residue is a
    /// communication error; the RTU transceiver counts and drops it.
    pub fn decode(raw: &[u8]) -> ModbusResult<Self> {
        if raw.len() < 4 {
            return Err(ModbusError::frame(format!(
                "RTU frame too short: {} bytes",
                raw.len()
            )));
        }
        if !rtu_frame_is_clean(raw) {
            return Err(ModbusError::frame("RTU CRC mismatch"));
        }
        Self::new(raw[0], raw[1], raw[2..raw.len() - 2].to_vec())
    }
}

impl SerialFrame for RtuFrame {
    fn new(address: u8, function: u8, data: Vec<u8>) -> ModbusResult<Self> {
        RtuFrame::new(address, function, data)
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn function(&self) -> u8 {
        self.function
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Immutable Modbus ASCII frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiFrame {
    address: u8,
    function: u8,
    data: Vec<u8>,
}

impl AsciiFrame {
    /// Construct a frame; fails if `data` exceeds the 252-byte PDU limit.
    pub fn new(address: u8, function: u8, data: Vec<u8>) -> ModbusResult<Self> {
        validate_data_length(&data)?;
        Ok(Self {
            address,
            function,
            data,
        })
    }

    /// Encode to raw wire bytes: `':'`, uppercase hex pairs for address,
    /// function, data and LRC, then CR LF.
    pub fn encode(&self) -> Vec<u8> {
        let mut digest_input = Vec::with_capacity(self.data.len() + 2);
        digest_input.push(self.address);
        digest_input.push(self.function);
        digest_input.extend_from_slice(&self.data);

        let mut raw = Vec::with_capacity(digest_input.len() * 2 + 5);
        raw.push(b':');
        for &byte in &digest_input {
            raw.extend_from_slice(&HEX_PAIRS[byte as usize]);
        }
        raw.extend_from_slice(&HEX_PAIRS[lrc(&digest_input) as usize]);
        raw.push(b'\r');
        raw.push(b'\n');
        raw
    }

    /// Decode a raw ASCII frame.
    ///
    /// Accepts the receptor buffer form (leading `':'`, trailing CR with or
    /// without the final LF). Fewer than 3 decoded bytes, an odd hex region,
    /// an invalid hex character or an LRC mismatch are communication errors;
    /// the ASCII transceiver drops such frames silently.
    pub fn decode(raw: &[u8]) -> ModbusResult<Self> {
        let mut hex = raw;
        if hex.first() != Some(&b':') {
            return Err(ModbusError::frame("ASCII frame missing ':' start"));
        }
        hex = &hex[1..];
        if hex.last() == Some(&b'\n') {
            hex = &hex[..hex.len() - 1];
        }
        if hex.last() == Some(&b'\r') {
            hex = &hex[..hex.len() - 1];
        }
        if hex.len() % 2 != 0 {
            return Err(ModbusError::frame("ASCII frame has odd hex length"));
        }

        let mut decoded = Vec::with_capacity(hex.len() / 2);
        for pair in hex.chunks_exact(2) {
            let high = HEX_NIBBLES[pair[0] as usize];
            let low = HEX_NIBBLES[pair[1] as usize];
            if high == 0xFF || low == 0xFF {
                return Err(ModbusError::frame(format!(
                    "invalid hex pair {:?}{:?}",
                    pair[0] as char, pair[1] as char
                )));
            }
            decoded.push((high << 4) | low);
        }

        if decoded.len() < 3 {
            return Err(ModbusError::frame(format!(
                "ASCII frame too short: {} decoded bytes",
                decoded.len()
            )));
        }

        let received_lrc = decoded[decoded.len() - 1];
        let payload = &decoded[..decoded.len() - 1];
        let computed = lrc(payload);
        if received_lrc != computed {
            return Err(ModbusError::frame(format!(
                "LRC mismatch: computed {computed:02X}, received {received_lrc:02X}"
            )));
        }

        Self::new(payload[0], payload[1], payload[2..].to_vec())
    }
}

impl SerialFrame for AsciiFrame {
    fn new(address: u8, function: u8, data: Vec<u8>) -> ModbusResult<Self> {
        AsciiFrame::new(address, function, data)
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn function(&self) -> u8 {
        self.function
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}
