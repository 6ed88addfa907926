//! Streaming CRC-16 and LRC digests for the two serial encapsulations.
//!
//! Both digests accept one byte at a time because reception is strictly
//! character-by-character: the RTU receptor feeds each byte into the running
//! CRC as it lands, and the ASCII decoder feeds each decoded hex pair into
//! the LRC.
//!
//! ## CRC-16 (RTU)
//!
//! Standard Modbus CRC: polynomial 0xA001 (reflected), initial value 0xFFFF,
//! no final XOR. The transmitted CRC is appended little-endian, which gives
//! the usual receiver-side shortcut: digesting the *entire* raw frame
//! (payload plus the two CRC bytes) yields 0x0000 exactly when the frame is
//! intact.
//!
//! ## LRC (ASCII)
//!
//! Two's complement of the byte sum modulo 256, computed over address,
//! function code and data only. The received LRC byte is compared by
//! equality; it is never part of the digest input.

use crc::{Crc, Digest, CRC_16_MODBUS};

/// CRC parameter block shared by all RTU digests.
static CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Streaming Modbus CRC-16 digest.
pub struct Crc16 {
    digest: Digest<'static, u16>,
}

impl Crc16 {
    /// Start a new digest, initialized to 0xFFFF.
    pub fn new() -> Self {
        Self {
            digest: CRC_MODBUS.digest(),
        }
    }

    /// Feed a single byte into the digest.
    pub fn update(&mut self, byte: u8) {
        self.digest.update(&[byte]);
    }

    /// Feed a byte slice into the digest.
    pub fn update_slice(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    /// Consume the digest and return the CRC value.
    ///
    /// For the wire, append with `to_le_bytes()`: Modbus RTU transmits the
    /// low CRC byte first.
    pub fn finalize(self) -> u16 {
        self.digest.finalize()
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-16 of a byte slice in one call.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Check a complete raw RTU frame (payload + trailing CRC16LE).
///
/// True iff the digest over the whole frame is the zero residue. Frames
/// shorter than the 4-byte minimum are never valid.
pub fn rtu_frame_is_clean(raw: &[u8]) -> bool {
    raw.len() >= 4 && crc16(raw) == 0x0000
}

/// Streaming Modbus ASCII LRC digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lrc {
    sum: u8,
}

impl Lrc {
    /// Start a new digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a single byte into the digest.
    pub fn update(&mut self, byte: u8) {
        self.sum = self.sum.wrapping_add(byte);
    }

    /// Feed a byte slice into the digest.
    pub fn update_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.update(b);
        }
    }

    /// Return the LRC value (two's complement of the running sum).
    pub fn value(&self) -> u8 {
        self.sum.wrapping_neg()
    }
}

/// LRC of a byte slice in one call.
pub fn lrc(data: &[u8]) -> u8 {
    let mut digest = Lrc::new();
    digest.update_slice(data);
    digest.value()
}
