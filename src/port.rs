//! The character-oriented serial port abstraction and its drivers.
//!
//! The transceivers never talk to an OS serial device directly; they consume
//! a port through the [`SerialPort`] trait, which delivers one received
//! character at a time together with its line-level validity flags and
//! accepts whole raw frames for transmission. Ownership doubles as the
//! disposal contract: a port is owned by exactly one transceiver for its
//! lifetime and is disposed exactly once, when the transceiver's link task
//! drops it on the terminal close path.
//!
//! Concrete ports are produced by [`PortDriver`]s looked up in a
//! [`PortDriverRegistry`] that the caller passes into the transport
//! factories. The registry is a plain value — there is no process-wide
//! driver table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::SerialDeviceConfig;
use crate::error::{ModbusError, ModbusResult};

/// Number of data bits per serial character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

impl DataBits {
    /// Bit count as a number.
    pub fn count(self) -> u8 {
        match self {
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = ModbusError;

    fn try_from(value: u8) -> ModbusResult<Self> {
        match value {
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(ModbusError::configuration(format!(
                "data bits must be 7 or 8, got {other}"
            ))),
        }
    }
}

/// Number of stop bits per serial character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl StopBits {
    /// Bit count as a number.
    pub fn count(self) -> u8 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl TryFrom<u8> for StopBits {
    type Error = ModbusError;

    fn try_from(value: u8) -> ModbusResult<Self> {
        match value {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(ModbusError::configuration(format!(
                "stop bits must be 1 or 2, got {other}"
            ))),
        }
    }
}

/// Parity mode of the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Parity {
    /// Number of parity bits this mode adds to a character (0 or 1).
    pub fn bit_count(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd | Parity::Even => 1,
        }
    }
}

/// Line settings of an open serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialPortOptions {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

/// One received character with its line-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxChar {
    /// The received byte.
    pub byte: u8,
    /// False when the driver flagged a parity or framing error for this
    /// character.
    pub valid: bool,
    /// True when the driver's receive buffer overran at or before this
    /// character.
    pub overrun: bool,
}

impl RxChar {
    /// A clean character with no error flags.
    pub fn clean(byte: u8) -> Self {
        Self {
            byte,
            valid: true,
            overrun: false,
        }
    }
}

/// Abstract character-oriented serial port.
///
/// Implementations must be cancel-safe in `recv`: dropping the future before
/// a character arrived must not lose data.
#[async_trait]
pub trait SerialPort: Send {
    /// Await the next received character.
    async fn recv(&mut self) -> ModbusResult<RxChar>;

    /// Transmit raw bytes, returning once the driver accepted them all.
    async fn send(&mut self, bytes: &[u8]) -> ModbusResult<()>;

    /// Line settings this port was opened with.
    fn options(&self) -> SerialPortOptions;
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// [`SerialPort`] backed by a `tokio_serial::SerialStream`.
///
/// The OS driver surfaces parity and framing problems as read errors or
/// replacement bytes rather than per-character flags, so every byte this
/// adapter delivers is reported as valid with no overrun.
pub struct TokioSerialPort {
    stream: tokio_serial::SerialStream,
    options: SerialPortOptions,
}

impl TokioSerialPort {
    /// Open the device at `path` with the given line settings.
    pub fn open(path: &str, options: SerialPortOptions) -> ModbusResult<Self> {
        let builder = tokio_serial::new(path, options.baud_rate)
            .data_bits(options.data_bits.into())
            .stop_bits(options.stop_bits.into())
            .parity(options.parity.into());

        let stream = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| ModbusError::io(format!("failed to open serial port {path}: {e}")))?;

        Ok(Self { stream, options })
    }
}

#[async_trait]
impl SerialPort for TokioSerialPort {
    async fn recv(&mut self) -> ModbusResult<RxChar> {
        let byte = self
            .stream
            .read_u8()
            .await
            .map_err(|e| ModbusError::io(format!("serial read error: {e}")))?;
        Ok(RxChar::clean(byte))
    }

    async fn send(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| ModbusError::io(format!("serial write error: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ModbusError::io(format!("serial flush error: {e}")))?;
        Ok(())
    }

    fn options(&self) -> SerialPortOptions {
        self.options
    }
}

/// Name of the built-in `tokio-serial` driver.
pub const TOKIO_SERIAL_DRIVER: &str = "tokio-serial";

/// Factory for concrete serial ports.
#[async_trait]
pub trait PortDriver: Send + Sync {
    /// Registry name of this driver.
    fn name(&self) -> &str;

    /// Open a port for the given device configuration.
    async fn open(&self, device: &SerialDeviceConfig) -> ModbusResult<Box<dyn SerialPort>>;
}

/// The built-in driver opening real devices through `tokio-serial`.
pub struct TokioSerialDriver;

#[async_trait]
impl PortDriver for TokioSerialDriver {
    fn name(&self) -> &str {
        TOKIO_SERIAL_DRIVER
    }

    async fn open(&self, device: &SerialDeviceConfig) -> ModbusResult<Box<dyn SerialPort>> {
        let options = device.port_options()?;
        Ok(Box::new(TokioSerialPort::open(&device.path, options)?))
    }
}

/// Explicit name → driver map handed to the transport factories.
#[derive(Default)]
pub struct PortDriverRegistry {
    drivers: HashMap<String, Arc<dyn PortDriver>>,
}

impl PortDriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `tokio-serial` driver registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TokioSerialDriver));
        registry
    }

    /// Register a driver under its own name, replacing any previous entry.
    pub fn register(&mut self, driver: Arc<dyn PortDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Look up a driver; `Some` when registered, `None` when absent.
    pub fn get(&self, name: &str) -> Option<Arc<dyn PortDriver>> {
        self.drivers.get(name).cloned()
    }
}
