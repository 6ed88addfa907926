//! # Modbus Serial Transport
//!
//! An async transport layer for Modbus over serial lines, covering both
//! serial encapsulations:
//!
//! - **RTU** — binary frames bounded by silence on the bus, validated by
//!   CRC16, with the 1.5/3.5 character-time reception state machine and the
//!   standard diagnostic bus counters.
//! - **ASCII** — `':'`-delimited uppercase-hex frames validated by LRC,
//!   framed purely by delimiters with no timing dependence.
//!
//! On top of the frame transceivers sit the two transport roles:
//!
//! - [`master::MasterTransport`] serializes queries onto the bus and
//!   correlates each with its answer (address match, function code match
//!   ignoring the 0x80 exception bit), with per-query timeout and
//!   cancellation.
//! - [`slave::SlaveTransport`] turns received queries into
//!   [`slave::Transaction`]s that are answered or ignored exactly once, one
//!   at a time, in bus order.
//!
//! This crate is deliberately PDU-agnostic: function-code semantics,
//! register maps and retry policy belong to the layer above. What it owns is
//! getting well-formed frames on and off the wire.
//!
//! ## Quick start
//!
//! ```no_run
//! use modbus_serial::config::{open_rtu_master, SerialConfig};
//! use modbus_serial::port::PortDriverRegistry;
//! use modbus_serial::SerialFrame;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> modbus_serial::ModbusResult<()> {
//!     let config: SerialConfig = serde_json::from_str(
//!         r#"{"device": {"path": "/dev/ttyUSB0", "baudrate": 19200}}"#,
//!     )?;
//!     let registry = PortDriverRegistry::with_defaults();
//!     let master = open_rtu_master(&config, &registry).await?;
//!
//!     let cancel = CancellationToken::new();
//!     let answer = master
//!         .query(
//!             0x01,
//!             0x03,
//!             vec![0x00, 0x00, 0x00, 0x08],
//!             Some(std::time::Duration::from_millis(
//!                 modbus_serial::DEFAULT_TIMEOUT_MS,
//!             )),
//!             &cancel,
//!         )
//!         .await?;
//!     println!("read {} payload bytes", answer.data().len());
//!
//!     master.close(false).await
//! }
//! ```

pub mod ascii;
pub mod checksum;
pub mod config;
pub mod error;
pub mod frame;
pub mod link;
pub mod master;
pub mod port;
pub mod rtu;
pub mod slave;
pub mod timing;
pub mod transceiver;

mod util;

pub use ascii::AsciiTransceiver;
pub use error::{ModbusError, ModbusResult};
pub use frame::{AsciiFrame, RtuFrame, SerialFrame};
pub use link::LinkState;
pub use master::{AsciiMaster, MasterTransport, RtuMaster};
pub use port::{PortDriver, PortDriverRegistry, SerialPort, SerialPortOptions};
pub use rtu::{RtuBusCounterSnapshot, RtuTransceiver};
pub use slave::{AsciiSlave, RtuSlave, SlaveTransport, Transaction, TransactionState};
pub use transceiver::Transceiver;

/// Maximum payload length of a frame: a 253-byte PDU minus the function code.
pub const MAX_PDU_DATA_LENGTH: usize = 252;

/// Maximum size of a raw RTU frame: address, function, data, CRC16.
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Maximum size of a raw ASCII frame: `':'`, the hex rendition of the
/// longest address/function/data/LRC body, and the closing CR LF.
pub const MAX_ASCII_FRAME_SIZE: usize = 513;

/// Default master query timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
