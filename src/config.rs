//! Configuration surface and transport factories.
//!
//! The configuration is a plain serde-deserializable value; validation is a
//! separate explicit step so a config loaded from JSON fails with a
//! `Configuration` error naming the offending field rather than a serde
//! type error. The factories resolve the configured driver through a
//! [`PortDriverRegistry`] passed in by the caller, open the port and
//! assemble the requested transport.

use serde::{Deserialize, Serialize};

use crate::ascii::AsciiTransceiver;
use crate::error::{ModbusError, ModbusResult};
use crate::master::{AsciiMaster, MasterTransport, RtuMaster};
use crate::port::{
    DataBits, Parity, PortDriverRegistry, SerialPort, SerialPortOptions, StopBits,
    TOKIO_SERIAL_DRIVER,
};
use crate::rtu::RtuTransceiver;
use crate::slave::{AsciiSlave, RtuSlave, SlaveTransport};
use crate::timing::MAX_TIMING_SCALE;

/// Parity mode as it appears in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    #[default]
    None,
    Odd,
    Even,
}

impl From<ParityConfig> for Parity {
    fn from(value: ParityConfig) -> Self {
        match value {
            ParityConfig::None => Parity::None,
            ParityConfig::Odd => Parity::Odd,
            ParityConfig::Even => Parity::Even,
        }
    }
}

/// Serial device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// 7 or 8.
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: ParityConfig,
    /// 1 or 2.
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Name of the port driver to resolve in the registry.
    #[serde(default = "default_driver")]
    pub driver: String,
}

fn default_baudrate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_driver() -> String {
    TOKIO_SERIAL_DRIVER.to_string()
}

impl SerialDeviceConfig {
    /// Validate and convert to concrete port options.
    pub fn port_options(&self) -> ModbusResult<SerialPortOptions> {
        if self.baudrate == 0 {
            return Err(ModbusError::configuration("baudrate must be non-zero"));
        }
        Ok(SerialPortOptions {
            baud_rate: self.baudrate,
            data_bits: DataBits::try_from(self.data_bits)?,
            stop_bits: StopBits::try_from(self.stop_bits)?,
            parity: self.parity.into(),
        })
    }
}

/// RTU timing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialTimingConfig {
    /// Integer stretch factor on the character-time unit, 1..=512.
    #[serde(default = "default_scale")]
    pub scale: u16,
}

fn default_scale() -> u16 {
    1
}

impl Default for SerialTimingConfig {
    fn default() -> Self {
        Self {
            scale: default_scale(),
        }
    }
}

/// Complete serial transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub device: SerialDeviceConfig,
    #[serde(default)]
    pub timing: SerialTimingConfig,
}

impl SerialConfig {
    /// Check all fields; errors name the offending field and value.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.device.path.is_empty() {
            return Err(ModbusError::configuration("device path must not be empty"));
        }
        self.device.port_options()?;
        if self.timing.scale == 0 || self.timing.scale > MAX_TIMING_SCALE {
            return Err(ModbusError::configuration(format!(
                "timing scale must be in 1..={MAX_TIMING_SCALE}, got {}",
                self.timing.scale
            )));
        }
        Ok(())
    }
}

async fn open_port(
    config: &SerialConfig,
    registry: &PortDriverRegistry,
) -> ModbusResult<Box<dyn SerialPort>> {
    config.validate()?;
    let driver = registry.get(&config.device.driver).ok_or_else(|| {
        ModbusError::configuration(format!(
            "unknown serial driver '{}'",
            config.device.driver
        ))
    })?;
    driver.open(&config.device).await
}

/// Open a Modbus RTU master on the configured device.
pub async fn open_rtu_master(
    config: &SerialConfig,
    registry: &PortDriverRegistry,
) -> ModbusResult<RtuMaster> {
    let port = open_port(config, registry).await?;
    Ok(MasterTransport::new(RtuTransceiver::new(
        port,
        config.timing.scale,
    )?))
}

/// Open a Modbus RTU slave on the configured device.
pub async fn open_rtu_slave(
    config: &SerialConfig,
    registry: &PortDriverRegistry,
) -> ModbusResult<RtuSlave> {
    let port = open_port(config, registry).await?;
    Ok(SlaveTransport::new(RtuTransceiver::new(
        port,
        config.timing.scale,
    )?))
}

/// Open a Modbus ASCII master on the configured device.
pub async fn open_ascii_master(
    config: &SerialConfig,
    registry: &PortDriverRegistry,
) -> ModbusResult<AsciiMaster> {
    let port = open_port(config, registry).await?;
    Ok(MasterTransport::new(AsciiTransceiver::new(port)))
}

/// Open a Modbus ASCII slave on the configured device.
pub async fn open_ascii_slave(
    config: &SerialConfig,
    registry: &PortDriverRegistry,
) -> ModbusResult<AsciiSlave> {
    let port = open_port(config, registry).await?;
    Ok(SlaveTransport::new(AsciiTransceiver::new(port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> SerialConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse(r#"{"device": {"path": "/dev/ttyUSB0"}}"#);
        assert_eq!(config.device.baudrate, 9600);
        assert_eq!(config.device.data_bits, 8);
        assert_eq!(config.device.parity, ParityConfig::None);
        assert_eq!(config.device.stop_bits, 1);
        assert_eq!(config.device.driver, TOKIO_SERIAL_DRIVER);
        assert_eq!(config.timing.scale, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config_parses() {
        let config = parse(
            r#"{
                "device": {
                    "path": "/dev/ttyS1",
                    "baudrate": 19200,
                    "data_bits": 7,
                    "parity": "even",
                    "stop_bits": 2,
                    "driver": "tokio-serial"
                },
                "timing": {"scale": 16}
            }"#,
        );
        config.validate().unwrap();
        let options = config.device.port_options().unwrap();
        assert_eq!(options.baud_rate, 19200);
        assert_eq!(options.data_bits, DataBits::Seven);
        assert_eq!(options.parity, Parity::Even);
        assert_eq!(options.stop_bits, StopBits::Two);
    }

    #[test]
    fn test_validation_rejects_bad_fields() {
        let mut config = parse(r#"{"device": {"path": "/dev/ttyS1"}}"#);

        config.device.data_bits = 9;
        assert!(config.validate().is_err());
        config.device.data_bits = 8;

        config.device.stop_bits = 3;
        assert!(config.validate().is_err());
        config.device.stop_bits = 1;

        config.device.baudrate = 0;
        assert!(config.validate().is_err());
        config.device.baudrate = 9600;

        config.timing.scale = 0;
        assert!(config.validate().is_err());
        config.timing.scale = 513;
        assert!(config.validate().is_err());
        config.timing.scale = 512;
        config.validate().unwrap();

        config.device.path = String::new();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_driver() {
        let config = parse(r#"{"device": {"path": "/dev/ttyS1", "driver": "exotic"}}"#);
        let registry = PortDriverRegistry::with_defaults();

        let err = open_rtu_master(&config, &registry).await.unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_factory_assembles_transport() {
        use crate::port::{PortDriver, RxChar};
        use async_trait::async_trait;
        use std::sync::Arc;

        struct IdlePort(SerialPortOptions);

        #[async_trait]
        impl SerialPort for IdlePort {
            async fn recv(&mut self) -> ModbusResult<RxChar> {
                std::future::pending().await
            }

            async fn send(&mut self, _bytes: &[u8]) -> ModbusResult<()> {
                Ok(())
            }

            fn options(&self) -> SerialPortOptions {
                self.0
            }
        }

        struct IdleDriver;

        #[async_trait]
        impl PortDriver for IdleDriver {
            fn name(&self) -> &str {
                "idle"
            }

            async fn open(
                &self,
                device: &SerialDeviceConfig,
            ) -> ModbusResult<Box<dyn SerialPort>> {
                Ok(Box::new(IdlePort(device.port_options()?)))
            }
        }

        let config = parse(r#"{"device": {"path": "mem:0", "driver": "idle"}}"#);
        let mut registry = PortDriverRegistry::new();
        registry.register(Arc::new(IdleDriver));

        let master = open_rtu_master(&config, &registry).await.unwrap();
        assert!(!master.is_closed());
        master.close(true).await.unwrap();

        let slave = open_ascii_slave(&config, &registry).await.unwrap();
        assert!(!slave.is_closed());
        slave.close(true).await.unwrap();
    }
}
