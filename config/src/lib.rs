#![cfg_attr(not(test), no_std)]
//! # Board Configuration
//!
//! The board configuration is read from EEPROM.
//!
//! ## Memory Map
//!
//! ```text
//!             0           8          16          24          32
//!             +-----------+-----------+-----------+-----------+
//! 0x0808_0000 | Version   | Magic                             |
//!             +-----------+-----------+-----------+-----------+
//! 0x0808_0004 | I2cSpeed              | Policy    | Reserved  |
//!             +-----------+-----------+-----------+-----------+
//! 0x0808_0008 | Dev0      | Dev1      | Dev2      | Dev3      |
//!             +-----------+-----------+-----------+-----------+
//! 0x0808_000C | HostBaud                                      |
//!             +-----------+-----------+-----------+-----------+
//! ```
//!
//! ## Fields
//!
//! ### Header (0x0808_0000 - 0x0808_0004, 4 bytes)
//!
//! - `Version`: The constant `0x01`, can be used to change the config layout
//!   in the future (1 byte)
//! - `Magic`: The sequence `0x4C 0x44 0x43` ("LDC"), as a check against
//!   configuration data corruption.
//!
//! ### Bus Configuration (0x0808_0004 - 0x0808_000C, 8 bytes)
//!
//! - `I2cSpeed`: I²C bus clock in kHz (2 bytes, u16, LE)
//! - `Policy`: Reaction to failing bus transactions, `0` drops the affected
//!   sample, `1` stops the firmware (1 byte)
//! - `Dev0`..`Dev3`: 7-bit I²C address of the sensor behind bus device id
//!   0 to 3, `0x00` marks an unused entry (1 byte each)
//!
//! ### Host Link (0x0808_000C - 0x0808_0010, 4 bytes)
//!
//! - `HostBaud`: Baud rate of the host UART (4 bytes, u32, LE)

use core::fmt;

use eddyprobe_common::ldc1612::BusFaultPolicy;

pub const BASE_ADDR: usize = 0x0808_0000;
pub const CONFIG_DATA_SIZE: usize = 16;

/// Number of entries in the bus device table.
pub const BUS_DEVICES: usize = 4;

const MAGIC: [u8; 3] = [0x4C, 0x44, 0x43];

#[derive(PartialEq, Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(serde_repr::Deserialize_repr))]
#[repr(u8)]
pub enum ConfigVersion {
    V1 = 1,
}

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "1"),
        }
    }
}

#[derive(PartialEq, Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(serde_repr::Deserialize_repr))]
#[repr(u8)]
pub enum FaultPolicy {
    Tolerate = 0,
    Shutdown = 1,
}

impl From<FaultPolicy> for BusFaultPolicy {
    fn from(policy: FaultPolicy) -> Self {
        match policy {
            FaultPolicy::Tolerate => BusFaultPolicy::Tolerate,
            FaultPolicy::Shutdown => BusFaultPolicy::Shutdown,
        }
    }
}

#[derive(PartialEq, Debug, Copy, Clone)]
pub enum ConfigError {
    /// The version byte is not supported.
    UnsupportedVersion(u8),
    /// Wrong magic bytes, the configuration data might be corrupted.
    WrongMagicBytes,
    UnknownFaultPolicy(u8),
    /// A bus device address does not fit into 7 bits.
    InvalidAddress(u8),
    ZeroBusSpeed,
    ZeroBaudRate,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => write!(f, "Unsupported config format version ({})", v),
            Self::WrongMagicBytes => write!(f, "Wrong magic bytes"),
            Self::UnknownFaultPolicy(p) => write!(f, "Unknown bus fault policy ({})", p),
            Self::InvalidAddress(a) => write!(f, "Invalid I²C address ({:#04x})", a),
            Self::ZeroBusSpeed => write!(f, "I²C bus speed must not be zero"),
            Self::ZeroBaudRate => write!(f, "Host baud rate must not be zero"),
        }
    }
}

#[derive(PartialEq, Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct Config {
    /// Configuration format version
    pub version: ConfigVersion,
    /// I²C bus clock in kHz
    pub i2c_speed_khz: u16,
    pub bus_fault_policy: FaultPolicy,
    /// Sensor addresses indexed by bus device id, 0 for unused entries
    pub bus_devices: [u8; BUS_DEVICES],
    pub host_baud: u32,
}

impl Config {
    /// Read current board configuration from EEPROM.
    ///
    /// Returns an error if the data does not contain a valid configuration.
    ///
    /// UNSAFE: This method is unsafe because it reads raw memory. When calling
    /// this, ensure that no other part of the code can write to EEPROM at the
    /// same time. An easy way to do this, is to hold a mutable reference to
    /// the `pac::FLASH` peripheral.
    pub unsafe fn read_from_eeprom() -> Result<Self, ConfigError> {
        // Note(unsafe): Read with no side effects. See function docs for more
        // information.
        let config_data = &*(BASE_ADDR as *const [u8; CONFIG_DATA_SIZE]);
        Self::from_bytes(config_data)
    }

    /// Parse and validate a configuration image.
    pub fn from_bytes(config_data: &[u8; CONFIG_DATA_SIZE]) -> Result<Self, ConfigError> {
        // Determine version
        let version: ConfigVersion = match config_data[0] {
            1 => ConfigVersion::V1,
            other => return Err(ConfigError::UnsupportedVersion(other)),
        };

        // Validate magic bytes
        if config_data[0x01..0x04] != MAGIC {
            return Err(ConfigError::WrongMagicBytes);
        }

        let i2c_speed_khz = u16::from_le_bytes([config_data[0x04], config_data[0x05]]);
        let bus_fault_policy = match config_data[0x06] {
            0 => FaultPolicy::Tolerate,
            1 => FaultPolicy::Shutdown,
            other => return Err(ConfigError::UnknownFaultPolicy(other)),
        };
        let mut bus_devices = [0; BUS_DEVICES];
        bus_devices.copy_from_slice(&config_data[0x08..0x0C]);
        let host_baud = u32::from_le_bytes([
            config_data[0x0C],
            config_data[0x0D],
            config_data[0x0E],
            config_data[0x0F],
        ]);

        let config = Self {
            version,
            i2c_speed_khz,
            bus_fault_policy,
            bus_devices,
            host_baud,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the field values. Runs as part of [`Config::from_bytes`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.i2c_speed_khz == 0 {
            return Err(ConfigError::ZeroBusSpeed);
        }
        if self.host_baud == 0 {
            return Err(ConfigError::ZeroBaudRate);
        }
        if let Some(&address) = self.bus_devices.iter().find(|&&a| a > 0x7f) {
            return Err(ConfigError::InvalidAddress(address));
        }
        Ok(())
    }

    /// Resolve a bus device id to the I²C address of the sensor.
    pub fn bus_device(&self, bus_device_oid: u8) -> Option<u8> {
        self.bus_devices
            .get(usize::from(bus_device_oid))
            .copied()
            .filter(|&address| address != 0)
    }

    /// Serialize the configuration into the in-memory representation.
    pub fn serialize(&self) -> [u8; CONFIG_DATA_SIZE] {
        let mut data = [0; CONFIG_DATA_SIZE];

        // Write version
        data[0] = self.version as u8;

        // Write magic bytes
        data[0x01..0x04].copy_from_slice(&MAGIC);

        // Write bus config
        data[0x04..0x06].copy_from_slice(&self.i2c_speed_khz.to_le_bytes());
        data[0x06] = self.bus_fault_policy as u8;
        data[0x08..0x0C].copy_from_slice(&self.bus_devices);

        // Write host link config
        data[0x0C..0x10].copy_from_slice(&self.host_baud.to_le_bytes());

        data
    }
}
