//! Register access for the TI LDC1612 inductance-to-digital converter.
//!
//! Only the registers needed for sampling channel 0 are covered. Chip
//! configuration is written by the host through the generic I²C commands.

use core::fmt;

use embedded_hal::blocking::i2c::WriteRead;

use crate::bulk::BYTES_PER_SAMPLE;

/// Register addresses
pub mod registers {
    /// Channel 0 conversion result, upper 16 bits (incl. 4 error bits)
    pub const DATA0_MSB: u8 = 0x00;
    /// Channel 0 conversion result, lower 16 bits
    pub const DATA0_LSB: u8 = 0x01;
    pub const STATUS: u8 = 0x18;
}

/// STATUS.UNREADCONV0: An unread conversion is present for channel 0.
pub const STATUS_UNREADCONV0: u16 = 0x08;

/// How to react to failing bus transactions.
///
/// Not all targets can recover from a wedged bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusFaultPolicy {
    /// Drop the affected sample and continue.
    Tolerate,
    /// Stop the firmware.
    Shutdown,
}

/// A failed register read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusError<E> {
    pub register: u8,
    pub error: E,
}

impl<E: fmt::Debug> fmt::Display for BusError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "I²C read of register {:#04x} failed: {:?}",
            self.register, self.error
        )
    }
}

/// An LDC1612 on an I²C bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ldc1612 {
    address: u8,
}

impl Ldc1612 {
    pub const fn new(address: u8) -> Self {
        Self { address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Read a 16 bit register, big endian on the wire.
    pub fn read_register<I2C, E>(&self, i2c: &mut I2C, register: u8) -> Result<[u8; 2], BusError<E>>
    where
        I2C: WriteRead<Error = E>,
    {
        let mut buf = [0; 2];
        i2c.write_read(self.address, &[register], &mut buf)
            .map_err(|error| BusError { register, error })?;
        Ok(buf)
    }

    /// Read the status register. Reading it also clears the INTB line.
    pub fn read_status<I2C, E>(&self, i2c: &mut I2C) -> Result<u16, BusError<E>>
    where
        I2C: WriteRead<Error = E>,
    {
        self.read_register(i2c, registers::STATUS)
            .map(u16::from_be_bytes)
    }

    /// Read the channel 0 conversion result as it is sent to the host.
    pub fn read_sample<I2C, E>(&self, i2c: &mut I2C) -> Result<[u8; BYTES_PER_SAMPLE], BusError<E>>
    where
        I2C: WriteRead<Error = E>,
    {
        let msb = self.read_register(i2c, registers::DATA0_MSB)?;
        let lsb = self.read_register(i2c, registers::DATA0_LSB)?;
        Ok([msb[0], msb[1], lsb[0], lsb[1]])
    }
}

/// Decode a raw sample into the 32 bit data value (28 data bits, 4 error
/// bits on top).
pub fn decode_sample(sample: &[u8; BYTES_PER_SAMPLE]) -> u32 {
    u32::from_be_bytes(*sample)
}
