//! Common types, enums, and error definitions for the GATT integration layer

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for trainerlink operations
pub type Result<T> = std::result::Result<T, TrainerError>;

/// Error types for device discovery, decoding and control
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainerError {
    #[error("No device was selected")]
    DeviceNotSelected,

    #[error("Bluetooth error: {0}")]
    Transport(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Frame too short for field {field}: need {needed} bytes at offset {offset}, got {available}")]
    FrameTooShort {
        field: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Unknown command '{command}' for characteristic 0x{characteristic:04X}")]
    UnknownCommand { characteristic: u16, command: String },

    #[error("No writable characteristic 0x{0:04X} on this device")]
    UnknownCharacteristic(u16),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Command '{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Command '{command}' timed out after {after:?}")]
    CommandTimedOut { command: String, after: Duration },

    #[error("Command '{command}' was superseded by a newer request")]
    CommandSuperseded { command: String },

    #[error("Operation cancelled, session is shutting down")]
    Cancelled,

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),
}

/// Byte order of a multi-byte value in a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Big,
    Little,
}

/// Numeric storage formats understood by the frame codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumberFormat {
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl NumberFormat {
    /// Width of the format in bytes
    pub const fn width(self) -> usize {
        match self {
            NumberFormat::Uint8 | NumberFormat::Int8 => 1,
            NumberFormat::Uint16 | NumberFormat::Int16 => 2,
            NumberFormat::Uint32 | NumberFormat::Int32 | NumberFormat::Float32 => 4,
            NumberFormat::Float64 => 8,
        }
    }

    /// Whether integer values of this format carry a sign bit
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            NumberFormat::Int8 | NumberFormat::Int16 | NumberFormat::Int32
        )
    }

    /// Whether this is an IEEE 754 float format
    pub const fn is_float(self) -> bool {
        matches!(self, NumberFormat::Float32 | NumberFormat::Float64)
    }

    /// Read `size` bytes at `offset` and interpret them in this format.
    ///
    /// Integer formats may be read from fewer bytes than their width (packed
    /// GATT fields such as uint24); the value is sign-extended for signed
    /// formats. Floats always use their full width. Returns `None` when the
    /// buffer is too short.
    pub fn read(self, bytes: &[u8], offset: usize, size: usize, endian: Endian) -> Option<f64> {
        let raw = bytes.get(offset..offset.checked_add(size)?)?;

        if self.is_float() {
            return match (self, raw.len()) {
                (NumberFormat::Float32, 4) => {
                    let b = [raw[0], raw[1], raw[2], raw[3]];
                    Some(match endian {
                        Endian::Little => f32::from_le_bytes(b),
                        Endian::Big => f32::from_be_bytes(b),
                    } as f64)
                }
                (NumberFormat::Float64, 8) => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(raw);
                    Some(match endian {
                        Endian::Little => f64::from_le_bytes(b),
                        Endian::Big => f64::from_be_bytes(b),
                    })
                }
                _ => None,
            };
        }

        if size == 0 || size > self.width() {
            return None;
        }

        let mut value: u64 = 0;
        match endian {
            Endian::Little => {
                for (i, byte) in raw.iter().enumerate() {
                    value |= (*byte as u64) << (8 * i);
                }
            }
            Endian::Big => {
                for byte in raw {
                    value = (value << 8) | *byte as u64;
                }
            }
        }

        if self.is_signed() {
            let shift = 64 - 8 * size as u32;
            Some(((value << shift) as i64 >> shift) as f64)
        } else {
            Some(value as f64)
        }
    }

    /// Store `value` at `offset` using the full width of this format.
    ///
    /// Integers are truncated toward zero and wrapped modulo 2^bits, so any
    /// finite value stores its low-order bits.
    /// Returns `None` when the value does not fit in the buffer.
    pub fn write(self, buffer: &mut [u8], offset: usize, value: f64, endian: Endian) -> Option<()> {
        let width = self.width();
        let slot = buffer.get_mut(offset..offset.checked_add(width)?)?;

        let bytes: Vec<u8> = match self {
            NumberFormat::Float32 => match endian {
                Endian::Little => (value as f32).to_le_bytes().to_vec(),
                Endian::Big => (value as f32).to_be_bytes().to_vec(),
            },
            NumberFormat::Float64 => match endian {
                Endian::Little => value.to_le_bytes().to_vec(),
                Endian::Big => value.to_be_bytes().to_vec(),
            },
            _ => {
                let modulus = 2f64.powi(8 * width as i32);
                let wide = value.trunc().rem_euclid(modulus) as u64;
                let le = wide.to_le_bytes();
                let mut out = le[..width].to_vec();
                if endian == Endian::Big {
                    out.reverse();
                }
                out
            }
        };

        slot.copy_from_slice(&bytes);
        Some(())
    }
}

impl fmt::Display for NumberFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumberFormat::Uint8 => write!(f, "Uint8"),
            NumberFormat::Uint16 => write!(f, "Uint16"),
            NumberFormat::Uint32 => write!(f, "Uint32"),
            NumberFormat::Int8 => write!(f, "Int8"),
            NumberFormat::Int16 => write!(f, "Int16"),
            NumberFormat::Int32 => write!(f, "Int32"),
            NumberFormat::Float32 => write!(f, "Float32"),
            NumberFormat::Float64 => write!(f, "Float64"),
        }
    }
}

/// Heart rate sensor body location (Body Sensor Location characteristic)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum SensorLocation {
    Other = 0,
    Chest = 1,
    Wrist = 2,
    Finger = 3,
    Hand = 4,
    EarLobe = 5,
    Foot = 6,
    Unknown = 0xFF,
}

impl SensorLocation {
    /// Convert a location code to a SensorLocation
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => SensorLocation::Other,
            1 => SensorLocation::Chest,
            2 => SensorLocation::Wrist,
            3 => SensorLocation::Finger,
            4 => SensorLocation::Hand,
            5 => SensorLocation::EarLobe,
            6 => SensorLocation::Foot,
            _ => SensorLocation::Unknown,
        }
    }
}

impl fmt::Display for SensorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorLocation::Other => write!(f, "Other"),
            SensorLocation::Chest => write!(f, "Chest"),
            SensorLocation::Wrist => write!(f, "Wrist"),
            SensorLocation::Finger => write!(f, "Finger"),
            SensorLocation::Hand => write!(f, "Hand"),
            SensorLocation::EarLobe => write!(f, "Ear Lobe"),
            SensorLocation::Foot => write!(f, "Foot"),
            SensorLocation::Unknown => write!(f, "Unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_widths() {
        assert_eq!(NumberFormat::Uint8.width(), 1);
        assert_eq!(NumberFormat::Int16.width(), 2);
        assert_eq!(NumberFormat::Float32.width(), 4);
        assert_eq!(NumberFormat::Float64.width(), 8);
    }

    #[test]
    fn test_read_little_endian_signed() {
        let bytes = [0xFE, 0xFF];
        assert_eq!(
            NumberFormat::Int16.read(&bytes, 0, 2, Endian::Little),
            Some(-2.0)
        );
        assert_eq!(
            NumberFormat::Uint16.read(&bytes, 0, 2, Endian::Little),
            Some(65534.0)
        );
    }

    #[test]
    fn test_read_packed_uint24() {
        let bytes = [0x01, 0x02, 0x03, 0xAA];
        assert_eq!(
            NumberFormat::Uint32.read(&bytes, 0, 3, Endian::Little),
            Some(0x030201 as f64)
        );
    }

    #[test]
    fn test_read_out_of_bounds() {
        assert_eq!(NumberFormat::Uint16.read(&[0x01], 0, 2, Endian::Little), None);
        assert_eq!(NumberFormat::Uint8.read(&[0x01], 1, 1, Endian::Little), None);
    }

    #[test]
    fn test_write_wraps_and_orders() {
        let mut buffer = [0u8; 3];
        NumberFormat::Int16
            .write(&mut buffer, 1, -2.0, Endian::Little)
            .unwrap();
        assert_eq!(buffer, [0x00, 0xFE, 0xFF]);

        NumberFormat::Uint16
            .write(&mut buffer, 0, 0x1234 as f64, Endian::Big)
            .unwrap();
        assert_eq!(&buffer[..2], &[0x12, 0x34]);

        NumberFormat::Uint8.write(&mut buffer, 0, 257.0, Endian::Big).unwrap();
        assert_eq!(buffer[0], 0x01);
    }

    #[test]
    fn test_write_wraps_beyond_i64() {
        let mut buffer = [0u8; 2];
        NumberFormat::Uint16
            .write(&mut buffer, 0, 2f64.powi(63) + 2048.0, Endian::Little)
            .unwrap();
        assert_eq!(buffer, [0x00, 0x08]);

        NumberFormat::Int16
            .write(&mut buffer, 0, -(2f64.powi(64)) - 4096.0, Endian::Little)
            .unwrap();
        assert_eq!(buffer, [0x00, 0xF0]);
    }

    #[test]
    fn test_write_overflowing_buffer() {
        let mut buffer = [0u8; 1];
        assert!(NumberFormat::Uint16
            .write(&mut buffer, 0, 1.0, Endian::Little)
            .is_none());
    }

    #[test]
    fn test_sensor_location() {
        assert_eq!(SensorLocation::from_u8(1), SensorLocation::Chest);
        assert_eq!(SensorLocation::from_u8(42), SensorLocation::Unknown);
        assert_eq!(SensorLocation::EarLobe.to_string(), "Ear Lobe");
    }
}
