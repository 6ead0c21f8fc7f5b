//! Modbus PDU construction and read-response parsing
//!
//! Stack-allocated buffer; only the read function codes are needed here.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::constants::{MAX_PDU_SIZE, MAX_READ_BITS, MAX_READ_REGISTERS};
use crate::error::{LinkError, Result};

/// Data region a read mapping targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionKind {
    /// FC01
    Coils,
    /// FC02
    DiscreteInputs,
    /// FC03
    HoldingRegisters,
    /// FC04
    InputRegisters,
}

impl RegionKind {
    pub fn function_code(self) -> u8 {
        match self {
            RegionKind::Coils => 0x01,
            RegionKind::DiscreteInputs => 0x02,
            RegionKind::HoldingRegisters => 0x03,
            RegionKind::InputRegisters => 0x04,
        }
    }

    /// Bit regions pack 8 points per byte, register regions 2 bytes per point
    pub fn is_bit_region(self) -> bool {
        matches!(self, RegionKind::Coils | RegionKind::DiscreteInputs)
    }

    pub fn max_count(self) -> u16 {
        if self.is_bit_region() {
            MAX_READ_BITS
        } else {
            MAX_READ_REGISTERS
        }
    }
}

impl std::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(ModbusPdu::function_code_description(self.function_code()))
    }
}

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(LinkError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();

        if let Some(fc) = pdu.function_code() {
            if pdu.is_exception() {
                debug!(
                    "PDU parsed: FC={:02X} (Exception: {}), code={:02X}",
                    fc,
                    Self::function_code_description(fc),
                    pdu.exception_code().unwrap_or(0)
                );
            }
        }

        Ok(pdu)
    }

    /// Build a read request for `count` points starting at `address`
    pub fn read_request(region: RegionKind, address: u16, count: u16) -> Result<Self> {
        if count == 0 || count > region.max_count() {
            return Err(LinkError::config(format!(
                "{} count {} out of range 1..={}",
                region,
                count,
                region.max_count()
            )));
        }
        let mut pdu = Self::new();
        pdu.push(region.function_code())?;
        pdu.push_u16(address)?;
        pdu.push_u16(count)?;
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(LinkError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & 0x80 != 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }

    /// Decode a read response into `count` booleans
    ///
    /// Bits unpack LSB-first; registers read as `value != 0`.
    pub fn parse_read_response(&self, region: RegionKind, count: u16) -> Result<Vec<bool>> {
        let fc = self
            .function_code()
            .ok_or_else(|| LinkError::protocol("Empty response PDU"))?;

        if self.is_exception() {
            return Err(LinkError::ModbusException {
                function: fc,
                code: self.exception_code().unwrap_or(0),
            });
        }
        if fc != region.function_code() {
            return Err(LinkError::protocol(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                region.function_code(),
                fc
            )));
        }

        let payload = self.as_slice();
        if payload.len() < 2 {
            return Err(LinkError::protocol("Truncated read response"));
        }
        let byte_count = payload[1] as usize;
        let body = &payload[2..];
        if body.len() != byte_count {
            return Err(LinkError::protocol(format!(
                "Byte count mismatch: header {}, body {}",
                byte_count,
                body.len()
            )));
        }

        let count = count as usize;
        if region.is_bit_region() {
            if byte_count < count.div_ceil(8) {
                return Err(LinkError::protocol(format!(
                    "Short bit response: {} bytes for {} points",
                    byte_count, count
                )));
            }
            Ok((0..count)
                .map(|i| body[i / 8] & (1 << (i % 8)) != 0)
                .collect())
        } else {
            if byte_count < count * 2 {
                return Err(LinkError::protocol(format!(
                    "Short register response: {} bytes for {} registers",
                    byte_count, count
                )));
            }
            Ok(body
                .chunks_exact(2)
                .take(count)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]) != 0)
                .collect())
        }
    }

    /// Get human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & 0x7F {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            _ => "Unknown Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_read_request_layout() {
        let pdu = ModbusPdu::read_request(RegionKind::DiscreteInputs, 0x0010, 2).unwrap();
        assert_eq!(pdu.as_slice(), &[0x02, 0x00, 0x10, 0x00, 0x02]);

        let pdu = ModbusPdu::read_request(RegionKind::HoldingRegisters, 100, 3).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x64, 0x00, 0x03]);
    }

    #[test]
    fn test_read_request_count_limits() {
        assert!(ModbusPdu::read_request(RegionKind::Coils, 0, 0).is_err());
        assert!(ModbusPdu::read_request(RegionKind::Coils, 0, 2000).is_ok());
        assert!(ModbusPdu::read_request(RegionKind::InputRegisters, 0, 126).is_err());
    }

    #[test]
    fn test_parse_bits_lsb_first() {
        // 10 points: bits 0, 3 and 9 set
        let pdu = ModbusPdu::from_slice(&[0x02, 0x02, 0b0000_1001, 0b0000_0010]).unwrap();
        let values = pdu.parse_read_response(RegionKind::DiscreteInputs, 10).unwrap();
        assert_eq!(values.len(), 10);
        assert!(values[0]);
        assert!(!values[1]);
        assert!(values[3]);
        assert!(values[9]);
        assert_eq!(values.iter().filter(|v| **v).count(), 3);
    }

    #[test]
    fn test_parse_registers_nonzero() {
        let pdu = ModbusPdu::from_slice(&[0x04, 0x06, 0x00, 0x00, 0x01, 0x00, 0x00, 0x01])
            .unwrap();
        let values = pdu.parse_read_response(RegionKind::InputRegisters, 3).unwrap();
        assert_eq!(values, vec![false, true, true]);
    }

    #[test]
    fn test_parse_exception() {
        let pdu = ModbusPdu::from_slice(&[0x82, 0x02]).unwrap();
        let err = pdu
            .parse_read_response(RegionKind::DiscreteInputs, 2)
            .unwrap_err();
        assert_eq!(
            err,
            LinkError::ModbusException {
                function: 0x82,
                code: 0x02
            }
        );
    }

    #[test]
    fn test_parse_rejects_mismatch() {
        let pdu = ModbusPdu::from_slice(&[0x01, 0x01, 0x03]).unwrap();
        assert!(pdu.parse_read_response(RegionKind::DiscreteInputs, 2).is_err());

        let pdu = ModbusPdu::from_slice(&[0x02, 0x02, 0x03]).unwrap();
        assert!(pdu.parse_read_response(RegionKind::DiscreteInputs, 2).is_err());
    }
}
