//! Modbus RTU framing.
//!
//! A frame is `[slave address, function code, payload..., CRC16 lo, CRC16 hi]`.
//! The CRC is the Modbus variant (reflected polynomial 0xA001, init 0xFFFF)
//! transmitted little-endian, computed with the `crc` crate.
//!
//! # Example: read holding registers
//!
//! ```rust
//! use rig_hardware::drivers::modbus::ModbusFrame;
//!
//! let frame = ModbusFrame::read_holding_registers(2, 0x0058, 2);
//! assert_eq!(&frame.as_bytes()[..6], &[0x02, 0x03, 0x00, 0x58, 0x00, 0x02]);
//! assert!(frame.as_bytes().len() == 8);
//! ```

use crc::{Crc, CRC_16_MODBUS};
use rig_core::error::ProtocolError;

/// Function code: read holding registers.
pub const FN_READ_HOLDING_REGISTERS: u8 = 0x03;
/// Function code: write multiple registers.
pub const FN_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Largest register payload a write-multiple request may carry.
pub const MAX_WRITE_PAYLOAD: usize = 246;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC16/Modbus over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Recompute the CRC over everything but the trailing two bytes and compare.
pub fn verify_crc(frame: &[u8]) -> Result<(), ProtocolError> {
    if frame.len() < 4 {
        return Err(ProtocolError::ShortFrame {
            len: frame.len(),
            min: 4,
        });
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = crc16(body);
    if received == computed {
        Ok(())
    } else {
        Err(ProtocolError::CrcMismatch { received, computed })
    }
}

/// Whether `reply` acknowledges a write-multiple request.
///
/// At least six bytes must arrive and byte 1 must echo function 0x10.
pub fn is_write_ack(reply: &[u8]) -> bool {
    reply.len() >= 6 && reply[1] == FN_WRITE_MULTIPLE_REGISTERS
}

/// An immutable, CRC-terminated Modbus RTU frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusFrame {
    bytes: Vec<u8>,
}

impl ModbusFrame {
    fn seal(mut body: Vec<u8>) -> Self {
        let crc = crc16(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        Self { bytes: body }
    }

    /// Function 0x03 request for `count` registers starting at `start`.
    pub fn read_holding_registers(slave: u8, start: u16, count: u16) -> Self {
        let mut body = Vec::with_capacity(8);
        body.push(slave);
        body.push(FN_READ_HOLDING_REGISTERS);
        body.extend_from_slice(&start.to_be_bytes());
        body.extend_from_slice(&count.to_be_bytes());
        Self::seal(body)
    }

    /// Function 0x10 request writing `payload` (two bytes per register).
    pub fn write_multiple_registers(
        slave: u8,
        start: u16,
        payload: &[u8],
    ) -> Result<Self, ProtocolError> {
        if payload.is_empty() || payload.len() % 2 != 0 || payload.len() > MAX_WRITE_PAYLOAD {
            return Err(ProtocolError::InvalidPayload(payload.len()));
        }
        let registers = (payload.len() / 2) as u16;
        let mut body = Vec::with_capacity(9 + payload.len());
        body.push(slave);
        body.push(FN_WRITE_MULTIPLE_REGISTERS);
        body.extend_from_slice(&start.to_be_bytes());
        body.extend_from_slice(&registers.to_be_bytes());
        body.push(payload.len() as u8);
        body.extend_from_slice(payload);
        Ok(Self::seal(body))
    }

    /// Accept a received frame after checking its CRC.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        verify_crc(bytes)?;
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Wire bytes including the CRC.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Slave address.
    pub fn slave(&self) -> u8 {
        self.bytes[0]
    }

    /// Function code.
    pub fn function(&self) -> u8 {
        self.bytes[1]
    }

    /// Trailing CRC value.
    pub fn crc(&self) -> u16 {
        let n = self.bytes.len();
        u16::from_le_bytes([self.bytes[n - 2], self.bytes[n - 1]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_reference_vector() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        let frame = ModbusFrame::read_holding_registers(1, 0, 1);
        assert_eq!(
            frame.as_bytes(),
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );
    }

    #[test]
    fn verify_detects_corruption() {
        let frame = ModbusFrame::read_holding_registers(2, 0x0058, 2);
        assert!(verify_crc(frame.as_bytes()).is_ok());

        let mut corrupted = frame.as_bytes().to_vec();
        corrupted[3] ^= 0x01;
        assert!(matches!(
            verify_crc(&corrupted),
            Err(ProtocolError::CrcMismatch { .. })
        ));
        assert!(matches!(
            verify_crc(&[0x02, 0x10]),
            Err(ProtocolError::ShortFrame { len: 2, min: 4 })
        ));
    }

    #[test]
    fn write_multiple_header_counts_registers() {
        let frame = ModbusFrame::write_multiple_registers(2, 0x0058, &[0u8; 36]).unwrap();
        let bytes = frame.as_bytes();
        assert_eq!(&bytes[..7], &[0x02, 0x10, 0x00, 0x58, 0x00, 0x12, 0x24]);
        assert_eq!(bytes.len(), 7 + 36 + 2);
        assert_eq!(frame.function(), FN_WRITE_MULTIPLE_REGISTERS);
        assert!(ModbusFrame::parse(bytes).is_ok());
    }

    #[test]
    fn odd_payload_is_rejected() {
        assert_eq!(
            ModbusFrame::write_multiple_registers(2, 0, &[1, 2, 3]),
            Err(ProtocolError::InvalidPayload(3))
        );
    }

    #[test]
    fn write_ack_needs_six_bytes_and_echo() {
        assert!(is_write_ack(&[0x02, 0x10, 0x00, 0x58, 0x00, 0x12]));
        assert!(!is_write_ack(&[0x02, 0x10, 0x00, 0x58, 0x00]));
        assert!(!is_write_ack(&[0x02, 0x90, 0x02, 0x00, 0x00, 0x00]));
    }
}
