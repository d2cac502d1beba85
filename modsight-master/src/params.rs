//! Modbus TCP command parameters.
//!
//! Every request starts with the 7-byte MBAP header followed by the function
//! code. All multi-byte fields are big-endian:
//!
//! ```text
//! [0:2) transaction id  [2:4) protocol id (0)  [4:6) length  [6] unit id  [7] function code
//! ```

use std::fmt;

use bytes::Buf;

use crate::codec::CodecError;

/// Size of the MBAP header (transaction, protocol, length, unit).
pub const MBAP_HEADER_LEN: usize = 7;

/// Protocol identifier for Modbus.
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Length field of every request built here: unit + function + two 16-bit fields.
pub const REQUEST_LENGTH: u16 = 6;

/// Size of a complete request frame.
pub const REQUEST_FRAME_LEN: usize = MBAP_HEADER_LEN + REQUEST_LENGTH as usize - 1;

/// Modbus function codes understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
}

impl FunctionCode {
    /// Wire value of the code.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the function carries read-shaped parameters.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
        }
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            other => Err(CodecError::InvalidArgument(format!(
                "unsupported function code 0x{:02X}",
                other
            ))),
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.as_u8())
    }
}

/// MBAP header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Number of bytes following the length field.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Decode the first seven bytes of a frame.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < MBAP_HEADER_LEN {
            return Err(CodecError::Truncated {
                expected: MBAP_HEADER_LEN,
                actual: frame.len(),
            });
        }

        let mut buf = &frame[..MBAP_HEADER_LEN];
        Ok(Self {
            transaction_id: buf.get_u16(),
            protocol_id: buf.get_u16(),
            length: buf.get_u16(),
            unit_id: buf.get_u8(),
        })
    }
}

/// Function-specific part of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBody {
    Read { start_address: u16, quantity: u16 },
    Write { output_address: u16, value: u16 },
}

/// Everything needed to build one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandParameters {
    pub header: MbapHeader,
    /// Raw function code; validated when the codec is built.
    pub function_code: u8,
    pub body: CommandBody,
}

impl CommandParameters {
    /// Read-shaped parameters.
    pub fn read(
        length: u16,
        function_code: u8,
        start_address: u16,
        quantity: u16,
        transaction_id: u16,
        unit_id: u8,
    ) -> Self {
        Self {
            header: MbapHeader {
                transaction_id,
                protocol_id: MODBUS_PROTOCOL_ID,
                length,
                unit_id,
            },
            function_code,
            body: CommandBody::Read {
                start_address,
                quantity,
            },
        }
    }

    /// Write-shaped parameters.
    pub fn write(
        length: u16,
        function_code: u8,
        output_address: u16,
        value: u16,
        transaction_id: u16,
        unit_id: u8,
    ) -> Self {
        Self {
            header: MbapHeader {
                transaction_id,
                protocol_id: MODBUS_PROTOCOL_ID,
                length,
                unit_id,
            },
            function_code,
            body: CommandBody::Write {
                output_address,
                value,
            },
        }
    }

    /// Decode a request frame back into parameters.
    ///
    /// The body shape follows the function code; unknown codes are rejected.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < REQUEST_FRAME_LEN {
            return Err(CodecError::Truncated {
                expected: REQUEST_FRAME_LEN,
                actual: frame.len(),
            });
        }

        let header = MbapHeader::decode(frame)?;
        let function_code = frame[MBAP_HEADER_LEN];
        let code = FunctionCode::try_from(function_code)?;

        let mut tail = &frame[MBAP_HEADER_LEN + 1..REQUEST_FRAME_LEN];
        let first = tail.get_u16();
        let second = tail.get_u16();

        let body = if code.is_read() {
            CommandBody::Read {
                start_address: first,
                quantity: second,
            }
        } else {
            CommandBody::Write {
                output_address: first,
                value: second,
            }
        };

        Ok(Self {
            header,
            function_code,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_round_trip() {
        for code in 1u8..=6 {
            assert_eq!(FunctionCode::try_from(code).unwrap().as_u8(), code);
        }
    }

    #[test]
    fn test_unknown_function_code_names_code() {
        let err = FunctionCode::try_from(0x2B).unwrap_err();
        assert!(matches!(err, CodecError::InvalidArgument(_)));
        assert!(err.to_string().contains("0x2B"));
    }

    #[test]
    fn test_header_decode() {
        let frame = [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03];
        let header = MbapHeader::decode(&frame).unwrap();
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.length, 6);
        assert_eq!(header.unit_id, 1);

        assert!(MbapHeader::decode(&frame[..5]).is_err());
    }

    #[test]
    fn test_decode_write_request() {
        let frame = [0x00, 0x09, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x0F, 0xA0, 0xFF, 0x00];
        let params = CommandParameters::decode(&frame).unwrap();

        assert_eq!(params.function_code, 0x05);
        assert_eq!(params.header.transaction_id, 9);
        assert_eq!(
            params.body,
            CommandBody::Write {
                output_address: 4000,
                value: 0xFF00
            }
        );
    }
}
