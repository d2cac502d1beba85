//! Modbus TCP function codecs.
//!
//! Each supported function code has its own codec type implementing
//! [`ModbusCodec`]. [`ModbusFunction`] is the closed set of those codecs and
//! [`ModbusFunction::from_parameters`] is the single place that maps a
//! function code to its codec.
//!
//! | Function | Request tail | Response |
//! |---|---|---|
//! | Read Coils / Discrete Inputs | start, quantity | byte count + LSB-first bits |
//! | Read Holding Registers | start, quantity | byte count + big-endian registers |
//! | Write Single Coil | address, `0xFF00`/`0x0000` | echo of the request |
//! | Write Single Register | address, value | echo of the request |
//!
//! Read Input Registers is recognized but has no encoder yet.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::params::{
    CommandBody, CommandParameters, FunctionCode, MBAP_HEADER_LEN, MbapHeader, REQUEST_FRAME_LEN,
    REQUEST_LENGTH,
};
use crate::point::{PointIdentifier, PointType};

/// Coil value for ON in a Write Single Coil request.
pub const COIL_ON: u16 = 0xFF00;

/// Coil value for OFF in a Write Single Coil request.
pub const COIL_OFF: u16 = 0x0000;

/// Bit set in the response function code of an exception.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Offset of the payload byte count in a read response.
const BYTE_COUNT_OFFSET: usize = MBAP_HEADER_LEN + 1;

/// Offset of the first payload byte in a read response.
const PAYLOAD_OFFSET: usize = BYTE_COUNT_OFFSET + 1;

/// Decoded values keyed by point, in address order.
pub type PointValues = BTreeMap<PointIdentifier, u16>;

/// Codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} is not implemented")]
    NotImplemented(FunctionCode),

    #[error("Address range {start}+{quantity} exceeds the 16-bit address space")]
    AddressOverflow { start: u16, quantity: u16 },

    #[error("Frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Device returned exception {code:#04X} for function {function:#04X}")]
    Exception { function: u8, code: u8 },
}

/// Packing and parsing for one Modbus function.
pub trait ModbusCodec {
    /// Function implemented by this codec.
    fn function_code(&self) -> FunctionCode;

    /// Header of the request.
    fn header(&self) -> &MbapHeader;

    /// Encode the request frame.
    fn pack_request(&self) -> Result<Bytes, CodecError>;

    /// Decode a response frame into point values.
    fn parse_response(&self, response: &[u8]) -> Result<PointValues, CodecError>;
}

/// Validated read-shaped request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub header: MbapHeader,
    pub start_address: u16,
    pub quantity: u16,
}

impl ReadRequest {
    fn from_parameters(code: FunctionCode, params: &CommandParameters) -> Result<Self, CodecError> {
        check_length(code, &params.header)?;

        match params.body {
            CommandBody::Read {
                start_address,
                quantity,
            } => {
                if u32::from(start_address) + u32::from(quantity) > 0x1_0000 {
                    return Err(CodecError::AddressOverflow {
                        start: start_address,
                        quantity,
                    });
                }
                Ok(Self {
                    header: params.header,
                    start_address,
                    quantity,
                })
            }
            CommandBody::Write { .. } => Err(CodecError::InvalidArgument(format!(
                "{} requires read parameters",
                code
            ))),
        }
    }

    fn pack(&self, code: FunctionCode) -> Bytes {
        pack_frame(&self.header, code, self.start_address, self.quantity)
    }
}

/// Validated write-shaped request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub header: MbapHeader,
    pub output_address: u16,
    pub value: u16,
}

impl WriteRequest {
    fn from_parameters(code: FunctionCode, params: &CommandParameters) -> Result<Self, CodecError> {
        check_length(code, &params.header)?;

        match params.body {
            CommandBody::Write {
                output_address,
                value,
            } => Ok(Self {
                header: params.header,
                output_address,
                value,
            }),
            CommandBody::Read { .. } => Err(CodecError::InvalidArgument(format!(
                "{} requires write parameters",
                code
            ))),
        }
    }
}

fn check_length(code: FunctionCode, header: &MbapHeader) -> Result<(), CodecError> {
    if header.length != REQUEST_LENGTH {
        return Err(CodecError::InvalidArgument(format!(
            "{} request length must be {}, got {}",
            code, REQUEST_LENGTH, header.length
        )));
    }
    Ok(())
}

fn pack_frame(header: &MbapHeader, code: FunctionCode, first: u16, second: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_FRAME_LEN);
    buf.put_u16(header.transaction_id);
    buf.put_u16(header.protocol_id);
    buf.put_u16(header.length);
    buf.put_u8(header.unit_id);
    buf.put_u8(code.as_u8());
    buf.put_u16(first);
    buf.put_u16(second);
    buf.freeze()
}

/// Check for an exception response and return the read payload.
fn read_payload(response: &[u8]) -> Result<&[u8], CodecError> {
    if response.len() <= BYTE_COUNT_OFFSET {
        return Err(CodecError::Truncated {
            expected: PAYLOAD_OFFSET,
            actual: response.len(),
        });
    }

    let function = response[MBAP_HEADER_LEN];
    if function & EXCEPTION_FLAG != 0 {
        return Err(CodecError::Exception {
            function: function & !EXCEPTION_FLAG,
            code: response[BYTE_COUNT_OFFSET],
        });
    }

    let byte_count = usize::from(response[BYTE_COUNT_OFFSET]);
    let end = PAYLOAD_OFFSET + byte_count;
    if response.len() < end {
        return Err(CodecError::Truncated {
            expected: end,
            actual: response.len(),
        });
    }

    Ok(&response[PAYLOAD_OFFSET..end])
}

/// Unpack LSB-first bits, stopping after `quantity` values.
fn unpack_bits(request: &ReadRequest, point_type: PointType, payload: &[u8]) -> PointValues {
    let mut values = PointValues::new();
    let quantity = usize::from(request.quantity);

    'bytes: for (i, byte) in payload.iter().enumerate() {
        for j in 0..8 {
            let index = j + 8 * i;
            if index >= quantity {
                break 'bytes;
            }
            // start + index < 65536 holds because start + quantity was validated.
            let address = request.start_address + index as u16;
            let bit = u16::from((byte >> j) & 0x01);
            values.insert(PointIdentifier::new(point_type, address), bit);
        }
    }

    values
}

/// Read Coils (0x01).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCoils {
    request: ReadRequest,
}

impl ModbusCodec for ReadCoils {
    fn function_code(&self) -> FunctionCode {
        FunctionCode::ReadCoils
    }

    fn header(&self) -> &MbapHeader {
        &self.request.header
    }

    fn pack_request(&self) -> Result<Bytes, CodecError> {
        Ok(self.request.pack(self.function_code()))
    }

    fn parse_response(&self, response: &[u8]) -> Result<PointValues, CodecError> {
        let payload = read_payload(response)?;
        Ok(unpack_bits(&self.request, PointType::DigitalOutput, payload))
    }
}

/// Read Discrete Inputs (0x02).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDiscreteInputs {
    request: ReadRequest,
}

impl ModbusCodec for ReadDiscreteInputs {
    fn function_code(&self) -> FunctionCode {
        FunctionCode::ReadDiscreteInputs
    }

    fn header(&self) -> &MbapHeader {
        &self.request.header
    }

    fn pack_request(&self) -> Result<Bytes, CodecError> {
        Ok(self.request.pack(self.function_code()))
    }

    fn parse_response(&self, response: &[u8]) -> Result<PointValues, CodecError> {
        let payload = read_payload(response)?;
        Ok(unpack_bits(&self.request, PointType::DigitalInput, payload))
    }
}

/// Read Holding Registers (0x03).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadHoldingRegisters {
    request: ReadRequest,
}

impl ModbusCodec for ReadHoldingRegisters {
    fn function_code(&self) -> FunctionCode {
        FunctionCode::ReadHoldingRegisters
    }

    fn header(&self) -> &MbapHeader {
        &self.request.header
    }

    fn pack_request(&self) -> Result<Bytes, CodecError> {
        Ok(self.request.pack(self.function_code()))
    }

    fn parse_response(&self, response: &[u8]) -> Result<PointValues, CodecError> {
        let payload = read_payload(response)?;
        let mut values = PointValues::new();

        for (i, pair) in payload.chunks_exact(2).enumerate() {
            let Some(address) = u16::try_from(i)
                .ok()
                .and_then(|offset| self.request.start_address.checked_add(offset))
            else {
                break;
            };
            let value = u16::from_be_bytes([pair[0], pair[1]]);
            values.insert(PointIdentifier::new(PointType::AnalogOutput, address), value);
        }

        Ok(values)
    }
}

/// Read Input Registers (0x04). Recognized, not yet encodable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadInputRegisters {
    request: ReadRequest,
}

impl ModbusCodec for ReadInputRegisters {
    fn function_code(&self) -> FunctionCode {
        FunctionCode::ReadInputRegisters
    }

    fn header(&self) -> &MbapHeader {
        &self.request.header
    }

    fn pack_request(&self) -> Result<Bytes, CodecError> {
        Err(CodecError::NotImplemented(self.function_code()))
    }

    fn parse_response(&self, _response: &[u8]) -> Result<PointValues, CodecError> {
        Err(CodecError::NotImplemented(self.function_code()))
    }
}

/// Write Single Coil (0x05).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSingleCoil {
    request: WriteRequest,
}

impl ModbusCodec for WriteSingleCoil {
    fn function_code(&self) -> FunctionCode {
        FunctionCode::WriteSingleCoil
    }

    fn header(&self) -> &MbapHeader {
        &self.request.header
    }

    fn pack_request(&self) -> Result<Bytes, CodecError> {
        let coil = if self.request.value != 0 {
            COIL_ON
        } else {
            COIL_OFF
        };
        Ok(pack_frame(
            &self.request.header,
            self.function_code(),
            self.request.output_address,
            coil,
        ))
    }

    /// The response is not inspected; the requested state is echoed back.
    fn parse_response(&self, _response: &[u8]) -> Result<PointValues, CodecError> {
        let mut values = PointValues::new();
        values.insert(
            PointIdentifier::new(PointType::DigitalOutput, self.request.output_address),
            u16::from(self.request.value != 0),
        );
        Ok(values)
    }
}

/// Write Single Register (0x06).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSingleRegister {
    request: WriteRequest,
}

impl ModbusCodec for WriteSingleRegister {
    fn function_code(&self) -> FunctionCode {
        FunctionCode::WriteSingleRegister
    }

    fn header(&self) -> &MbapHeader {
        &self.request.header
    }

    fn pack_request(&self) -> Result<Bytes, CodecError> {
        Ok(pack_frame(
            &self.request.header,
            self.function_code(),
            self.request.output_address,
            self.request.value,
        ))
    }

    /// The response is not inspected; the requested value is echoed back.
    fn parse_response(&self, _response: &[u8]) -> Result<PointValues, CodecError> {
        let mut values = PointValues::new();
        values.insert(
            PointIdentifier::new(PointType::AnalogOutput, self.request.output_address),
            self.request.value,
        );
        Ok(values)
    }
}

/// One codec per supported function code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusFunction {
    ReadCoils(ReadCoils),
    ReadDiscreteInputs(ReadDiscreteInputs),
    ReadHoldingRegisters(ReadHoldingRegisters),
    ReadInputRegisters(ReadInputRegisters),
    WriteSingleCoil(WriteSingleCoil),
    WriteSingleRegister(WriteSingleRegister),
}

impl ModbusFunction {
    /// Build the codec for the parameters' function code.
    ///
    /// Fails with [`CodecError::InvalidArgument`] for an unknown code, a body
    /// shape that does not match the function, or a wrong length field.
    pub fn from_parameters(params: CommandParameters) -> Result<Self, CodecError> {
        let code = FunctionCode::try_from(params.function_code)?;

        let function = match code {
            FunctionCode::ReadCoils => ModbusFunction::ReadCoils(ReadCoils {
                request: ReadRequest::from_parameters(code, &params)?,
            }),
            FunctionCode::ReadDiscreteInputs => {
                ModbusFunction::ReadDiscreteInputs(ReadDiscreteInputs {
                    request: ReadRequest::from_parameters(code, &params)?,
                })
            }
            FunctionCode::ReadHoldingRegisters => {
                ModbusFunction::ReadHoldingRegisters(ReadHoldingRegisters {
                    request: ReadRequest::from_parameters(code, &params)?,
                })
            }
            FunctionCode::ReadInputRegisters => {
                ModbusFunction::ReadInputRegisters(ReadInputRegisters {
                    request: ReadRequest::from_parameters(code, &params)?,
                })
            }
            FunctionCode::WriteSingleCoil => ModbusFunction::WriteSingleCoil(WriteSingleCoil {
                request: WriteRequest::from_parameters(code, &params)?,
            }),
            FunctionCode::WriteSingleRegister => {
                ModbusFunction::WriteSingleRegister(WriteSingleRegister {
                    request: WriteRequest::from_parameters(code, &params)?,
                })
            }
        };

        Ok(function)
    }

    fn codec(&self) -> &dyn ModbusCodec {
        match self {
            ModbusFunction::ReadCoils(f) => f,
            ModbusFunction::ReadDiscreteInputs(f) => f,
            ModbusFunction::ReadHoldingRegisters(f) => f,
            ModbusFunction::ReadInputRegisters(f) => f,
            ModbusFunction::WriteSingleCoil(f) => f,
            ModbusFunction::WriteSingleRegister(f) => f,
        }
    }

    /// Transaction id of the request.
    pub fn transaction_id(&self) -> u16 {
        self.header().transaction_id
    }
}

impl ModbusCodec for ModbusFunction {
    fn function_code(&self) -> FunctionCode {
        self.codec().function_code()
    }

    fn header(&self) -> &MbapHeader {
        self.codec().header()
    }

    fn pack_request(&self) -> Result<Bytes, CodecError> {
        self.codec().pack_request()
    }

    fn parse_response(&self, response: &[u8]) -> Result<PointValues, CodecError> {
        self.codec().parse_response(response)
    }
}
