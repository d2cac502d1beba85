//! In-process Modbus slave.
//!
//! [`SimulatedDevice`] executes commands synchronously against its own
//! register banks. Requests are packed to bytes, decoded as a slave would,
//! answered with a response frame, and that frame is parsed by the same
//! codec used for TCP. Useful without hardware and as a test harness.
//!
//! Quantity limits are enforced as on a real slave: at most 2000 coils or
//! discrete inputs and 125 holding registers per read. Input registers are
//! not served.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::{COIL_OFF, COIL_ON, CodecError, EXCEPTION_FLAG, ModbusCodec, ModbusFunction};
use crate::executor::{ExecutorError, FunctionExecutor, UpdateSender, check_exception, deliver};
use crate::params::{CommandBody, CommandParameters, FunctionCode, MbapHeader};

/// Exception code for a function the device does not serve.
const ILLEGAL_FUNCTION: u8 = 0x01;

/// Exception code for an illegal data value.
const ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Most coils or discrete inputs a single read may return.
const MAX_READ_BITS: u16 = 2000;

/// Most registers a single read may return.
const MAX_READ_REGISTERS: u16 = 125;

#[derive(Debug, Default)]
struct Banks {
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    holding_registers: HashMap<u16, u16>,
    requests: Vec<CommandParameters>,
}

/// Simulated Modbus device.
///
/// Unset addresses read as zero.
#[derive(Debug)]
pub struct SimulatedDevice {
    banks: Mutex<Banks>,
    updates: UpdateSender,
}

impl SimulatedDevice {
    pub fn new(updates: UpdateSender) -> Self {
        Self {
            banks: Mutex::new(Banks::default()),
            updates,
        }
    }

    pub fn set_coil(&self, address: u16, on: bool) {
        self.banks.lock().coils.insert(address, on);
    }

    pub fn coil(&self, address: u16) -> bool {
        self.banks.lock().coils.get(&address).copied().unwrap_or(false)
    }

    pub fn set_discrete_input(&self, address: u16, on: bool) {
        self.banks.lock().discrete_inputs.insert(address, on);
    }

    pub fn discrete_input(&self, address: u16) -> bool {
        self.banks
            .lock()
            .discrete_inputs
            .get(&address)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_holding_register(&self, address: u16, value: u16) {
        self.banks.lock().holding_registers.insert(address, value);
    }

    pub fn holding_register(&self, address: u16) -> u16 {
        self.banks
            .lock()
            .holding_registers
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Requests served so far, oldest first.
    pub fn requests(&self) -> Vec<CommandParameters> {
        self.banks.lock().requests.clone()
    }

    /// Drain the request log.
    pub fn take_requests(&self) -> Vec<CommandParameters> {
        std::mem::take(&mut self.banks.lock().requests)
    }

    /// Answer one request frame as a slave would.
    pub fn respond(&self, request: &[u8]) -> Result<BytesMut, CodecError> {
        let params = CommandParameters::decode(request)?;
        let code = FunctionCode::try_from(params.function_code)?;
        trace!(?params, "Simulated device request");

        let mut banks = self.banks.lock();
        banks.requests.push(params);

        let response = match (code, params.body) {
            (
                FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs,
                CommandBody::Read { quantity, .. },
            ) if quantity == 0 || quantity > MAX_READ_BITS => {
                debug!(quantity, "Bit read quantity out of range");
                exception_response(&params.header, code, ILLEGAL_DATA_VALUE)?
            }
            (
                FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs,
                CommandBody::Read {
                    start_address,
                    quantity,
                },
            ) => {
                let bank = if code == FunctionCode::ReadCoils {
                    &banks.coils
                } else {
                    &banks.discrete_inputs
                };
                let mut payload = vec![0u8; usize::from(quantity).div_ceil(8)];
                for i in 0..quantity {
                    let on = start_address
                        .checked_add(i)
                        .and_then(|address| bank.get(&address))
                        .copied()
                        .unwrap_or(false);
                    if on {
                        payload[usize::from(i / 8)] |= 1 << (i % 8);
                    }
                }
                read_response(&params.header, code, &payload)?
            }
            (FunctionCode::ReadHoldingRegisters, CommandBody::Read { quantity, .. })
                if quantity == 0 || quantity > MAX_READ_REGISTERS =>
            {
                debug!(quantity, "Register read quantity out of range");
                exception_response(&params.header, code, ILLEGAL_DATA_VALUE)?
            }
            (
                FunctionCode::ReadHoldingRegisters,
                CommandBody::Read {
                    start_address,
                    quantity,
                },
            ) => {
                let bank = &banks.holding_registers;
                let mut payload = Vec::with_capacity(usize::from(quantity) * 2);
                for i in 0..quantity {
                    let value = start_address
                        .checked_add(i)
                        .and_then(|address| bank.get(&address))
                        .copied()
                        .unwrap_or(0);
                    payload.extend_from_slice(&value.to_be_bytes());
                }
                read_response(&params.header, code, &payload)?
            }
            (FunctionCode::ReadInputRegisters, _) => {
                exception_response(&params.header, code, ILLEGAL_FUNCTION)?
            }
            (
                FunctionCode::WriteSingleCoil,
                CommandBody::Write {
                    output_address,
                    value,
                },
            ) => match value {
                COIL_ON | COIL_OFF => {
                    banks.coils.insert(output_address, value == COIL_ON);
                    echo(request)
                }
                _ => exception_response(&params.header, code, ILLEGAL_DATA_VALUE)?,
            },
            (
                FunctionCode::WriteSingleRegister,
                CommandBody::Write {
                    output_address,
                    value,
                },
            ) => {
                banks.holding_registers.insert(output_address, value);
                echo(request)
            }
            _ => {
                return Err(CodecError::InvalidArgument(format!(
                    "{} with mismatched body",
                    code
                )));
            }
        };

        Ok(response)
    }
}

impl FunctionExecutor for SimulatedDevice {
    fn enqueue(&self, function: ModbusFunction) -> Result<(), ExecutorError> {
        let request = function.pack_request()?;
        let response = self.respond(&request)?;
        check_exception(&response)?;

        let values = function.parse_response(&response)?;
        let count = deliver(&self.updates, values);
        debug!(
            transaction_id = function.transaction_id(),
            "Simulated {} returned {} value(s)",
            function.function_code(),
            count
        );
        Ok(())
    }
}

fn put_header(
    buf: &mut BytesMut,
    header: &MbapHeader,
    pdu_len: usize,
    function: u8,
) -> Result<(), CodecError> {
    // The length field also counts the unit id.
    let length = u16::try_from(pdu_len + 1).map_err(|_| {
        CodecError::InvalidArgument(format!("response PDU of {} bytes does not fit a frame", pdu_len))
    })?;
    buf.put_u16(header.transaction_id);
    buf.put_u16(header.protocol_id);
    buf.put_u16(length);
    buf.put_u8(header.unit_id);
    buf.put_u8(function);
    Ok(())
}

fn read_response(
    header: &MbapHeader,
    code: FunctionCode,
    payload: &[u8],
) -> Result<BytesMut, CodecError> {
    let byte_count = u8::try_from(payload.len()).map_err(|_| {
        CodecError::InvalidArgument(format!(
            "{} payload of {} bytes exceeds the byte count field",
            code,
            payload.len()
        ))
    })?;
    let mut buf = BytesMut::with_capacity(9 + payload.len());
    put_header(&mut buf, header, 2 + payload.len(), code.as_u8())?;
    buf.put_u8(byte_count);
    buf.put_slice(payload);
    Ok(buf)
}

fn exception_response(
    header: &MbapHeader,
    code: FunctionCode,
    exception: u8,
) -> Result<BytesMut, CodecError> {
    let mut buf = BytesMut::with_capacity(9);
    put_header(&mut buf, header, 2, code.as_u8() | EXCEPTION_FLAG)?;
    buf.put_u8(exception);
    Ok(buf)
}

fn echo(request: &[u8]) -> BytesMut {
    BytesMut::from(request)
}
