use crate::encoding::{Reader, Writer};
use crate::pdu::{
    ExceptionResponse, FunctionCode, MaskWriteRequest, Table, WireWords, WriteCoilRequest,
    WriteRegisterRequest, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::{DecodeError, EncodeError};

fn read_payload<'a>(r: &mut Reader<'a>) -> Result<&'a [u8], DecodeError> {
    let byte_count = usize::from(r.read_u8()?);
    if byte_count == 0 {
        return Err(DecodeError::InvalidLength);
    }
    r.read_exact(byte_count)
}

fn read_words<'a>(r: &mut Reader<'a>) -> Result<WireWords<'a>, DecodeError> {
    let payload = read_payload(r)?;
    if payload.len() % 2 != 0 || payload.len() > usize::from(MAX_READ_REGISTERS) * 2 {
        return Err(DecodeError::InvalidLength);
    }
    Ok(WireWords::new(payload))
}

fn read_echo(r: &mut Reader<'_>, max: u16) -> Result<(u16, u16), DecodeError> {
    let address = r.read_be_u16()?;
    let quantity = r.read_be_u16()?;
    if quantity == 0 || quantity > max {
        return Err(DecodeError::InvalidValue);
    }
    Ok((address, quantity))
}

fn write_payload(w: &mut Writer<'_>, function: FunctionCode, data: &[u8]) -> Result<(), EncodeError> {
    let byte_count = u8::try_from(data.len()).map_err(|_| EncodeError::ValueOutOfRange)?;
    w.write_u8(function.as_u8())?;
    w.write_u8(byte_count)?;
    w.write_all(data)
}

/// A response PDU, borrowing any payload from the received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    /// FC01/FC02: LSB-first packed states, padded to whole bytes.
    ReadBits { table: Table, packed: &'a [u8] },
    /// FC03/FC04.
    ReadRegisters { table: Table, words: WireWords<'a> },
    WriteCoil(WriteCoilRequest),
    WriteRegister(WriteRegisterRequest),
    WriteCoils { address: u16, quantity: u16 },
    WriteRegisters { address: u16, quantity: u16 },
    MaskWrite(MaskWriteRequest),
    ReadWriteRegisters { words: WireWords<'a> },
    Exception(ExceptionResponse),
}

impl<'a> Response<'a> {
    /// The function byte as it appears on the wire, exception bit included.
    pub fn function_byte(&self) -> u8 {
        match self {
            Self::ReadBits { table, .. } | Self::ReadRegisters { table, .. } => {
                table.read_function().as_u8()
            }
            Self::WriteCoil(_) => FunctionCode::WriteSingleCoil.as_u8(),
            Self::WriteRegister(_) => FunctionCode::WriteSingleRegister.as_u8(),
            Self::WriteCoils { .. } => FunctionCode::WriteMultipleCoils.as_u8(),
            Self::WriteRegisters { .. } => FunctionCode::WriteMultipleRegisters.as_u8(),
            Self::MaskWrite(_) => FunctionCode::MaskWriteRegister.as_u8(),
            Self::ReadWriteRegisters { .. } => FunctionCode::ReadWriteMultipleRegisters.as_u8(),
            Self::Exception(ex) => ex.function_code | 0x80,
        }
    }

    pub fn decode(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let function_byte = r.read_u8()?;
        if FunctionCode::is_exception(function_byte) {
            return Ok(Self::Exception(ExceptionResponse::decode(function_byte, r)?));
        }

        let function = FunctionCode::from_u8(function_byte)?;
        Ok(match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => Self::ReadBits {
                table: function.table(),
                packed: read_payload(r)?,
            },
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                Self::ReadRegisters {
                    table: function.table(),
                    words: read_words(r)?,
                }
            }
            FunctionCode::WriteSingleCoil => {
                let address = r.read_be_u16()?;
                let value = match r.read_be_u16()? {
                    0xFF00 => true,
                    0x0000 => false,
                    _ => return Err(DecodeError::InvalidValue),
                };
                Self::WriteCoil(WriteCoilRequest { address, value })
            }
            FunctionCode::WriteSingleRegister => Self::WriteRegister(WriteRegisterRequest {
                address: r.read_be_u16()?,
                value: r.read_be_u16()?,
            }),
            FunctionCode::WriteMultipleCoils => {
                let (address, quantity) = read_echo(r, MAX_WRITE_COILS)?;
                Self::WriteCoils { address, quantity }
            }
            FunctionCode::WriteMultipleRegisters => {
                let (address, quantity) = read_echo(r, MAX_WRITE_REGISTERS)?;
                Self::WriteRegisters { address, quantity }
            }
            FunctionCode::MaskWriteRegister => Self::MaskWrite(MaskWriteRequest {
                address: r.read_be_u16()?,
                and_mask: r.read_be_u16()?,
                or_mask: r.read_be_u16()?,
            }),
            FunctionCode::ReadWriteMultipleRegisters => Self::ReadWriteRegisters {
                words: read_words(r)?,
            },
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Self::ReadBits { table, packed } => write_payload(w, table.read_function(), packed),
            Self::ReadRegisters { table, words } => {
                write_payload(w, table.read_function(), words.as_bytes())
            }
            Self::WriteCoil(echo) => echo.encode(w),
            Self::WriteRegister(echo) => echo.encode(w),
            Self::WriteCoils { address, quantity } => {
                w.write_u8(FunctionCode::WriteMultipleCoils.as_u8())?;
                w.write_be_u16(*address)?;
                w.write_be_u16(*quantity)
            }
            Self::WriteRegisters { address, quantity } => {
                w.write_u8(FunctionCode::WriteMultipleRegisters.as_u8())?;
                w.write_be_u16(*address)?;
                w.write_be_u16(*quantity)
            }
            Self::MaskWrite(echo) => echo.encode(w),
            Self::ReadWriteRegisters { words } => write_payload(
                w,
                FunctionCode::ReadWriteMultipleRegisters,
                words.as_bytes(),
            ),
            Self::Exception(ex) => ex.encode(w),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Response;
    use crate::encoding::{Reader, Writer};
    use crate::pdu::{ExceptionCode, MaskWriteRequest, Table, WireWords, WriteCoilRequest};
    use crate::DecodeError;

    fn roundtrip(original: Response<'_>, wire: &[u8]) {
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        original.encode(&mut w).unwrap();
        assert_eq!(w.as_written(), wire);

        let mut r = Reader::new(wire);
        assert_eq!(Response::decode(&mut r).unwrap(), original);
        assert!(r.is_empty());
    }

    #[test]
    fn register_reads() {
        roundtrip(
            Response::ReadRegisters {
                table: Table::InputRegisters,
                words: WireWords::new(&[0x12, 0x34, 0xAB, 0xCD]),
            },
            &[0x04, 0x04, 0x12, 0x34, 0xAB, 0xCD],
        );
    }

    #[test]
    fn echo_responses() {
        roundtrip(
            Response::WriteCoil(WriteCoilRequest {
                address: 7,
                value: true,
            }),
            &[0x05, 0x00, 0x07, 0xFF, 0x00],
        );
        roundtrip(
            Response::MaskWrite(MaskWriteRequest {
                address: 7,
                and_mask: 0xFF00,
                or_mask: 0x00A5,
            }),
            &[0x16, 0x00, 0x07, 0xFF, 0x00, 0x00, 0xA5],
        );
        roundtrip(
            Response::WriteRegisters {
                address: 1,
                quantity: 2,
            },
            &[0x10, 0x00, 0x01, 0x00, 0x02],
        );
    }

    #[test]
    fn exception_with_unknown_code() {
        let mut r = Reader::new(&[0x83, 0x19]);
        match Response::decode(&mut r).unwrap() {
            Response::Exception(ex) => {
                assert_eq!(ex.function_code, 0x03);
                assert_eq!(ex.exception_code, ExceptionCode::Unknown(0x19));
            }
            other => panic!("expected exception, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_bodies() {
        let mut r = Reader::new(&[0x05, 0x00, 0x01, 0x12, 0x34]);
        assert_eq!(Response::decode(&mut r).unwrap_err(), DecodeError::InvalidValue);

        let mut r = Reader::new(&[0x03, 0x03, 0x00, 0x01, 0x02]);
        assert_eq!(Response::decode(&mut r).unwrap_err(), DecodeError::InvalidLength);

        let mut r = Reader::new(&[0x01, 0x02, 0x01]);
        assert_eq!(Response::decode(&mut r).unwrap_err(), DecodeError::UnexpectedEof);

        let mut r = Reader::new(&[0x0F, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(Response::decode(&mut r).unwrap_err(), DecodeError::InvalidValue);
    }

    #[test]
    fn function_byte_reflects_exception_bit() {
        let resp = Response::ReadBits {
            table: Table::DiscreteInputs,
            packed: &[0x01],
        };
        assert_eq!(resp.function_byte(), 0x02);
        let mut r = Reader::new(&[0x90, 0x02]);
        assert_eq!(Response::decode(&mut r).unwrap().function_byte(), 0x90);
    }
}
