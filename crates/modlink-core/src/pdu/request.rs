use crate::codec::pack_bits;
use crate::encoding::{Reader, Writer};
use crate::pdu::{FunctionCode, PackedBits, Table, WireWords};
use crate::{DecodeError, EncodeError};

pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_COILS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;
pub const MAX_RW_WRITE_REGISTERS: u16 = 121;
/// Number of addressable entries per table.
pub const ADDRESS_SPACE: u32 = 0x1_0000;

/// Which bound a request field violates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RangeError {
    /// Quantity is zero or above the function's ceiling.
    Quantity,
    /// `address + quantity` runs past the end of the table.
    Address,
}

impl From<RangeError> for EncodeError {
    fn from(_: RangeError) -> Self {
        EncodeError::ValueOutOfRange
    }
}

/// Check a `(address, quantity)` pair against a per-function ceiling.
pub fn check_span(address: u16, quantity: usize, max: u16) -> Result<u16, RangeError> {
    let quantity = u16::try_from(quantity).map_err(|_| RangeError::Quantity)?;
    if quantity == 0 || quantity > max {
        return Err(RangeError::Quantity);
    }
    if u32::from(address) + u32::from(quantity) > ADDRESS_SPACE {
        return Err(RangeError::Address);
    }
    Ok(quantity)
}

fn check_decoded_quantity(quantity: u16, max: u16) -> Result<(), DecodeError> {
    if quantity == 0 || quantity > max {
        return Err(DecodeError::InvalidValue);
    }
    Ok(())
}

fn read_byte_count(r: &mut Reader<'_>, expected: usize) -> Result<usize, DecodeError> {
    let byte_count = usize::from(r.read_u8()?);
    if byte_count != expected {
        return Err(DecodeError::InvalidLength);
    }
    Ok(byte_count)
}

fn coil_word(value: bool) -> u16 {
    if value {
        0xFF00
    } else {
        0x0000
    }
}

fn decode_coil_word(raw: u16) -> Result<bool, DecodeError> {
    match raw {
        0xFF00 => Ok(true),
        0x0000 => Ok(false),
        _ => Err(DecodeError::InvalidValue),
    }
}

/// FC01 to FC04: read `quantity` entries of `table` starting at `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadRequest {
    pub table: Table,
    pub address: u16,
    pub quantity: u16,
}

impl ReadRequest {
    pub const fn function_code(&self) -> FunctionCode {
        self.table.read_function()
    }

    pub const fn max_quantity(table: Table) -> u16 {
        if table.is_bit() {
            MAX_READ_BITS
        } else {
            MAX_READ_REGISTERS
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        check_span(
            self.address,
            usize::from(self.quantity),
            Self::max_quantity(self.table),
        )?;
        w.write_u8(self.function_code().as_u8())?;
        w.write_be_u16(self.address)?;
        w.write_be_u16(self.quantity)
    }
}

/// FC05.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriteCoilRequest {
    pub address: u16,
    pub value: bool,
}

impl WriteCoilRequest {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::WriteSingleCoil.as_u8())?;
        w.write_be_u16(self.address)?;
        w.write_be_u16(coil_word(self.value))
    }
}

/// FC06.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriteRegisterRequest {
    pub address: u16,
    pub value: u16,
}

impl WriteRegisterRequest {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::WriteSingleRegister.as_u8())?;
        w.write_be_u16(self.address)?;
        w.write_be_u16(self.value)
    }
}

/// FC15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCoilsRequest<'a> {
    pub address: u16,
    pub values: &'a [bool],
}

impl WriteCoilsRequest<'_> {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let quantity = check_span(self.address, self.values.len(), MAX_WRITE_COILS)?;
        let mut packed = [0u8; MAX_WRITE_COILS as usize / 8];
        let used = pack_bits(self.values, &mut packed)?;

        w.write_u8(FunctionCode::WriteMultipleCoils.as_u8())?;
        w.write_be_u16(self.address)?;
        w.write_be_u16(quantity)?;
        w.write_u8(used as u8)?;
        w.write_all(&packed[..used])
    }
}

/// FC16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRegistersRequest<'a> {
    pub address: u16,
    pub values: &'a [u16],
}

impl WriteRegistersRequest<'_> {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let quantity = check_span(self.address, self.values.len(), MAX_WRITE_REGISTERS)?;
        w.write_u8(FunctionCode::WriteMultipleRegisters.as_u8())?;
        w.write_be_u16(self.address)?;
        w.write_be_u16(quantity)?;
        w.write_u8((quantity * 2) as u8)?;
        w.write_be_words(self.values)
    }
}

/// FC22. The slave stores `(current & and_mask) | (or_mask & !and_mask)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MaskWriteRequest {
    pub address: u16,
    pub and_mask: u16,
    pub or_mask: u16,
}

impl MaskWriteRequest {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::MaskWriteRegister.as_u8())?;
        w.write_be_u16(self.address)?;
        w.write_be_u16(self.and_mask)?;
        w.write_be_u16(self.or_mask)
    }
}

/// FC23. The write is applied before the read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWriteRegistersRequest<'a> {
    pub read_address: u16,
    pub read_quantity: u16,
    pub write_address: u16,
    pub values: &'a [u16],
}

impl ReadWriteRegistersRequest<'_> {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        check_span(
            self.read_address,
            usize::from(self.read_quantity),
            MAX_READ_REGISTERS,
        )?;
        let write_quantity =
            check_span(self.write_address, self.values.len(), MAX_RW_WRITE_REGISTERS)?;

        w.write_u8(FunctionCode::ReadWriteMultipleRegisters.as_u8())?;
        w.write_be_u16(self.read_address)?;
        w.write_be_u16(self.read_quantity)?;
        w.write_be_u16(self.write_address)?;
        w.write_be_u16(write_quantity)?;
        w.write_u8((write_quantity * 2) as u8)?;
        w.write_be_words(self.values)
    }
}

/// A request about to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Read(ReadRequest),
    WriteCoil(WriteCoilRequest),
    WriteRegister(WriteRegisterRequest),
    WriteCoils(WriteCoilsRequest<'a>),
    WriteRegisters(WriteRegistersRequest<'a>),
    MaskWrite(MaskWriteRequest),
    ReadWriteRegisters(ReadWriteRegistersRequest<'a>),
}

impl Request<'_> {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Self::Read(req) => req.encode(w),
            Self::WriteCoil(req) => req.encode(w),
            Self::WriteRegister(req) => req.encode(w),
            Self::WriteCoils(req) => req.encode(w),
            Self::WriteRegisters(req) => req.encode(w),
            Self::MaskWrite(req) => req.encode(w),
            Self::ReadWriteRegisters(req) => req.encode(w),
        }
    }

    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::Read(req) => req.function_code(),
            Self::WriteCoil(_) => FunctionCode::WriteSingleCoil,
            Self::WriteRegister(_) => FunctionCode::WriteSingleRegister,
            Self::WriteCoils(_) => FunctionCode::WriteMultipleCoils,
            Self::WriteRegisters(_) => FunctionCode::WriteMultipleRegisters,
            Self::MaskWrite(_) => FunctionCode::MaskWriteRegister,
            Self::ReadWriteRegisters(_) => FunctionCode::ReadWriteMultipleRegisters,
        }
    }

    /// Length of a successful response PDU to this request.
    pub fn expected_response_len(&self) -> usize {
        match self {
            Self::Read(req) if req.table.is_bit() => 2 + usize::from(req.quantity).div_ceil(8),
            Self::Read(req) => 2 + usize::from(req.quantity) * 2,
            Self::ReadWriteRegisters(req) => 2 + usize::from(req.read_quantity) * 2,
            Self::MaskWrite(_) => 7,
            _ => 5,
        }
    }
}

/// Successful response PDU length for an encoded request PDU.
///
/// Exception responses are always [`crate::pdu::ExceptionResponse::PDU_LEN`] bytes.
pub fn expected_response_pdu_len(request_pdu: &[u8]) -> Result<usize, DecodeError> {
    let mut r = Reader::new(request_pdu);
    let function = FunctionCode::from_u8(r.read_u8()?)?;
    let _address = r.read_be_u16()?;
    let quantity = usize::from(r.read_be_u16()?);
    Ok(match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => 2 + quantity.div_ceil(8),
        FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters
        | FunctionCode::ReadWriteMultipleRegisters => 2 + quantity * 2,
        FunctionCode::MaskWriteRegister => 7,
        FunctionCode::WriteSingleCoil
        | FunctionCode::WriteSingleRegister
        | FunctionCode::WriteMultipleCoils
        | FunctionCode::WriteMultipleRegisters => 5,
    })
}

/// A request as received by a slave, borrowing its payload from the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedRequest<'a> {
    Read(ReadRequest),
    WriteCoil(WriteCoilRequest),
    WriteRegister(WriteRegisterRequest),
    WriteCoils {
        address: u16,
        bits: PackedBits<'a>,
    },
    WriteRegisters {
        address: u16,
        words: WireWords<'a>,
    },
    MaskWrite(MaskWriteRequest),
    ReadWriteRegisters {
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        words: WireWords<'a>,
    },
}

impl<'a> DecodedRequest<'a> {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::Read(req) => req.function_code(),
            Self::WriteCoil(_) => FunctionCode::WriteSingleCoil,
            Self::WriteRegister(_) => FunctionCode::WriteSingleRegister,
            Self::WriteCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteRegisters { .. } => FunctionCode::WriteMultipleRegisters,
            Self::MaskWrite(_) => FunctionCode::MaskWriteRegister,
            Self::ReadWriteRegisters { .. } => FunctionCode::ReadWriteMultipleRegisters,
        }
    }

    /// Decode a request PDU. Quantities outside the function's ceiling give
    /// [`DecodeError::InvalidValue`]; address bounds are left to the handler.
    pub fn decode(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let function = FunctionCode::from_u8(r.read_u8()?)?;
        let address = r.read_be_u16()?;
        match function {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters => {
                let table = function.table();
                let quantity = r.read_be_u16()?;
                check_decoded_quantity(quantity, ReadRequest::max_quantity(table))?;
                Ok(Self::Read(ReadRequest {
                    table,
                    address,
                    quantity,
                }))
            }
            FunctionCode::WriteSingleCoil => Ok(Self::WriteCoil(WriteCoilRequest {
                address,
                value: decode_coil_word(r.read_be_u16()?)?,
            })),
            FunctionCode::WriteSingleRegister => Ok(Self::WriteRegister(WriteRegisterRequest {
                address,
                value: r.read_be_u16()?,
            })),
            FunctionCode::WriteMultipleCoils => {
                let quantity = r.read_be_u16()?;
                check_decoded_quantity(quantity, MAX_WRITE_COILS)?;
                let len = read_byte_count(r, usize::from(quantity).div_ceil(8))?;
                Ok(Self::WriteCoils {
                    address,
                    bits: PackedBits::new(r.read_exact(len)?, usize::from(quantity)),
                })
            }
            FunctionCode::WriteMultipleRegisters => {
                let quantity = r.read_be_u16()?;
                check_decoded_quantity(quantity, MAX_WRITE_REGISTERS)?;
                let len = read_byte_count(r, usize::from(quantity) * 2)?;
                Ok(Self::WriteRegisters {
                    address,
                    words: WireWords::new(r.read_exact(len)?),
                })
            }
            FunctionCode::MaskWriteRegister => Ok(Self::MaskWrite(MaskWriteRequest {
                address,
                and_mask: r.read_be_u16()?,
                or_mask: r.read_be_u16()?,
            })),
            FunctionCode::ReadWriteMultipleRegisters => {
                let read_quantity = r.read_be_u16()?;
                check_decoded_quantity(read_quantity, MAX_READ_REGISTERS)?;
                let write_address = r.read_be_u16()?;
                let write_quantity = r.read_be_u16()?;
                check_decoded_quantity(write_quantity, MAX_RW_WRITE_REGISTERS)?;
                let len = read_byte_count(r, usize::from(write_quantity) * 2)?;
                Ok(Self::ReadWriteRegisters {
                    read_address: address,
                    read_quantity,
                    write_address,
                    words: WireWords::new(r.read_exact(len)?),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(req: Request<'_>) -> ([u8; 260], usize) {
        let mut buf = [0u8; 260];
        let mut w = Writer::new(&mut buf);
        req.encode(&mut w).unwrap();
        let len = w.position();
        (buf, len)
    }

    #[test]
    fn read_validates_quantity_and_span() {
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        let zero = ReadRequest {
            table: Table::HoldingRegisters,
            address: 0,
            quantity: 0,
        };
        assert_eq!(zero.encode(&mut w).unwrap_err(), EncodeError::ValueOutOfRange);

        assert_eq!(check_span(0, 3000, MAX_READ_BITS), Err(RangeError::Quantity));
        assert_eq!(check_span(65535, 2, MAX_READ_BITS), Err(RangeError::Address));
        assert_eq!(check_span(65535, 1, MAX_READ_BITS), Ok(1));
        assert_eq!(check_span(0, 70_000, MAX_READ_BITS), Err(RangeError::Quantity));
    }

    #[test]
    fn write_coils_packs_lsb_first() {
        let (buf, len) = encode(Request::WriteCoils(WriteCoilsRequest {
            address: 0x0013,
            values: &[true, false, true, true, false, false, true, false, true],
        }));
        assert_eq!(
            &buf[..len],
            &[0x0F, 0x00, 0x13, 0x00, 0x09, 0x02, 0b0100_1101, 0b0000_0001]
        );
    }

    #[test]
    fn write_registers_rejects_too_many() {
        let values = [0u16; 124];
        let req = WriteRegistersRequest {
            address: 0,
            values: &values,
        };
        let mut buf = [0u8; 300];
        let mut w = Writer::new(&mut buf);
        assert_eq!(req.encode(&mut w).unwrap_err(), EncodeError::ValueOutOfRange);
    }

    #[test]
    fn read_write_registers_layout() {
        let (buf, len) = encode(Request::ReadWriteRegisters(ReadWriteRegistersRequest {
            read_address: 0x0010,
            read_quantity: 2,
            write_address: 0x0020,
            values: &[0x1111, 0x2222],
        }));
        assert_eq!(
            &buf[..len],
            &[0x17, 0x00, 0x10, 0x00, 0x02, 0x00, 0x20, 0x00, 0x02, 0x04, 0x11, 0x11, 0x22, 0x22]
        );

        let mut r = Reader::new(&buf[..len]);
        match DecodedRequest::decode(&mut r).unwrap() {
            DecodedRequest::ReadWriteRegisters {
                read_address,
                read_quantity,
                write_address,
                words,
            } => {
                assert_eq!((read_address, read_quantity, write_address), (0x10, 2, 0x20));
                assert_eq!(words.get(1), Some(0x2222));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert!(r.is_empty());
    }

    #[test]
    fn decodes_reads_for_every_table() {
        for (code, table) in [
            (0x01, Table::Coils),
            (0x02, Table::DiscreteInputs),
            (0x03, Table::HoldingRegisters),
            (0x04, Table::InputRegisters),
        ] {
            let bytes = [code, 0x00, 0x6B, 0x00, 0x03];
            let mut r = Reader::new(&bytes);
            assert_eq!(
                DecodedRequest::decode(&mut r).unwrap(),
                DecodedRequest::Read(ReadRequest {
                    table,
                    address: 0x6B,
                    quantity: 3
                })
            );
        }
    }

    #[test]
    fn decode_rejects_bad_payloads() {
        let mut r = Reader::new(&[0x10, 0x00, 0x00, 0x00, 0x02, 0x03, 0x12, 0x34, 0x56]);
        assert_eq!(DecodedRequest::decode(&mut r).unwrap_err(), DecodeError::InvalidLength);

        let mut r = Reader::new(&[0x05, 0x00, 0x01, 0x12, 0x34]);
        assert_eq!(DecodedRequest::decode(&mut r).unwrap_err(), DecodeError::InvalidValue);

        let mut r = Reader::new(&[0x01, 0x00, 0x00, 0x0B, 0xB8]);
        assert_eq!(DecodedRequest::decode(&mut r).unwrap_err(), DecodeError::InvalidValue);

        let mut r = Reader::new(&[0x2B, 0x0E, 0x01, 0x00]);
        assert_eq!(
            DecodedRequest::decode(&mut r).unwrap_err(),
            DecodeError::InvalidFunctionCode
        );
    }

    #[test]
    fn expected_lengths() {
        let cases: [(&[u8], usize); 6] = [
            (&[0x01, 0x00, 0x00, 0x00, 0x0A], 4),
            (&[0x03, 0x00, 0x00, 0x00, 0x0A], 22),
            (&[0x05, 0x00, 0x01, 0xFF, 0x00], 5),
            (&[0x10, 0x00, 0x01, 0x00, 0x01, 0x02, 0x00, 0x07], 5),
            (&[0x16, 0x00, 0x04, 0xFF, 0x00, 0x00, 0x12], 7),
            (&[0x17, 0x00, 0x10, 0x00, 0x03, 0x00, 0x20, 0x00, 0x01, 0x02, 0, 1], 8),
        ];
        for (pdu, expected) in cases {
            assert_eq!(expected_response_pdu_len(pdu).unwrap(), expected);
        }

        let req = Request::Read(ReadRequest {
            table: Table::DiscreteInputs,
            address: 0,
            quantity: 17,
        });
        assert_eq!(req.expected_response_len(), 5);
    }
}
