//! MBAP framing shared by Modbus TCP and Modbus UDP.

use crate::encoding::{Reader, Writer};
use crate::{DecodeError, EncodeError};

pub const MBAP_HEADER_LEN: usize = 7;

/// Transaction id, protocol id, length and unit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Bytes following the length field: unit id plus PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length).saturating_sub(1)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_be_u16(self.transaction_id)?;
        w.write_be_u16(self.protocol_id)?;
        w.write_be_u16(self.length)?;
        w.write_u8(self.unit_id)
    }

    /// Parse the seven header bytes. The protocol id is returned as received;
    /// callers compare it with the one they expect.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let header = Self {
            transaction_id: r.read_be_u16()?,
            protocol_id: r.read_be_u16()?,
            length: r.read_be_u16()?,
            unit_id: r.read_u8()?,
        };
        if header.length < 2 {
            return Err(DecodeError::InvalidLength);
        }
        Ok(header)
    }
}

pub fn encode_frame(
    w: &mut Writer<'_>,
    transaction_id: u16,
    protocol_id: u16,
    unit_id: u8,
    pdu: &[u8],
) -> Result<(), EncodeError> {
    if pdu.is_empty() {
        return Err(EncodeError::InvalidLength);
    }
    let length = u16::try_from(pdu.len() + 1).map_err(|_| EncodeError::ValueOutOfRange)?;
    MbapHeader {
        transaction_id,
        protocol_id,
        length,
        unit_id,
    }
    .encode(w)?;
    w.write_all(pdu)
}

pub fn decode_frame<'a>(r: &mut Reader<'a>) -> Result<(MbapHeader, &'a [u8]), DecodeError> {
    let header = MbapHeader::decode(r)?;
    let pdu = r.read_exact(header.pdu_len())?;
    Ok((header, pdu))
}
