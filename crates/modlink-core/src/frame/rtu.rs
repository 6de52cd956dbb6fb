//! RTU framing: unit id, PDU, CRC16 low byte first.

use crate::checksum::{crc16_bytes, verify_crc16, CrcOrder};
use crate::encoding::Writer;
use crate::pdu::MAX_PDU_LEN;
use crate::{DecodeError, EncodeError};

/// Unit id plus CRC.
pub const OVERHEAD: usize = 3;
pub const MIN_FRAME_LEN: usize = 4;
pub const MAX_FRAME_LEN: usize = MAX_PDU_LEN + OVERHEAD;

pub fn encode_frame(w: &mut Writer<'_>, unit_id: u8, pdu: &[u8]) -> Result<(), EncodeError> {
    if pdu.is_empty() {
        return Err(EncodeError::InvalidLength);
    }
    if pdu.len() > MAX_PDU_LEN {
        return Err(EncodeError::ValueOutOfRange);
    }
    let start = w.position();
    w.write_u8(unit_id)?;
    w.write_all(pdu)?;
    let crc = crc16_bytes(&w.as_written()[start..], CrcOrder::LowHigh);
    w.write_all(&crc)
}

pub fn decode_frame(data: &[u8]) -> Result<(u8, &[u8]), DecodeError> {
    if data.len() < MIN_FRAME_LEN {
        return Err(DecodeError::InvalidLength);
    }
    if !verify_crc16(data, CrcOrder::LowHigh) {
        return Err(DecodeError::InvalidCrc);
    }
    Ok((data[0], &data[1..data.len() - 2]))
}
