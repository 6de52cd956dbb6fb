//! ASCII framing: `:`, upper-case hex of unit id, PDU and LRC, then CRLF.

use crate::checksum::{lrc, verify_lrc};
use crate::encoding::Writer;
use crate::pdu::MAX_PDU_LEN;
use crate::{DecodeError, EncodeError};

pub const START: u8 = b':';
pub const END: [u8; 2] = *b"\r\n";
/// Largest decoded frame: unit id, PDU, LRC.
pub const MAX_BINARY_LEN: usize = MAX_PDU_LEN + 2;

/// Encoded length of a frame carrying `pdu_len` PDU bytes.
pub const fn frame_len(pdu_len: usize) -> usize {
    1 + 2 * (pdu_len + 2) + 2
}

pub fn encode_frame(w: &mut Writer<'_>, unit_id: u8, pdu: &[u8]) -> Result<(), EncodeError> {
    if pdu.is_empty() {
        return Err(EncodeError::InvalidLength);
    }
    if pdu.len() > MAX_PDU_LEN {
        return Err(EncodeError::ValueOutOfRange);
    }
    // The LRC of a concatenation is the wrapping sum of the parts' LRCs.
    let check = lrc(&[unit_id]).wrapping_add(lrc(pdu));
    w.write_u8(START)?;
    w.write_hex_upper(&[unit_id])?;
    w.write_hex_upper(pdu)?;
    w.write_hex_upper(&[check])?;
    w.write_all(&END)
}

/// Decode `text` into `scratch` and return the unit id and PDU.
pub fn decode_frame<'a>(text: &[u8], scratch: &'a mut [u8]) -> Result<(u8, &'a [u8]), DecodeError> {
    let body = text
        .strip_prefix(&[START])
        .and_then(|rest| rest.strip_suffix(&END))
        .ok_or(DecodeError::InvalidFraming)?;
    if body.len() % 2 != 0 {
        return Err(DecodeError::InvalidFraming);
    }
    let len = body.len() / 2;
    if len < 3 {
        return Err(DecodeError::InvalidLength);
    }
    let decoded = scratch
        .get_mut(..len)
        .ok_or(DecodeError::InvalidLength)?;
    hex::decode_to_slice(body, decoded).map_err(|_| DecodeError::InvalidFraming)?;
    if !verify_lrc(decoded) {
        return Err(DecodeError::InvalidLrc);
    }
    Ok((decoded[0], &decoded[1..len - 1]))
}

#[cfg(test)]
mod tests {
    use super::{decode_frame, encode_frame, frame_len, MAX_BINARY_LEN};
    use crate::encoding::Writer;
    use crate::DecodeError;

    #[test]
    fn encodes_upper_case_hex_with_lrc() {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        encode_frame(&mut w, 0x01, &[0x03, 0x00, 0x00, 0x00, 0x0A]).unwrap();
        assert_eq!(w.as_written(), b":01030000000AF2\r\n");
        assert_eq!(w.position(), frame_len(5));

        let mut scratch = [0u8; MAX_BINARY_LEN];
        let (unit, pdu) = decode_frame(w.as_written(), &mut scratch).unwrap();
        assert_eq!(unit, 1);
        assert_eq!(pdu, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn accepts_lower_case_hex() {
        let mut scratch = [0u8; 16];
        let (unit, pdu) = decode_frame(b":11030000000ae2\r\n", &mut scratch).unwrap();
        assert_eq!(unit, 0x11);
        assert_eq!(pdu, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn rejects_bad_frames() {
        let mut scratch = [0u8; 16];
        assert_eq!(
            decode_frame(b"01030000000AF2\r\n", &mut scratch).unwrap_err(),
            DecodeError::InvalidFraming
        );
        assert_eq!(
            decode_frame(b":01030000000AF2", &mut scratch).unwrap_err(),
            DecodeError::InvalidFraming
        );
        assert_eq!(
            decode_frame(b":01030000000AG2\r\n", &mut scratch).unwrap_err(),
            DecodeError::InvalidFraming
        );
        assert_eq!(
            decode_frame(b":01030000000AF3\r\n", &mut scratch).unwrap_err(),
            DecodeError::InvalidLrc
        );
        assert_eq!(
            decode_frame(b":0103\r\n", &mut scratch).unwrap_err(),
            DecodeError::InvalidLength
        );
        let mut tiny = [0u8; 2];
        assert_eq!(
            decode_frame(b":01030000000AF2\r\n", &mut tiny).unwrap_err(),
            DecodeError::InvalidLength
        );
    }
}
