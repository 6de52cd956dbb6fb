//! Application data units for the four Modbus transports.

pub mod ascii;
pub mod rtu;
pub mod tcp;

use crate::encoding::{Reader, Writer};
use crate::{DecodeError, EncodeError};
use core::fmt;
use core::str::FromStr;

/// Wire encapsulation of a PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Transport {
    Tcp,
    Udp,
    Rtu,
    Ascii,
}

impl Transport {
    pub const ALL: [Self; 4] = [Self::Tcp, Self::Udp, Self::Rtu, Self::Ascii];

    /// MBAP-framed transports carry transaction and protocol ids.
    pub const fn uses_mbap(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }

    /// Full frame length for a PDU of `pdu_len` bytes.
    pub const fn adu_len(self, pdu_len: usize) -> usize {
        match self {
            Self::Tcp | Self::Udp => tcp::MBAP_HEADER_LEN + pdu_len,
            Self::Rtu => pdu_len + rtu::OVERHEAD,
            Self::Ascii => ascii::frame_len(pdu_len),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Rtu => "rtu",
            Self::Ascii => "ascii",
        })
    }
}

impl FromStr for Transport {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "rtu" => Ok(Self::Rtu),
            "ascii" => Ok(Self::Ascii),
            _ => Err(DecodeError::Message("transport must be tcp, udp, rtu or ascii")),
        }
    }
}

/// Addressing that surrounds a PDU. Serial transports only carry the unit id
/// and report zero for the other two fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AduHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
}

pub fn encode_adu(
    w: &mut Writer<'_>,
    transport: Transport,
    header: AduHeader,
    pdu: &[u8],
) -> Result<(), EncodeError> {
    match transport {
        Transport::Tcp | Transport::Udp => tcp::encode_frame(
            w,
            header.transaction_id,
            header.protocol_id,
            header.unit_id,
            pdu,
        ),
        Transport::Rtu => rtu::encode_frame(w, header.unit_id, pdu),
        Transport::Ascii => ascii::encode_frame(w, header.unit_id, pdu),
    }
}

/// Parse a complete frame. ASCII frames are hex-decoded into `scratch`; the
/// other transports return a PDU borrowed from `frame`.
pub fn decode_adu<'a>(
    transport: Transport,
    frame: &'a [u8],
    scratch: &'a mut [u8],
) -> Result<(AduHeader, &'a [u8]), DecodeError> {
    match transport {
        Transport::Tcp | Transport::Udp => {
            let mut r = Reader::new(frame);
            let (mbap, pdu) = tcp::decode_frame(&mut r)?;
            if !r.is_empty() {
                return Err(DecodeError::InvalidLength);
            }
            Ok((
                AduHeader {
                    transaction_id: mbap.transaction_id,
                    protocol_id: mbap.protocol_id,
                    unit_id: mbap.unit_id,
                },
                pdu,
            ))
        }
        Transport::Rtu => {
            let (unit_id, pdu) = rtu::decode_frame(frame)?;
            Ok((unit_header(unit_id), pdu))
        }
        Transport::Ascii => {
            let (unit_id, pdu) = ascii::decode_frame(frame, scratch)?;
            Ok((unit_header(unit_id), pdu))
        }
    }
}

fn unit_header(unit_id: u8) -> AduHeader {
    AduHeader {
        unit_id,
        ..AduHeader::default()
    }
}
