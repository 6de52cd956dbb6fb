use modlink_core::checksum::{crc16, lrc};
use modlink_core::encoding::{Reader, Writer};
use modlink_core::frame::{self, AduHeader, Transport};
use modlink_core::pdu::{
    expected_response_pdu_len, DecodedRequest, ExceptionCode, ReadRequest, Request, Response,
    Table, WriteCoilsRequest, WriteRegistersRequest,
};
use modlink_core::{DecodeError, EncodeError};

const READ_HOLDING_REQ: &[u8] = &[0x03, 0x00, 0x6B, 0x00, 0x03];
const READ_HOLDING_RESP: &[u8] = &[0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64];
const TCP_READ_HOLDING: &[u8] = &[
    0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x6B, 0x00, 0x03,
];
const RTU_READ_TEN: &[u8] = &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
const ASCII_READ_TEN: &[u8] = b":01030000000AF2\r\n";

fn read_holding(address: u16, quantity: u16) -> Request<'static> {
    Request::Read(ReadRequest {
        table: Table::HoldingRegisters,
        address,
        quantity,
    })
}

#[test]
fn fc03_request_golden_encode() {
    let mut buf = [0u8; 16];
    let mut w = Writer::new(&mut buf);
    read_holding(0x006B, 3).encode(&mut w).unwrap();
    assert_eq!(w.as_written(), READ_HOLDING_REQ);
    assert_eq!(expected_response_pdu_len(w.as_written()).unwrap(), READ_HOLDING_RESP.len());
}

#[test]
fn fc03_response_words() {
    let mut r = Reader::new(READ_HOLDING_RESP);
    match Response::decode(&mut r).unwrap() {
        Response::ReadRegisters { table, words } => {
            assert_eq!(table, Table::HoldingRegisters);
            assert_eq!(words.iter().collect::<Vec<_>>(), vec![0x022B, 0x0000, 0x0064]);
        }
        other => panic!("expected register read, got {other:?}"),
    }
}

#[test]
fn mbap_frame_golden() {
    let mut buf = [0u8; 32];
    let mut w = Writer::new(&mut buf);
    frame::tcp::encode_frame(&mut w, 1, 0, 1, READ_HOLDING_REQ).unwrap();
    assert_eq!(w.as_written(), TCP_READ_HOLDING);

    let mut r = Reader::new(w.as_written());
    let (header, pdu) = frame::tcp::decode_frame(&mut r).unwrap();
    assert_eq!(header.transaction_id, 1);
    assert_eq!(header.protocol_id, 0);
    assert_eq!(header.length, 6);
    assert_eq!(header.unit_id, 1);
    assert_eq!(pdu, READ_HOLDING_REQ);
}

#[test]
fn serial_frames_golden() {
    let pdu = &RTU_READ_TEN[1..6];
    assert_eq!(crc16(&RTU_READ_TEN[..6]), 0xCDC5);
    assert_eq!(lrc(&RTU_READ_TEN[..6]), 0xF2);

    let header = AduHeader {
        unit_id: 1,
        ..AduHeader::default()
    };
    for (transport, golden) in [(Transport::Rtu, RTU_READ_TEN), (Transport::Ascii, ASCII_READ_TEN)] {
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        frame::encode_adu(&mut w, transport, header, pdu).unwrap();
        assert_eq!(w.as_written(), golden, "{transport}");
    }
}

#[test]
fn rtu_response_with_flipped_trailing_byte_fails_checksum() {
    let mut buf = [0u8; 32];
    let mut w = Writer::new(&mut buf);
    frame::rtu::encode_frame(&mut w, 1, READ_HOLDING_RESP).unwrap();

    let mut tampered = w.as_written().to_vec();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;

    let err = frame::rtu::decode_frame(&tampered).unwrap_err();
    assert_eq!(err, DecodeError::InvalidCrc);
    assert!(err.is_checksum());
}

#[test]
fn quantity_boundaries_are_validated() {
    let mut buf = [0u8; 512];

    let mut w = Writer::new(&mut buf);
    assert_eq!(
        read_holding(0, 0).encode(&mut w).unwrap_err(),
        EncodeError::ValueOutOfRange
    );

    let mut w = Writer::new(&mut buf);
    let coils = Request::Read(ReadRequest {
        table: Table::Coils,
        address: 0,
        quantity: 3000,
    });
    assert_eq!(coils.encode(&mut w).unwrap_err(), EncodeError::ValueOutOfRange);
    assert_eq!(w.position(), 0);

    let values_too_many = [0u16; 124];
    let mut w = Writer::new(&mut buf);
    assert_eq!(
        WriteRegistersRequest {
            address: 0,
            values: &values_too_many,
        }
        .encode(&mut w)
        .unwrap_err(),
        EncodeError::ValueOutOfRange
    );

    let too_many_coils = [false; 1969];
    let mut w = Writer::new(&mut buf);
    assert_eq!(
        WriteCoilsRequest {
            address: 0,
            values: &too_many_coils,
        }
        .encode(&mut w)
        .unwrap_err(),
        EncodeError::ValueOutOfRange
    );

    let mut w = Writer::new(&mut buf);
    assert_eq!(
        read_holding(65_500, 100).encode(&mut w).unwrap_err(),
        EncodeError::ValueOutOfRange
    );
}

#[test]
fn exception_roundtrip() {
    let bytes = [0x83u8, 0x02];
    let mut r = Reader::new(&bytes);
    let decoded = Response::decode(&mut r).unwrap();
    match decoded {
        Response::Exception(ex) => assert_eq!(ex.exception_code, ExceptionCode::IllegalDataAddress),
        other => panic!("expected exception, got {other:?}"),
    }

    let mut out = [0u8; 8];
    let mut w = Writer::new(&mut out);
    decoded.encode(&mut w).unwrap();
    assert_eq!(w.as_written(), &bytes);
}

#[test]
fn server_side_decode_of_golden_request() {
    let mut r = Reader::new(&TCP_READ_HOLDING[7..]);
    assert_eq!(
        DecodedRequest::decode(&mut r).unwrap(),
        DecodedRequest::Read(ReadRequest {
            table: Table::HoldingRegisters,
            address: 0x6B,
            quantity: 3,
        })
    );
}
