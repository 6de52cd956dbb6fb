//! RTU request/response over any byte stream.
//!
//! The response length is known from the request, so the reader stops at
//! exactly one frame and a corrupted frame surfaces as a CRC error rather
//! than a timeout.

use crate::config::Timeouts;
use crate::tcp::{read_exact_or_connection_closed, with_deadline};
use crate::DataLinkError;
use modlink_core::encoding::Writer;
use modlink_core::frame::rtu as rtu_frame;
use modlink_core::pdu::{expected_response_pdu_len, ExceptionResponse};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

/// Unit id, function code and the first payload byte.
const HEADER_LEN: usize = 3;

pub async fn exchange<IO: AsyncRead + AsyncWrite + Unpin>(
    io: &mut IO,
    unit_id: u8,
    request_pdu: &[u8],
    response_pdu: &mut [u8],
    timeouts: &Timeouts,
) -> Result<usize, DataLinkError> {
    if request_pdu.is_empty() {
        return Err(DataLinkError::InvalidResponse("empty request pdu"));
    }
    let expected_pdu_len = expected_response_pdu_len(request_pdu)?;

    let mut request = [0u8; rtu_frame::MAX_FRAME_LEN];
    let mut writer = Writer::new(&mut request);
    rtu_frame::encode_frame(&mut writer, unit_id, request_pdu)?;

    trace!(unit_id, pdu_len = request_pdu.len(), "sending modbus rtu request");
    with_deadline(Instant::now() + timeouts.send, async {
        io.write_all(writer.as_written()).await?;
        io.flush().await?;
        Ok::<(), DataLinkError>(())
    })
    .await?;

    let deadline = Instant::now() + timeouts.receive;
    let mut frame = [0u8; rtu_frame::MAX_FRAME_LEN];
    with_deadline(
        deadline,
        read_exact_or_connection_closed(io, &mut frame[..HEADER_LEN]),
    )
    .await?;

    let frame_len = if frame[1] & 0x80 != 0 {
        ExceptionResponse::PDU_LEN + rtu_frame::OVERHEAD
    } else {
        expected_pdu_len + rtu_frame::OVERHEAD
    };
    if frame_len > frame.len() {
        return Err(DataLinkError::InvalidResponse("response pdu too large"));
    }
    with_deadline(
        deadline,
        read_exact_or_connection_closed(io, &mut frame[HEADER_LEN..frame_len]),
    )
    .await?;

    let (got_unit, pdu) = rtu_frame::decode_frame(&frame[..frame_len])?;
    if got_unit != unit_id {
        return Err(DataLinkError::MismatchedUnitId {
            expected: unit_id,
            got: got_unit,
        });
    }
    if pdu.len() > response_pdu.len() {
        return Err(DataLinkError::ResponseBufferTooSmall {
            needed: pdu.len(),
            available: response_pdu.len(),
        });
    }
    response_pdu[..pdu.len()].copy_from_slice(pdu);
    trace!(unit_id, pdu_len = pdu.len(), "received modbus rtu response");
    Ok(pdu.len())
}
