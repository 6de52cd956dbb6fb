//! ASCII request/response over any byte stream.

use crate::config::Timeouts;
use crate::tcp::with_deadline;
use crate::DataLinkError;
use modlink_core::encoding::Writer;
use modlink_core::frame::ascii as ascii_frame;
use modlink_core::pdu::MAX_PDU_LEN;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

const MAX_TEXT_LEN: usize = ascii_frame::frame_len(MAX_PDU_LEN);

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

    let mut request = vec![0u8; ascii_frame::frame_len(request_pdu.len())];
    let mut writer = Writer::new(&mut request);
    ascii_frame::encode_frame(&mut writer, unit_id, request_pdu)?;

    trace!(unit_id, pdu_len = request_pdu.len(), "sending modbus ascii request");
    with_deadline(Instant::now() + timeouts.send, async {
        io.write_all(writer.as_written()).await?;
        io.flush().await?;
        Ok::<(), DataLinkError>(())
    })
    .await?;

    let deadline = Instant::now() + timeouts.receive;
    let text = read_line(io, deadline).await?;

    let mut scratch = [0u8; ascii_frame::MAX_BINARY_LEN];
    let (got_unit, pdu) = ascii_frame::decode_frame(&text, &mut scratch)?;
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
    trace!(unit_id, pdu_len = pdu.len(), "received modbus ascii response");
    Ok(pdu.len())
}

/// Collect bytes from the last `:` up to and including `\n`. Anything
/// before the start marker is line noise and is dropped.
async fn read_line<IO: AsyncRead + Unpin>(
    io: &mut IO,
    deadline: Instant,
) -> Result<Vec<u8>, DataLinkError> {
    let mut line = Vec::with_capacity(64);
    let mut chunk = [0u8; 64];
    loop {
        let n = with_deadline(deadline, async {
            Ok::<_, DataLinkError>(io.read(&mut chunk).await?)
        })
        .await?;
        if n == 0 {
            return Err(DataLinkError::ConnectionClosed);
        }
        for &byte in &chunk[..n] {
            if byte == ascii_frame::START {
                line.clear();
            } else if line.is_empty() {
                continue;
            }
            line.push(byte);
            if byte == b'\n' {
                return Ok(line);
            }
            if line.len() > MAX_TEXT_LEN {
                return Err(DataLinkError::InvalidResponse("ascii frame too long"));
            }
        }
    }
}
