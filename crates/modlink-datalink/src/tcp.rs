//! Modbus TCP session with background reconnect.

use crate::config::{SocketConfig, Timeouts};
use crate::watchdog::{Reconnect, Watchdog};
use crate::{next_transaction_id, DataLink, DataLinkError};
use async_trait::async_trait;
use modlink_core::encoding::{Reader, Writer};
use modlink_core::frame::tcp::{self, MbapHeader};
use modlink_core::pdu::MAX_PDU_LEN;
use modlink_core::Transport;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

/// A TCP connection to one slave.
///
/// Requests are serialized on the session. A transport failure drops the
/// socket, returns the error to the caller and wakes the watchdog, which
/// reconnects in the background.
#[derive(Debug)]
pub struct TcpSession {
    inner: Arc<TcpInner>,
    watchdog: Watchdog,
}

#[derive(Debug)]
struct TcpInner {
    config: SocketConfig,
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl TcpSession {
    /// Create a session and start connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SocketConfig) -> Self {
        let session = Self::idle(config);
        session.watchdog.signal();
        session
    }

    /// Create a session and connect before returning.
    pub async fn connect(config: SocketConfig) -> Result<Self, DataLinkError> {
        let session = Self::idle(config);
        session.inner.reconnect().await?;
        Ok(session)
    }

    fn idle(config: SocketConfig) -> Self {
        let period = config.timeouts.reconnect_period();
        let name = format!("tcp://{}", config.endpoint());
        let inner = Arc::new(TcpInner {
            config,
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let watchdog = Watchdog::spawn(inner.clone(), period, name);
        Self { inner, watchdog }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    /// Ask the watchdog to reconnect. Re-enables reconnects after [`Self::disconnect`].
    pub fn reconnect(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.watchdog.signal();
    }

    /// Close the socket. The watchdog leaves the session down until
    /// [`Self::reconnect`] is called.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.drop_stream(&mut *self.inner.stream.lock().await);
    }

    /// Close the socket and stop the watchdog.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.watchdog.shutdown().await;
    }
}

impl TcpInner {
    fn drop_stream(&self, stream: &mut Option<TcpStream>) {
        *stream = None;
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Reconnect for TcpInner {
    fn needs_reconnect(&self) -> bool {
        !self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), DataLinkError> {
        let mut stream = self.stream.lock().await;
        self.drop_stream(&mut stream);
        let socket = open_stream(&self.config).await?;
        debug!(endpoint = %self.config.endpoint(), "modbus tcp session connected");
        *stream = Some(socket);
        self.connected.store(true, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }
}

async fn open_stream(config: &SocketConfig) -> Result<TcpStream, DataLinkError> {
    let connect_timeout = config.timeouts.connect;
    let addrs = timeout(connect_timeout, lookup_host(config.endpoint()))
        .await
        .map_err(|_| DataLinkError::Timeout)??;

    let mut last_err = DataLinkError::InvalidResponse("endpoint resolved to no addresses");
    for addr in addrs {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(port) = config.local_port {
            let unspecified = match addr {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            socket.set_reuseaddr(true)?;
            socket.bind(SocketAddr::new(unspecified, port))?;
        }
        match timeout(connect_timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Ok(Err(err)) => last_err = DataLinkError::Io(err),
            Err(_) => last_err = DataLinkError::Timeout,
        }
    }
    Err(last_err)
}

#[async_trait]
impl DataLink for TcpSession {
    async fn exchange(
        &self,
        unit_id: u8,
        request_pdu: &[u8],
        response_pdu: &mut [u8],
    ) -> Result<usize, DataLinkError> {
        let protocol_id = self.inner.config.protocol_id;
        let transaction_id = next_transaction_id();
        let request = encode_request(transaction_id, protocol_id, unit_id, request_pdu)?;

        let mut stream = self.inner.stream.lock().await;
        let Some(socket) = stream.as_mut() else {
            self.watchdog.signal();
            return Err(DataLinkError::NotConnected);
        };

        let expected = Expected {
            transaction_id,
            protocol_id,
            unit_id,
        };
        let result = exchange_stream(
            socket,
            &request,
            expected,
            response_pdu,
            &self.inner.config.timeouts,
        )
        .await;

        if let Err(err) = &result {
            if err.is_transport() || loses_framing(err) {
                warn!(
                    endpoint = %self.inner.config.endpoint(),
                    error = %err,
                    "modbus tcp session failed, scheduling reconnect"
                );
                self.inner.drop_stream(&mut stream);
                self.watchdog.signal();
            }
        }
        result
    }

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn request_reconnect(&self) {
        self.reconnect();
    }
}

/// Identifiers a response must carry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Expected {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
}

impl Expected {
    pub(crate) fn check(&self, header: &MbapHeader) -> Result<(), DataLinkError> {
        if header.transaction_id != self.transaction_id {
            return Err(DataLinkError::MismatchedTransactionId {
                expected: self.transaction_id,
                got: header.transaction_id,
            });
        }
        if header.protocol_id != self.protocol_id {
            return Err(DataLinkError::MismatchedProtocolId {
                expected: self.protocol_id,
                got: header.protocol_id,
            });
        }
        if header.unit_id != self.unit_id {
            return Err(DataLinkError::MismatchedUnitId {
                expected: self.unit_id,
                got: header.unit_id,
            });
        }
        Ok(())
    }
}

pub(crate) fn encode_request(
    transaction_id: u16,
    protocol_id: u16,
    unit_id: u8,
    request_pdu: &[u8],
) -> Result<Vec<u8>, DataLinkError> {
    if request_pdu.is_empty() {
        return Err(DataLinkError::InvalidResponse("empty request pdu"));
    }
    let mut frame = vec![0u8; tcp::MBAP_HEADER_LEN + request_pdu.len()];
    let mut writer = Writer::new(&mut frame);
    tcp::encode_frame(&mut writer, transaction_id, protocol_id, unit_id, request_pdu)?;
    Ok(frame)
}

pub(crate) async fn with_deadline<T, F>(deadline: Instant, fut: F) -> Result<T, DataLinkError>
where
    F: Future<Output = Result<T, DataLinkError>>,
{
    timeout_at(deadline, fut)
        .await
        .map_err(|_| DataLinkError::Timeout)?
}

pub(crate) async fn read_exact_or_connection_closed<IO: AsyncRead + Unpin>(
    stream: &mut IO,
    buf: &mut [u8],
) -> Result<(), DataLinkError> {
    if let Err(err) = stream.read_exact(buf).await {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(DataLinkError::ConnectionClosed);
        }
        return Err(DataLinkError::Io(err));
    }
    Ok(())
}

async fn drain_exact<IO: AsyncRead + Unpin>(
    stream: &mut IO,
    mut len: usize,
) -> Result<(), DataLinkError> {
    let mut scratch = [0u8; 256];
    while len > 0 {
        let chunk = len.min(scratch.len());
        read_exact_or_connection_closed(stream, &mut scratch[..chunk]).await?;
        len -= chunk;
    }
    Ok(())
}

/// An MBAP header that does not decode leaves the frame boundary unknown,
/// so the stream cannot be reused.
fn loses_framing(err: &DataLinkError) -> bool {
    matches!(err, DataLinkError::Decode(_))
}

/// One MBAP exchange over a byte stream. Frames that fail the identifier
/// checks are read in full so the stream stays aligned for the next request.
async fn exchange_stream<IO: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut IO,
    request: &[u8],
    expected: Expected,
    response_pdu: &mut [u8],
    timeouts: &Timeouts,
) -> Result<usize, DataLinkError> {
    trace!(
        transaction_id = expected.transaction_id,
        unit_id = expected.unit_id,
        pdu_len = request.len() - tcp::MBAP_HEADER_LEN,
        "sending modbus tcp request"
    );
    with_deadline(Instant::now() + timeouts.send, async {
        stream.write_all(request).await?;
        stream.flush().await?;
        Ok::<(), DataLinkError>(())
    })
    .await?;

    let deadline = Instant::now() + timeouts.receive;
    let mut mbap = [0u8; tcp::MBAP_HEADER_LEN];
    with_deadline(deadline, read_exact_or_connection_closed(stream, &mut mbap)).await?;

    let header = MbapHeader::decode(&mut Reader::new(&mbap))?;
    let pdu_len = header.pdu_len();

    if pdu_len > MAX_PDU_LEN {
        with_deadline(deadline, drain_exact(stream, pdu_len)).await?;
        expected.check(&header)?;
        return Err(DataLinkError::InvalidResponse("response pdu too large"));
    }

    if pdu_len > response_pdu.len() {
        with_deadline(deadline, drain_exact(stream, pdu_len)).await?;
        expected.check(&header)?;
        return Err(DataLinkError::ResponseBufferTooSmall {
            needed: pdu_len,
            available: response_pdu.len(),
        });
    }

    with_deadline(
        deadline,
        read_exact_or_connection_closed(stream, &mut response_pdu[..pdu_len]),
    )
    .await?;
    expected.check(&header)?;
    trace!(
        transaction_id = expected.transaction_id,
        unit_id = expected.unit_id,
        pdu_len,
        "received modbus tcp response"
    );
    Ok(pdu_len)
}

#[cfg(test)]
mod tests {
    use super::TcpSession;
    use crate::config::{SocketConfig, Timeouts};
    use crate::{DataLink, DataLinkError};
    use modlink_core::encoding::Writer;
    use modlink_core::frame::tcp;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn config(addr: SocketAddr) -> SocketConfig {
        SocketConfig::new(addr.ip().to_string(), addr.port())
            .with_timeouts(Timeouts::uniform(Duration::from_millis(200)))
    }

    async fn read_request(socket: &mut TcpStream) -> [u8; 12] {
        let mut req = [0u8; 12];
        socket.read_exact(&mut req).await.unwrap();
        req
    }

    async fn reply(socket: &mut TcpStream, tid: u16, protocol_id: u16, unit_id: u8, pdu: &[u8]) {
        let mut frame = [0u8; 64];
        let mut w = Writer::new(&mut frame);
        tcp::encode_frame(&mut w, tid, protocol_id, unit_id, pdu).unwrap();
        socket.write_all(w.as_written()).await.unwrap();
    }

    #[tokio::test]
    async fn exchange_roundtrip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let req = read_request(&mut socket).await;
            assert_eq!(&req[2..7], &[0x00, 0x00, 0x00, 0x06, 0x01]);
            assert_eq!(&req[7..], &[0x03, 0x00, 0x6B, 0x00, 0x03]);
            let tid = u16::from_be_bytes([req[0], req[1]]);
            reply(
                &mut socket,
                tid,
                0,
                1,
                &[0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64],
            )
            .await;
        });

        let session = TcpSession::connect(config(addr)).await.unwrap();
        assert!(session.is_connected());
        let mut response = [0u8; 256];
        let len = session
            .exchange(1, &[0x03, 0x00, 0x6B, 0x00, 0x03], &mut response)
            .await
            .unwrap();

        assert_eq!(
            &response[..len],
            &[0x03, 0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64]
        );

        server.await.unwrap();
        session.shutdown().await;
    }

    #[tokio::test]
    async fn mismatched_transaction_id_keeps_stream_aligned() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let req = read_request(&mut socket).await;
            let tid = u16::from_be_bytes([req[0], req[1]]);
            reply(&mut socket, tid.wrapping_add(100), 0, 1, &[0x83, 0x02]).await;

            let req = read_request(&mut socket).await;
            let tid = u16::from_be_bytes([req[0], req[1]]);
            reply(&mut socket, tid, 0, 1, &[0x03, 0x02, 0x00, 0x2A]).await;
        });

        let session = TcpSession::connect(config(addr)).await.unwrap();
        let mut response = [0u8; 16];
        let err = session
            .exchange(1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap_err();
        assert!(matches!(err, DataLinkError::MismatchedTransactionId { .. }));
        assert!(session.is_connected());

        let len = session
            .exchange(1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap();
        assert_eq!(&response[..len], &[0x03, 0x02, 0x00, 0x2A]);

        server.await.unwrap();
        session.shutdown().await;
    }

    #[tokio::test]
    async fn undecodable_header_drops_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let req = read_request(&mut socket).await;
            // Length field of 1 cannot hold a unit id and a function code.
            let frame = [req[0], req[1], 0x00, 0x00, 0x00, 0x01, 0x01, 0x99];
            socket.write_all(&frame).await.unwrap();

            let (mut socket, _) = listener.accept().await.unwrap();
            let req = read_request(&mut socket).await;
            let tid = u16::from_be_bytes([req[0], req[1]]);
            reply(&mut socket, tid, 0, 1, &[0x03, 0x02, 0x00, 0x2A]).await;
        });

        let session = TcpSession::connect(config(addr)).await.unwrap();
        let mut response = [0u8; 16];
        let err = session
            .exchange(1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap_err();
        assert!(matches!(err, DataLinkError::Decode(_)));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !session.is_connected() {
            assert!(tokio::time::Instant::now() < deadline, "session did not reconnect");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let len = session
            .exchange(1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap();
        assert_eq!(&response[..len], &[0x03, 0x02, 0x00, 0x2A]);

        server.await.unwrap();
        session.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_protocol_and_unit_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let req = read_request(&mut socket).await;
            let tid = u16::from_be_bytes([req[0], req[1]]);
            reply(&mut socket, tid, 9, 1, &[0x06, 0x00, 0x01, 0x00, 0x02]).await;

            let req = read_request(&mut socket).await;
            let tid = u16::from_be_bytes([req[0], req[1]]);
            reply(&mut socket, tid, 0, 7, &[0x06, 0x00, 0x01, 0x00, 0x02]).await;
        });

        let session = TcpSession::connect(config(addr)).await.unwrap();
        let mut response = [0u8; 16];
        let err = session
            .exchange(1, &[0x06, 0x00, 0x01, 0x00, 0x02], &mut response)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DataLinkError::MismatchedProtocolId { expected: 0, got: 9 }
        ));

        let err = session
            .exchange(1, &[0x06, 0x00, 0x01, 0x00, 0x02], &mut response)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DataLinkError::MismatchedUnitId { expected: 1, got: 7 }
        ));

        server.await.unwrap();
        session.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_and_drains_oversized_response_pdu() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let req = read_request(&mut socket).await;
            let mut oversized = vec![0u8; tcp::MBAP_HEADER_LEN + 254];
            oversized[0..2].copy_from_slice(&req[0..2]);
            oversized[4..6].copy_from_slice(&255u16.to_be_bytes());
            oversized[6] = 1;
            oversized[7] = 0x03;
            socket.write_all(&oversized).await.unwrap();

            let req = read_request(&mut socket).await;
            let tid = u16::from_be_bytes([req[0], req[1]]);
            reply(&mut socket, tid, 0, 1, &[0x03, 0x02, 0x00, 0x2A]).await;
        });

        let session = TcpSession::connect(config(addr)).await.unwrap();
        let mut response = [0u8; 260];
        let err = session
            .exchange(1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DataLinkError::InvalidResponse("response pdu too large")
        ));

        let len = session
            .exchange(1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap();
        assert_eq!(&response[..len], &[0x03, 0x02, 0x00, 0x2A]);

        server.await.unwrap();
        session.shutdown().await;
    }

    #[tokio::test]
    async fn silent_slave_times_out_and_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let session = TcpSession::connect(config(addr)).await.unwrap();
        let mut response = [0u8; 16];
        let err = session
            .exchange(1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap_err();
        assert!(matches!(err, DataLinkError::Timeout));
        assert!(!session.is_connected());

        session.shutdown().await;
        server.abort();
    }

    #[tokio::test]
    async fn exchange_without_connection_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let session = TcpSession::connect(config(addr)).await.unwrap();
        session.disconnect().await;
        assert!(!session.is_connected());

        let mut response = [0u8; 16];
        let err = session
            .exchange(1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap_err();
        assert!(matches!(err, DataLinkError::NotConnected));
        session.shutdown().await;
        drop(listener);
    }
}
