//! Modbus TCP slave.

use crate::image::{ImageConfig, RegisterImage};
use crate::tcp::read_exact_or_connection_closed;
use crate::DataLinkError;
use modlink_core::encoding::{Reader, Writer};
use modlink_core::frame::tcp;
use modlink_core::pdu::{DecodedRequest, ExceptionCode, ExceptionResponse, MAX_PDU_LEN};
use modlink_core::DecodeError;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("modbus exception: {0:?}")]
    Exception(ExceptionCode),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

pub trait ModbusService: Send + Sync + 'static {
    /// Handle a decoded request and write a response PDU into `response_pdu`.
    ///
    /// Return the number of bytes written. The response must include function
    /// code and payload, but not MBAP header bytes.
    fn handle(
        &self,
        unit_id: u8,
        request: DecodedRequest<'_>,
        response_pdu: &mut [u8],
    ) -> Result<usize, ServiceError>;
}

impl<T> ModbusService for Arc<T>
where
    T: ModbusService + ?Sized,
{
    fn handle(
        &self,
        unit_id: u8,
        request: DecodedRequest<'_>,
        response_pdu: &mut [u8],
    ) -> Result<usize, ServiceError> {
        (**self).handle(unit_id, request, response_pdu)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Requests addressed to any other unit except broadcast 0 get no answer.
    pub unit_id: u8,
    /// Tables of the image built by [`ModbusTcpServer::with_image`].
    pub image: ImageConfig,
    pub max_pdu_len: usize,
    /// A client counts as connected while it sent a request within this window.
    pub client_expiry: Duration,
    /// Close connections that stay silent this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 502,
            unit_id: 1,
            image: ImageConfig::default(),
            max_pdu_len: MAX_PDU_LEN,
            client_expiry: Duration::from_secs(4),
            idle_timeout: None,
        }
    }
}

impl ServerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_image(mut self, image: ImageConfig) -> Self {
        self.image = image;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// Per-client last activity, published as a live connection count.
#[derive(Debug)]
struct ConnectionTracker {
    expiry: Duration,
    clients: Mutex<HashMap<u64, Instant>>,
    count: watch::Sender<usize>,
}

impl ConnectionTracker {
    fn new(expiry: Duration) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            expiry,
            clients: Mutex::new(HashMap::new()),
            count,
        }
    }

    fn touch(&self, id: u64) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.insert(id, Instant::now());
        self.publish(&clients);
    }

    fn remove(&self, id: u64) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.remove(&id);
        self.publish(&clients);
    }

    fn refresh(&self) {
        let clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        self.publish(&clients);
    }

    fn publish(&self, clients: &HashMap<u64, Instant>) {
        let now = Instant::now();
        let live = clients
            .values()
            .filter(|seen| now.duration_since(**seen) < self.expiry)
            .count();
        self.count.send_if_modified(|count| {
            if *count == live {
                return false;
            }
            debug!(clients = live, "modbus tcp client count changed");
            *count = live;
            true
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct DispatchSettings {
    unit_id: u8,
    max_pdu_len: usize,
    idle_timeout: Option<Duration>,
}

pub struct ModbusTcpServer<S> {
    listener: TcpListener,
    service: Arc<S>,
    config: ServerConfig,
    tracker: Arc<ConnectionTracker>,
}

impl ModbusTcpServer<Arc<RegisterImage>> {
    /// Bind a server backed by a fresh [`RegisterImage`] built from `config.image`.
    pub async fn with_image(config: ServerConfig) -> Result<Self, DataLinkError> {
        let image = Arc::new(RegisterImage::new(config.image));
        Self::bind(config, image).await
    }
}

impl<S: ModbusService> ModbusTcpServer<S> {
    pub async fn bind(config: ServerConfig, service: S) -> Result<Self, DataLinkError> {
        let listener = TcpListener::bind(config.socket_addr()).await?;
        Ok(Self::from_listener(listener, config, service))
    }

    pub fn from_listener(listener: TcpListener, config: ServerConfig, service: S) -> Self {
        let tracker = Arc::new(ConnectionTracker::new(config.client_expiry));
        Self {
            listener,
            service: Arc::new(service),
            config,
            tracker,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DataLinkError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Clients that sent a request within the expiry window.
    pub fn connected_clients(&self) -> usize {
        *self.tracker.count.borrow()
    }

    pub fn watch_clients(&self) -> watch::Receiver<usize> {
        self.tracker.count.subscribe()
    }

    /// Serve until the task is dropped or aborted.
    pub async fn run(self) -> Result<(), DataLinkError> {
        let (_keep, shutdown) = watch::channel(false);
        self.serve(shutdown).await
    }

    /// Serve on a background task controlled by the returned handle.
    pub fn spawn(self) -> Result<ServerHandle, DataLinkError> {
        let local_addr = self.local_addr()?;
        let clients = self.watch_clients();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.serve(shutdown_rx));
        Ok(ServerHandle {
            local_addr,
            clients,
            shutdown,
            task,
        })
    }

    async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DataLinkError> {
        let settings = DispatchSettings {
            unit_id: self.config.unit_id,
            max_pdu_len: self.config.max_pdu_len.clamp(ExceptionResponse::PDU_LEN, MAX_PDU_LEN),
            idle_timeout: self.config.idle_timeout,
        };
        let period = (self.config.client_expiry / 4).max(Duration::from_millis(100));
        let mut refresh = tokio::time::interval(period);
        let mut connections = JoinSet::new();
        let mut next_id = 0u64;
        info!(addr = %self.local_addr()?, unit_id = settings.unit_id, "modbus tcp server listening");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted?;
                    let _ = socket.set_nodelay(true);
                    next_id += 1;
                    let id = next_id;
                    let service = Arc::clone(&self.service);
                    let tracker = Arc::clone(&self.tracker);
                    tracker.touch(id);
                    debug!(%peer, "modbus tcp client connected");

                    connections.spawn(async move {
                        if let Err(err) = handle_connection(socket, service, settings, &tracker, id).await {
                            warn!(%peer, error = %err, "modbus tcp server connection ended with error");
                        }
                        tracker.remove(id);
                    });
                }
                _ = refresh.tick() => self.tracker.refresh(),
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        self.tracker.refresh();
        info!("modbus tcp server stopped");
        Ok(())
    }
}

/// Control over a server started with [`ModbusTcpServer::spawn`].
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    clients: watch::Receiver<usize>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), DataLinkError>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connected_clients(&self) -> usize {
        *self.clients.borrow()
    }

    /// Receives the client count whenever it changes.
    pub fn watch_clients(&self) -> watch::Receiver<usize> {
        self.clients.clone()
    }

    /// Close the listener and every connection, then wait for the server task.
    pub async fn shutdown(self) -> Result<(), DataLinkError> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(DataLinkError::Io(std::io::Error::other(err))),
        }
    }
}

async fn handle_connection<S: ModbusService>(
    mut socket: TcpStream,
    service: Arc<S>,
    settings: DispatchSettings,
    tracker: &ConnectionTracker,
    id: u64,
) -> Result<(), DataLinkError> {
    let mut request_pdu = vec![0u8; settings.max_pdu_len];
    let mut response_pdu = vec![0u8; settings.max_pdu_len];

    loop {
        let mut mbap = [0u8; tcp::MBAP_HEADER_LEN];
        let read = read_exact_or_connection_closed(&mut socket, &mut mbap);
        let read = match settings.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, read).await {
                Ok(read) => read,
                Err(_) => {
                    debug!(client = id, "closing idle modbus tcp connection");
                    return Ok(());
                }
            },
            None => read.await,
        };
        match read {
            Ok(()) => {}
            Err(DataLinkError::ConnectionClosed) => return Ok(()),
            Err(err) => return Err(err),
        }

        let header = tcp::MbapHeader::decode(&mut Reader::new(&mbap))?;
        let pdu_len = header.pdu_len();
        if pdu_len == 0 || pdu_len > settings.max_pdu_len {
            return Err(DataLinkError::InvalidResponse("invalid request pdu length"));
        }
        let request_pdu = &mut request_pdu[..pdu_len];
        read_exact_or_connection_closed(&mut socket, request_pdu).await?;
        tracker.touch(id);

        if header.unit_id != settings.unit_id && header.unit_id != 0 {
            debug!(
                correlation_id = header.transaction_id,
                unit_id = header.unit_id,
                "ignoring request for another unit"
            );
            continue;
        }

        let response_len = dispatch(&*service, header.unit_id, request_pdu, &mut response_pdu);
        if response_len == 0 {
            continue;
        }
        // A client that went away while we answered is not a server error.
        if let Err(err) = send_pdu(
            &mut socket,
            header.transaction_id,
            header.protocol_id,
            header.unit_id,
            &response_pdu[..response_len],
        )
        .await
        {
            debug!(client = id, error = %err, "dropping modbus tcp response");
            return Ok(());
        }
    }
}

/// Decode one request PDU, run it through `service` and write either its
/// response or an exception response into `response_pdu`.
fn dispatch<S: ModbusService + ?Sized>(
    service: &S,
    unit_id: u8,
    request_pdu: &[u8],
    response_pdu: &mut [u8],
) -> usize {
    let function = request_pdu.first().copied().unwrap_or(0) & 0x7F;
    let mut request_reader = Reader::new(request_pdu);
    let decoded = match DecodedRequest::decode(&mut request_reader) {
        Ok(req) if request_reader.is_empty() => req,
        Ok(_) => return write_exception(response_pdu, function, ExceptionCode::IllegalDataValue),
        Err(err) => {
            return write_exception(response_pdu, function, map_decode_error_to_exception(err))
        }
    };

    let function = decoded.function_code();
    debug!(
        unit_id,
        function = function.as_u8(),
        pdu_len = request_pdu.len(),
        "received modbus tcp request"
    );

    let code = match service.handle(unit_id, decoded, response_pdu) {
        Ok(len) if len > 0 && len <= response_pdu.len() => return len,
        Ok(_) => ExceptionCode::ServerDeviceFailure,
        Err(ServiceError::Exception(code)) => code,
        Err(ServiceError::InvalidRequest(_)) => ExceptionCode::IllegalDataValue,
        Err(ServiceError::Internal(reason)) => {
            warn!(function = function.as_u8(), reason, "modbus service failed");
            ExceptionCode::ServerDeviceFailure
        }
    };
    write_exception(response_pdu, function.as_u8(), code)
}

fn map_decode_error_to_exception(err: DecodeError) -> ExceptionCode {
    match err {
        DecodeError::InvalidFunctionCode => ExceptionCode::IllegalFunction,
        DecodeError::InvalidLength | DecodeError::InvalidValue | DecodeError::UnexpectedEof => {
            ExceptionCode::IllegalDataValue
        }
        DecodeError::InvalidCrc
        | DecodeError::InvalidLrc
        | DecodeError::InvalidFraming
        | DecodeError::Unsupported
        | DecodeError::Message(_) => ExceptionCode::ServerDeviceFailure,
    }
}

fn write_exception(response_pdu: &mut [u8], function_code: u8, exception_code: ExceptionCode) -> usize {
    let mut writer = Writer::new(response_pdu);
    match (ExceptionResponse {
        function_code,
        exception_code,
    })
    .encode(&mut writer)
    {
        Ok(()) => writer.position(),
        Err(_) => 0,
    }
}

async fn send_pdu(
    socket: &mut TcpStream,
    transaction_id: u16,
    protocol_id: u16,
    unit_id: u8,
    pdu: &[u8],
) -> Result<(), DataLinkError> {
    let mut frame = vec![0u8; tcp::MBAP_HEADER_LEN + pdu.len()];
    let mut frame_writer = Writer::new(&mut frame);
    tcp::encode_frame(&mut frame_writer, transaction_id, protocol_id, unit_id, pdu)?;

    debug!(
        correlation_id = transaction_id,
        unit_id,
        pdu_len = pdu.len(),
        "sending modbus tcp server response"
    );
    socket.write_all(frame_writer.as_written()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{dispatch, ModbusService, ModbusTcpServer, ServerConfig, ServiceError};
    use crate::config::{SocketConfig, Timeouts};
    use crate::image::ImageConfig;
    use crate::{DataLink, DataLinkError, TcpSession};
    use modlink_core::pdu::{DecodedRequest, ExceptionCode, Table};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    struct EchoReadService;

    impl ModbusService for EchoReadService {
        fn handle(
            &self,
            _unit_id: u8,
            request: DecodedRequest<'_>,
            response_pdu: &mut [u8],
        ) -> Result<usize, ServiceError> {
            match request {
                DecodedRequest::Read(req) if req.table == Table::HoldingRegisters => {
                    let bytes = [0x03u8, 0x02, 0x00, 0x2A];
                    response_pdu[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                _ => Err(ServiceError::Exception(ExceptionCode::IllegalFunction)),
            }
        }
    }

    fn loopback() -> ServerConfig {
        ServerConfig::default()
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_port(0)
            .with_image(ImageConfig::uniform(16))
    }

    async fn session(addr: SocketAddr) -> TcpSession {
        TcpSession::connect(
            SocketConfig::new(addr.ip().to_string(), addr.port())
                .with_timeouts(Timeouts::uniform(Duration::from_millis(300))),
        )
        .await
        .unwrap()
    }

    #[test]
    fn dispatch_maps_failures_to_exceptions() {
        let mut response = [0u8; 16];
        let len = dispatch(&EchoReadService, 1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response);
        assert_eq!(&response[..len], &[0x03, 0x02, 0x00, 0x2A]);

        let len = dispatch(&EchoReadService, 1, &[0x01, 0x00, 0x00, 0x00, 0x01], &mut response);
        assert_eq!(&response[..len], &[0x81, 0x01]);

        let len = dispatch(&EchoReadService, 1, &[0x2B, 0x0E, 0x01, 0x00], &mut response);
        assert_eq!(&response[..len], &[0xAB, 0x01]);

        let len = dispatch(
            &EchoReadService,
            1,
            &[0x10, 0x00, 0x00, 0x00, 0x02, 0x03, 0x12, 0x34, 0x56],
            &mut response,
        );
        assert_eq!(&response[..len], &[0x90, 0x03]);

        let len = dispatch(&EchoReadService, 1, &[0x03, 0x00, 0x00, 0x00, 0x01, 0xFF], &mut response);
        assert_eq!(&response[..len], &[0x83, 0x03]);
    }

    #[tokio::test]
    async fn tcp_server_handles_basic_read_request() {
        let server = ModbusTcpServer::bind(loopback(), EchoReadService)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        let session = session(addr).await;
        let mut response = [0u8; 32];
        let len = session
            .exchange(1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap();
        assert_eq!(&response[..len], &[0x03, 0x02, 0x00, 0x2A]);

        session.shutdown().await;
        task.abort();
        let _ = task.await;
    }

    #[tokio::test]
    async fn other_units_are_ignored_and_broadcast_answered() {
        let server = ModbusTcpServer::with_image(loopback()).await.unwrap();
        let handle = server.spawn().unwrap();

        let session = session(handle.local_addr()).await;
        let mut response = [0u8; 32];
        let err = session
            .exchange(5, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap_err();
        assert!(matches!(err, DataLinkError::Timeout));
        session.shutdown().await;

        let session = self::session(handle.local_addr()).await;
        let len = session
            .exchange(0, &[0x06, 0x00, 0x02, 0x00, 0x07], &mut response)
            .await
            .unwrap();
        assert_eq!(&response[..len], &[0x06, 0x00, 0x02, 0x00, 0x07]);

        session.shutdown().await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn image_server_writes_and_notifies() {
        let server = ModbusTcpServer::with_image(loopback()).await.unwrap();
        let image = server.service().clone();
        let mut changes = image.subscribe();
        let handle = server.spawn().unwrap();

        let session = session(handle.local_addr()).await;
        let mut response = [0u8; 32];
        session
            .exchange(1, &[0x06, 0x00, 0x00, 0x00, 0x64], &mut response)
            .await
            .unwrap();
        let len = session
            .exchange(1, &[0x03, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap();
        assert_eq!(&response[..len], &[0x03, 0x02, 0x00, 0x64]);

        let change = changes.recv().await.unwrap();
        assert_eq!(change.table, Table::HoldingRegisters);
        assert_eq!((change.address, change.count), (0, 1));

        let len = session
            .exchange(1, &[0x03, 0x00, 0x0F, 0x00, 0x02], &mut response)
            .await
            .unwrap();
        assert_eq!(&response[..len], &[0x83, 0x02]);

        session.shutdown().await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn counts_active_clients() {
        let config = ServerConfig {
            client_expiry: Duration::from_millis(400),
            ..loopback()
        };
        let handle = ModbusTcpServer::with_image(config).await.unwrap().spawn().unwrap();
        let mut clients = handle.watch_clients();
        assert_eq!(handle.connected_clients(), 0);

        let session = session(handle.local_addr()).await;
        let mut response = [0u8; 32];
        session
            .exchange(1, &[0x01, 0x00, 0x00, 0x00, 0x01], &mut response)
            .await
            .unwrap();
        clients.wait_for(|count| *count == 1).await.unwrap();

        // Silent clients age out of the count.
        tokio::time::timeout(Duration::from_secs(2), clients.wait_for(|count| *count == 0))
            .await
            .unwrap()
            .unwrap();

        session.shutdown().await;
        handle.shutdown().await.unwrap();
    }
}
