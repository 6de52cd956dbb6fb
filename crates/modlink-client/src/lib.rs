//! Typed Modbus master built on a [`DataLink`] session.
//!
//! [`ModbusClient`] exposes the ten function codes as named primitives,
//! validated before any byte is sent. On top of those it layers chunked typed
//! reads and writes, bit access inside holding registers, and the
//! [`points`] registration table with its polling task.

#![forbid(unsafe_code)]

mod bits;
pub mod chunk;
pub mod points;
pub mod sync;
mod typed;

pub use chunk::{Chunk, ChunkPlan};
pub use points::{PointChange, PointSpec, PointTable, PollConfig, Poller, Span};
pub use sync::{SyncClientError, SyncModbusClient};

pub use modlink_core::pdu::{ExceptionCode, ExceptionResponse, Table};
pub use modlink_core::{RegisterValue, ScalarKind, Value, WordOrder};

use modlink_core::codec::{apply_mask, unpack_bits};
use modlink_core::encoding::{Reader, Writer};
use modlink_core::pdu::{
    check_span, MaskWriteRequest, RangeError, ReadRequest, ReadWriteRegistersRequest, Request,
    Response, WriteCoilRequest, WriteCoilsRequest, WriteRegisterRequest, WriteRegistersRequest,
    MAX_PDU_LEN, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_RW_WRITE_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};
use modlink_core::{DecodeError, EncodeError};
use modlink_datalink::{DataLink, DataLinkError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

/// Which requests may be repeated after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    #[default]
    Never,
    ReadOnly,
    All,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub unit_id: u8,
    pub word_order: WordOrder,
    /// Use FC22 for masked writes. When off, the client reads the register
    /// and writes the combined value back, which is not atomic against other
    /// masters writing the same register.
    pub enable_mask: bool,
    /// Upper bound on one exchange, on top of the session's own timeouts.
    pub response_timeout: Option<Duration>,
    pub retry_count: u8,
    pub retry_policy: RetryPolicy,
    /// Minimum spacing between consecutive requests.
    pub throttle_delay: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            unit_id: 1,
            word_order: WordOrder::LowHigh,
            enable_mask: true,
            response_timeout: None,
            retry_count: 0,
            retry_policy: RetryPolicy::Never,
            throttle_delay: None,
        }
    }
}

impl ClientConfig {
    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_word_order(mut self, word_order: WordOrder) -> Self {
        self.word_order = word_order;
        self
    }

    pub fn with_enable_mask(mut self, enable_mask: bool) -> Self {
        self.enable_mask = enable_mask;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u8) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_throttle_delay(mut self, throttle_delay: Option<Duration>) -> Self {
        self.throttle_delay = throttle_delay;
        self
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("datalink error: {0}")]
    DataLink(#[from] DataLinkError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("request timed out")]
    Timeout,
    #[error("modbus exception: {0}")]
    Exception(ExceptionResponse),
    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),
    #[error("invalid request: {0}")]
    Validation(&'static str),
    #[error("unknown point: {0}")]
    UnknownPoint(String),
    #[error("point kind mismatch: {0}")]
    PointKind(&'static str),
}

impl ClientError {
    /// Transport failures; the only errors a retry can cure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::DataLink(err) => err.is_transport(),
            _ => false,
        }
    }

    /// The remote exception code, if the slave rejected the request.
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            Self::Exception(ex) => Some(ex.exception_code),
            _ => None,
        }
    }
}

pub(crate) fn check_quantity(address: u16, quantity: usize, max: u16) -> Result<u16, ClientError> {
    check_span(address, quantity, max).map_err(|err| match err {
        RangeError::Quantity => ClientError::Validation("quantity is zero or above the function limit"),
        RangeError::Address => ClientError::Validation("address range runs past 65535"),
    })
}

const UNEXPECTED_FUNCTION: ClientError = ClientError::InvalidResponse("unexpected function response");

pub struct ModbusClient<D: DataLink> {
    datalink: D,
    config: ClientConfig,
    last_request_at: Mutex<Option<Instant>>,
    request_counter: AtomicU64,
}

impl<D: DataLink> ModbusClient<D> {
    pub fn new(datalink: D) -> Self {
        Self::with_config(datalink, ClientConfig::default())
    }

    pub fn with_config(datalink: D, config: ClientConfig) -> Self {
        Self {
            datalink,
            config,
            last_request_at: Mutex::new(None),
            request_counter: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> ClientConfig {
        self.config
    }

    pub fn datalink(&self) -> &D {
        &self.datalink
    }

    pub fn is_connected(&self) -> bool {
        self.datalink.is_connected()
    }

    fn next_correlation_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::Relaxed)
    }

    async fn apply_throttle(&self) {
        let Some(delay) = self.config.throttle_delay else {
            return;
        };

        let mut last = self.last_request_at.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn request_is_retry_eligible(&self, request: &Request<'_>) -> bool {
        match self.config.retry_policy {
            RetryPolicy::Never => false,
            RetryPolicy::All => true,
            RetryPolicy::ReadOnly => !request.function_code().is_write(),
        }
    }

    async fn attempt(&self, request_pdu: &[u8], response_buf: &mut [u8]) -> Result<usize, ClientError> {
        let exchange = self
            .datalink
            .exchange(self.config.unit_id, request_pdu, response_buf);
        match self.config.response_timeout {
            Some(limit) => match timeout(limit, exchange).await {
                Ok(result) => result.map_err(ClientError::DataLink),
                Err(_) => {
                    // The session may still hold half a response.
                    self.datalink.request_reconnect();
                    Err(ClientError::Timeout)
                }
            },
            None => exchange.await.map_err(ClientError::DataLink),
        }
    }

    async fn exchange_raw(
        &self,
        correlation_id: u64,
        request_pdu: &[u8],
        response_buf: &mut [u8],
        retry_eligible: bool,
    ) -> Result<usize, ClientError> {
        self.apply_throttle().await;

        let unit_id = self.config.unit_id;
        let attempts = usize::from(self.config.retry_count) + 1;
        let mut attempt = 1;
        loop {
            match self.attempt(request_pdu, response_buf).await {
                Ok(len) => {
                    debug!(correlation_id, unit_id, attempt, len, "modbus request succeeded");
                    return Ok(len);
                }
                Err(err) if attempt < attempts && retry_eligible && err.is_retryable() => {
                    warn!(
                        correlation_id,
                        unit_id,
                        attempt,
                        error = %err,
                        "retrying modbus request after transport error"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_request<'a>(
        &self,
        request: &Request<'_>,
        response_storage: &'a mut [u8],
    ) -> Result<Response<'a>, ClientError> {
        let correlation_id = self.next_correlation_id();
        let mut req_buf = [0u8; MAX_PDU_LEN];
        let mut writer = Writer::new(&mut req_buf);
        request.encode(&mut writer)?;

        debug!(
            correlation_id,
            unit_id = self.config.unit_id,
            function = request.function_code().as_u8(),
            pdu_len = writer.as_written().len(),
            "dispatching modbus request"
        );
        let retry_eligible = self.request_is_retry_eligible(request);

        let response_len = self
            .exchange_raw(
                correlation_id,
                writer.as_written(),
                response_storage,
                retry_eligible,
            )
            .await?;

        let mut reader = Reader::new(&response_storage[..response_len]);
        let response = Response::decode(&mut reader)?;
        if !reader.is_empty() {
            return Err(ClientError::InvalidResponse("trailing bytes in response"));
        }
        if let Response::Exception(ex) = response {
            if ex.function_code != request.function_code().as_u8() {
                return Err(ClientError::InvalidResponse("exception for another function"));
            }
            return Err(ClientError::Exception(ex));
        }

        Ok(response)
    }

    async fn read_bit_table(
        &self,
        table: Table,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, ClientError> {
        check_quantity(address, usize::from(quantity), MAX_READ_BITS)?;
        let request = Request::Read(ReadRequest {
            table,
            address,
            quantity,
        });

        let mut response_buf = [0u8; MAX_PDU_LEN];
        match self.send_request(&request, &mut response_buf).await? {
            Response::ReadBits { table: got, packed } if got == table => {
                let mut out = vec![false; usize::from(quantity)];
                unpack_bits(packed, &mut out)
                    .map_err(|_| ClientError::InvalidResponse("bit payload shorter than requested"))?;
                Ok(out)
            }
            _ => Err(UNEXPECTED_FUNCTION),
        }
    }

    async fn read_word_table(
        &self,
        table: Table,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ClientError> {
        check_quantity(address, usize::from(quantity), MAX_READ_REGISTERS)?;
        let request = Request::Read(ReadRequest {
            table,
            address,
            quantity,
        });

        let mut response_buf = [0u8; MAX_PDU_LEN];
        match self.send_request(&request, &mut response_buf).await? {
            Response::ReadRegisters { table: got, words } if got == table => {
                let count = usize::from(quantity);
                if words.len() < count {
                    return Err(ClientError::InvalidResponse(
                        "register payload shorter than requested",
                    ));
                }
                Ok(words.iter().take(count).collect())
            }
            _ => Err(UNEXPECTED_FUNCTION),
        }
    }

    /// FC01.
    pub async fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ClientError> {
        self.read_bit_table(Table::Coils, address, quantity).await
    }

    /// FC02.
    pub async fn read_discrete_inputs(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, ClientError> {
        self.read_bit_table(Table::DiscreteInputs, address, quantity)
            .await
    }

    /// FC03.
    pub async fn read_holding_registers(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ClientError> {
        self.read_word_table(Table::HoldingRegisters, address, quantity)
            .await
    }

    /// FC04.
    pub async fn read_input_registers(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ClientError> {
        self.read_word_table(Table::InputRegisters, address, quantity)
            .await
    }

    /// FC05.
    pub async fn write_single_coil(&self, address: u16, value: bool) -> Result<(), ClientError> {
        let sent = WriteCoilRequest { address, value };
        let mut response_buf = [0u8; MAX_PDU_LEN];
        match self
            .send_request(&Request::WriteCoil(sent), &mut response_buf)
            .await?
        {
            Response::WriteCoil(echo) if echo == sent => Ok(()),
            Response::WriteCoil(_) => Err(ClientError::InvalidResponse("write single coil echo mismatch")),
            _ => Err(UNEXPECTED_FUNCTION),
        }
    }

    /// FC06.
    pub async fn write_single_register(&self, address: u16, value: u16) -> Result<(), ClientError> {
        let sent = WriteRegisterRequest { address, value };
        let mut response_buf = [0u8; MAX_PDU_LEN];
        match self
            .send_request(&Request::WriteRegister(sent), &mut response_buf)
            .await?
        {
            Response::WriteRegister(echo) if echo == sent => Ok(()),
            Response::WriteRegister(_) => Err(ClientError::InvalidResponse(
                "write single register echo mismatch",
            )),
            _ => Err(UNEXPECTED_FUNCTION),
        }
    }

    /// FC15.
    pub async fn write_multiple_coils(&self, address: u16, values: &[bool]) -> Result<(), ClientError> {
        let expected_qty = check_quantity(address, values.len(), MAX_WRITE_COILS)?;
        let request = Request::WriteCoils(WriteCoilsRequest { address, values });

        let mut response_buf = [0u8; MAX_PDU_LEN];
        match self.send_request(&request, &mut response_buf).await? {
            Response::WriteCoils {
                address: echoed,
                quantity,
            } if echoed == address && quantity == expected_qty => Ok(()),
            Response::WriteCoils { .. } => Err(ClientError::InvalidResponse(
                "write multiple coils echo mismatch",
            )),
            _ => Err(UNEXPECTED_FUNCTION),
        }
    }

    /// FC16.
    pub async fn write_multiple_registers(
        &self,
        address: u16,
        values: &[u16],
    ) -> Result<(), ClientError> {
        let expected_qty = check_quantity(address, values.len(), MAX_WRITE_REGISTERS)?;
        let request = Request::WriteRegisters(WriteRegistersRequest { address, values });

        let mut response_buf = [0u8; MAX_PDU_LEN];
        match self.send_request(&request, &mut response_buf).await? {
            Response::WriteRegisters {
                address: echoed,
                quantity,
            } if echoed == address && quantity == expected_qty => Ok(()),
            Response::WriteRegisters { .. } => Err(ClientError::InvalidResponse(
                "write multiple registers echo mismatch",
            )),
            _ => Err(UNEXPECTED_FUNCTION),
        }
    }

    /// FC22, or a read-modify-write when masked writes are disabled.
    ///
    /// Bits set in `and_mask` keep their current value; the others are
    /// taken from `or_mask`.
    pub async fn mask_write_register(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<(), ClientError> {
        if !self.config.enable_mask {
            let current = self
                .read_holding_registers(address, 1)
                .await?
                .first()
                .copied()
                .ok_or(ClientError::InvalidResponse("empty register payload"))?;
            return self
                .write_single_register(address, apply_mask(current, and_mask, or_mask))
                .await;
        }

        let sent = MaskWriteRequest {
            address,
            and_mask,
            or_mask,
        };
        let mut response_buf = [0u8; MAX_PDU_LEN];
        match self
            .send_request(&Request::MaskWrite(sent), &mut response_buf)
            .await?
        {
            Response::MaskWrite(echo) if echo == sent => Ok(()),
            Response::MaskWrite(_) => Err(ClientError::InvalidResponse(
                "mask write register echo mismatch",
            )),
            _ => Err(UNEXPECTED_FUNCTION),
        }
    }

    /// FC23. The slave performs the write before the read.
    pub async fn read_write_multiple_registers(
        &self,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> Result<Vec<u16>, ClientError> {
        check_quantity(read_address, usize::from(read_quantity), MAX_READ_REGISTERS)?;
        check_quantity(write_address, values.len(), MAX_RW_WRITE_REGISTERS)?;
        let request = Request::ReadWriteRegisters(ReadWriteRegistersRequest {
            read_address,
            read_quantity,
            write_address,
            values,
        });

        let mut response_buf = [0u8; MAX_PDU_LEN];
        match self.send_request(&request, &mut response_buf).await? {
            Response::ReadWriteRegisters { words } => {
                let count = usize::from(read_quantity);
                if words.len() < count {
                    return Err(ClientError::InvalidResponse(
                        "read-write register payload shorter than requested",
                    ));
                }
                Ok(words.iter().take(count).collect())
            }
            _ => Err(UNEXPECTED_FUNCTION),
        }
    }
}
