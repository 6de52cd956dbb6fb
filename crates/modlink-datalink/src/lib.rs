//! Async Modbus transport sessions and the TCP slave.
//!
//! Every session implements [`DataLink`]: one request PDU in, one response
//! PDU out, serialized per session. TCP and serial sessions own a
//! [`Watchdog`] that re-establishes the link in the background after a
//! transport failure.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use modlink_core::{DecodeError, EncodeError, Transport};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub mod ascii;
pub mod config;
pub mod image;
pub mod rtu;
#[cfg(feature = "serial")]
pub mod serial;
pub mod server;
pub mod tcp;
pub mod udp;
pub mod watchdog;

pub use config::{SocketConfig, Timeouts};
#[cfg(feature = "serial")]
pub use config::SerialConfig;
pub use image::{ImageChange, ImageConfig, RegisterImage, TableConfig};
#[cfg(feature = "serial")]
pub use serial::SerialSession;
pub use server::{ModbusService, ModbusTcpServer, ServerConfig, ServerHandle, ServiceError};
pub use tcp::TcpSession;
pub use udp::UdpSession;
pub use watchdog::{Reconnect, Watchdog};

#[derive(Debug, Error)]
pub enum DataLinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),
    #[error("transaction id mismatch: expected {expected}, got {got}")]
    MismatchedTransactionId { expected: u16, got: u16 },
    #[error("protocol id mismatch: expected {expected}, got {got}")]
    MismatchedProtocolId { expected: u16, got: u16 },
    #[error("unit id mismatch: expected {expected}, got {got}")]
    MismatchedUnitId { expected: u8, got: u8 },
    #[error("response buffer too small (needed {needed}, available {available})")]
    ResponseBufferTooSmall { needed: usize, available: usize },
}

impl DataLinkError {
    /// Failures of the link itself rather than of one exchange's content.
    /// Long-lived sessions schedule a reconnect on these.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::NotConnected | Self::Timeout
        )
    }
}

#[async_trait]
pub trait DataLink: Send + Sync {
    /// Send a request PDU to a unit and write the response PDU into `response_pdu`.
    ///
    /// Returns the number of response bytes written to `response_pdu`.
    async fn exchange(
        &self,
        unit_id: u8,
        request_pdu: &[u8],
        response_pdu: &mut [u8],
    ) -> Result<usize, DataLinkError>;

    fn transport(&self) -> Transport;

    /// Connectionless links always report true.
    fn is_connected(&self) -> bool {
        true
    }

    /// Wake the reconnect watchdog, if the link has one.
    fn request_reconnect(&self) {}
}

#[async_trait]
impl<T: DataLink + ?Sized> DataLink for Box<T> {
    async fn exchange(
        &self,
        unit_id: u8,
        request_pdu: &[u8],
        response_pdu: &mut [u8],
    ) -> Result<usize, DataLinkError> {
        (**self).exchange(unit_id, request_pdu, response_pdu).await
    }

    fn transport(&self) -> Transport {
        (**self).transport()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn request_reconnect(&self) {
        (**self).request_reconnect()
    }
}

#[async_trait]
impl<T: DataLink + ?Sized> DataLink for Arc<T> {
    async fn exchange(
        &self,
        unit_id: u8,
        request_pdu: &[u8],
        response_pdu: &mut [u8],
    ) -> Result<usize, DataLinkError> {
        (**self).exchange(unit_id, request_pdu, response_pdu).await
    }

    fn transport(&self) -> Transport {
        (**self).transport()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn request_reconnect(&self) {
        (**self).request_reconnect()
    }
}

static TRANSACTION_ID: AtomicU16 = AtomicU16::new(0);

/// Next MBAP transaction id. One counter is shared by every session in the
/// process and wraps modulo 65536.
pub fn next_transaction_id() -> u16 {
    TRANSACTION_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}
