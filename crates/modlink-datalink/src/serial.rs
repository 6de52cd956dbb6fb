//! RTU and ASCII sessions on a serial port.

use crate::config::SerialConfig;
use crate::watchdog::{Reconnect, Watchdog};
use crate::{ascii, rtu, DataLink, DataLinkError};
use async_trait::async_trait;
use modlink_core::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

/// A serial line speaking RTU or ASCII framing.
///
/// Like [`crate::TcpSession`], a transport failure closes the port and the
/// watchdog reopens it in the background.
#[derive(Debug)]
pub struct SerialSession {
    inner: Arc<SerialInner>,
    watchdog: Watchdog,
}

#[derive(Debug)]
struct SerialInner {
    config: SerialConfig,
    framing: Transport,
    port: Mutex<Option<SerialStream>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl SerialSession {
    /// Open the port. `framing` must be [`Transport::Rtu`] or [`Transport::Ascii`].
    ///
    /// A port that fails to open is retried by the watchdog; the session is
    /// returned either way. Must be called from within a tokio runtime.
    pub fn open(config: SerialConfig, framing: Transport) -> Result<Self, DataLinkError> {
        if framing.uses_mbap() {
            return Err(DataLinkError::InvalidResponse(
                "serial sessions carry rtu or ascii framing",
            ));
        }
        let period = config.timeouts.reconnect_period();
        let name = format!("{framing}://{}", config.port_name);
        let port = match open_port(&config) {
            Ok(port) => Some(port),
            Err(err) => {
                warn!(port = %config.port_name, error = %err, "serial port unavailable, will retry");
                None
            }
        };
        let inner = Arc::new(SerialInner {
            config,
            framing,
            connected: AtomicBool::new(port.is_some()),
            port: Mutex::new(port),
            closed: AtomicBool::new(false),
        });

        let watchdog = Watchdog::spawn(inner.clone(), period, name);
        if !inner.connected.load(Ordering::SeqCst) {
            watchdog.signal();
        }
        Ok(Self { inner, watchdog })
    }

    pub fn config(&self) -> &SerialConfig {
        &self.inner.config
    }

    pub fn reconnect(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.watchdog.signal();
    }

    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        *self.inner.port.lock().await = None;
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.watchdog.shutdown().await;
    }
}

fn open_port(config: &SerialConfig) -> Result<SerialStream, DataLinkError> {
    tokio_serial::new(&config.port_name, config.baud_rate)
        .data_bits(config.data_bits)
        .parity(config.parity)
        .stop_bits(config.stop_bits)
        .flow_control(config.flow_control)
        .open_native_async()
        .map_err(|err| {
            DataLinkError::Io(std::io::Error::other(format!(
                "failed to open serial port '{}': {err}",
                config.port_name
            )))
        })
}

#[async_trait]
impl Reconnect for SerialInner {
    fn needs_reconnect(&self) -> bool {
        !self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), DataLinkError> {
        let mut port = self.port.lock().await;
        *port = None;
        self.connected.store(false, Ordering::SeqCst);
        *port = Some(open_port(&self.config)?);
        self.connected.store(true, Ordering::SeqCst);
        debug!(port = %self.config.port_name, "serial port reopened");
        Ok(())
    }
}

#[async_trait]
impl DataLink for SerialSession {
    async fn exchange(
        &self,
        unit_id: u8,
        request_pdu: &[u8],
        response_pdu: &mut [u8],
    ) -> Result<usize, DataLinkError> {
        let mut port = self.inner.port.lock().await;
        let Some(stream) = port.as_mut() else {
            self.watchdog.signal();
            return Err(DataLinkError::NotConnected);
        };

        let timeouts = &self.inner.config.timeouts;
        let result = match self.inner.framing {
            Transport::Ascii => {
                ascii::exchange(stream, unit_id, request_pdu, response_pdu, timeouts).await
            }
            _ => rtu::exchange(stream, unit_id, request_pdu, response_pdu, timeouts).await,
        };

        if let Err(err) = &result {
            if err.is_transport() {
                warn!(
                    port = %self.inner.config.port_name,
                    error = %err,
                    "serial session failed, scheduling reopen"
                );
                *port = None;
                self.inner.connected.store(false, Ordering::SeqCst);
                self.watchdog.signal();
            }
        }
        result
    }

    fn transport(&self) -> Transport {
        self.inner.framing
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn request_reconnect(&self) {
        self.reconnect();
    }
}
