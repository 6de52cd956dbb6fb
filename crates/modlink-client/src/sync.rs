//! Blocking front end for callers without an async runtime.

use crate::{ClientConfig, ClientError, ModbusClient};
use modlink_core::{RegisterValue, ScalarKind, Value};
use modlink_datalink::{DataLink, DataLinkError, SocketConfig, TcpSession, UdpSession};
use std::future::Future;
use thiserror::Error;
use tokio::runtime::Runtime;

#[cfg(feature = "serial")]
use modlink_core::Transport;
#[cfg(feature = "serial")]
use modlink_datalink::{SerialConfig, SerialSession};

#[derive(Debug, Error)]
pub enum SyncClientError {
    #[error("runtime init error: {0}")]
    RuntimeInit(std::io::Error),
    #[error("datalink error: {0}")]
    DataLink(#[from] DataLinkError),
    #[error("client error: {0}")]
    Client(#[from] ClientError),
}

fn runtime() -> Result<Runtime, SyncClientError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(SyncClientError::RuntimeInit)
}

/// A [`ModbusClient`] driven by its own multi-threaded runtime, which also
/// hosts the session's reconnect watchdog.
pub struct SyncModbusClient<D: DataLink> {
    runtime: Runtime,
    client: ModbusClient<D>,
}

impl SyncModbusClient<TcpSession> {
    /// Connect before returning; fails if the first connect fails.
    pub fn connect_tcp(socket: SocketConfig, config: ClientConfig) -> Result<Self, SyncClientError> {
        let runtime = runtime()?;
        let link = runtime.block_on(TcpSession::connect(socket))?;
        Ok(Self::from_parts(runtime, link, config))
    }
}

impl SyncModbusClient<UdpSession> {
    pub fn udp(socket: SocketConfig, config: ClientConfig) -> Result<Self, SyncClientError> {
        let runtime = runtime()?;
        Ok(Self::from_parts(runtime, UdpSession::new(socket), config))
    }
}

#[cfg(feature = "serial")]
impl SyncModbusClient<SerialSession> {
    /// Open a serial line with RTU or ASCII framing.
    pub fn serial(
        serial: SerialConfig,
        framing: Transport,
        config: ClientConfig,
    ) -> Result<Self, SyncClientError> {
        let runtime = runtime()?;
        let link = {
            let _guard = runtime.enter();
            SerialSession::open(serial, framing)?
        };
        Ok(Self::from_parts(runtime, link, config))
    }
}

impl<D: DataLink> SyncModbusClient<D> {
    pub fn from_parts(runtime: Runtime, link: D, config: ClientConfig) -> Self {
        Self {
            runtime,
            client: ModbusClient::with_config(link, config),
        }
    }

    pub fn config(&self) -> ClientConfig {
        self.client.config()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// The async client, for use with [`Self::block_on`].
    pub fn client(&self) -> &ModbusClient<D> {
        &self.client
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn run<T>(&self, future: impl Future<Output = Result<T, ClientError>>) -> Result<T, SyncClientError> {
        self.runtime.block_on(future).map_err(SyncClientError::Client)
    }

    pub fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, SyncClientError> {
        self.run(self.client.read_coils(address, quantity))
    }

    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Result<Vec<bool>, SyncClientError> {
        self.run(self.client.read_discrete_inputs(address, quantity))
    }

    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, SyncClientError> {
        self.run(self.client.read_holding_registers(address, quantity))
    }

    pub fn read_input_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, SyncClientError> {
        self.run(self.client.read_input_registers(address, quantity))
    }

    pub fn write_single_coil(&self, address: u16, value: bool) -> Result<(), SyncClientError> {
        self.run(self.client.write_single_coil(address, value))
    }

    pub fn write_single_register(&self, address: u16, value: u16) -> Result<(), SyncClientError> {
        self.run(self.client.write_single_register(address, value))
    }

    pub fn write_multiple_coils(&self, address: u16, values: &[bool]) -> Result<(), SyncClientError> {
        self.run(self.client.write_multiple_coils(address, values))
    }

    pub fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<(), SyncClientError> {
        self.run(self.client.write_multiple_registers(address, values))
    }

    pub fn mask_write_register(&self, address: u16, and_mask: u16, or_mask: u16) -> Result<(), SyncClientError> {
        self.run(self.client.mask_write_register(address, and_mask, or_mask))
    }

    pub fn read_write_multiple_registers(
        &self,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> Result<Vec<u16>, SyncClientError> {
        self.run(self.client.read_write_multiple_registers(
            read_address,
            read_quantity,
            write_address,
            values,
        ))
    }

    pub fn read<T: RegisterValue>(&self, address: u16, input: bool) -> Result<T, SyncClientError> {
        self.run(self.client.read::<T>(address, input))
    }

    pub fn read_many<T: RegisterValue>(
        &self,
        address: u16,
        quantity: usize,
        input: bool,
    ) -> Result<Vec<T>, SyncClientError> {
        self.run(self.client.read_many::<T>(address, quantity, input))
    }

    pub fn write<T: RegisterValue>(&self, address: u16, value: T) -> Result<(), SyncClientError> {
        self.run(self.client.write(address, value))
    }

    pub fn write_many<T: RegisterValue>(&self, address: u16, values: &[T]) -> Result<(), SyncClientError> {
        self.run(self.client.write_many(address, values))
    }

    pub fn read_value(&self, kind: ScalarKind, address: u16, input: bool) -> Result<Value, SyncClientError> {
        self.run(self.client.read_value(kind, address, input))
    }

    pub fn write_value(&self, address: u16, value: &Value) -> Result<(), SyncClientError> {
        self.run(self.client.write_value(address, value))
    }

    pub fn read_bools(&self, address: u16, quantity: usize, input: bool) -> Result<Vec<bool>, SyncClientError> {
        self.run(self.client.read_bools(address, quantity, input))
    }

    pub fn write_bools(&self, address: u16, values: &[bool]) -> Result<(), SyncClientError> {
        self.run(self.client.write_bools(address, values))
    }

    pub fn read_text(&self, address: u16, words: usize, input: bool) -> Result<String, SyncClientError> {
        self.run(self.client.read_text(address, words, input))
    }

    pub fn write_text(&self, address: u16, text: &str, words: usize) -> Result<(), SyncClientError> {
        self.run(self.client.write_text(address, text, words))
    }

    pub fn read_bit(&self, address: u16, bit: u8, input: bool) -> Result<bool, SyncClientError> {
        self.run(self.client.read_bit(address, bit, input))
    }

    pub fn write_bit(&self, address: u16, bit: u8, value: bool) -> Result<(), SyncClientError> {
        self.run(self.client.write_bit(address, bit, value))
    }
}
