//! TOML configuration shared by the tools.
//!
//! Every section is optional; missing keys fall back to the library
//! defaults. Durations are given in milliseconds.

use crate::ToolError;
use modlink_client::{ClientConfig, PointSpec, PointTable, PollConfig, RetryPolicy};
use modlink_core::pdu::Table;
use modlink_core::{ScalarKind, Transport, WordOrder};
use modlink_datalink::{ImageConfig, SerialConfig, ServerConfig, SocketConfig, TableConfig, Timeouts};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tokio_serial::{DataBits, Parity, StopBits};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    pub server: ServerSection,
    pub socket: SocketSection,
    pub serial: SerialSection,
    pub client: ClientSection,
    pub points: Vec<PointEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: IpAddr,
    pub port: u16,
    pub unit_id: u8,
    /// Entries per table unless the table sets its own `size`.
    pub size: usize,
    pub client_expiry_ms: u64,
    pub coils: TableSection,
    pub discrete_inputs: TableSection,
    pub holding_registers: TableSection,
    pub input_registers: TableSection,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind: defaults.bind_address,
            port: defaults.port,
            unit_id: defaults.unit_id,
            size: TableConfig::default().size,
            client_expiry_ms: defaults.client_expiry.as_millis() as u64,
            coils: TableSection::default(),
            discrete_inputs: TableSection::default(),
            holding_registers: TableSection::default(),
            input_registers: TableSection::default(),
        }
    }
}

/// `[server.coils]` and its siblings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableSection {
    pub enabled: bool,
    pub size: Option<usize>,
}

impl Default for TableSection {
    fn default() -> Self {
        Self {
            enabled: true,
            size: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketSection {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub local_port: Option<u16>,
    pub protocol_id: u16,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,
}

impl Default for SocketSection {
    fn default() -> Self {
        let defaults = SocketConfig::default();
        let timeouts = Timeouts::default();
        Self {
            transport: Transport::Tcp,
            host: defaults.host,
            port: defaults.port,
            local_port: None,
            protocol_id: defaults.protocol_id,
            connect_timeout_ms: timeouts.connect.as_millis() as u64,
            send_timeout_ms: timeouts.send.as_millis() as u64,
            receive_timeout_ms: timeouts.receive.as_millis() as u64,
        }
    }
}

impl SocketSection {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            send: Duration::from_millis(self.send_timeout_ms),
            receive: Duration::from_millis(self.receive_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSection {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    /// `none`, `odd` or `even`.
    pub parity: String,
    pub stop_bits: u8,
}

impl Default for SerialSection {
    fn default() -> Self {
        let defaults = SerialConfig::default();
        Self {
            port_name: defaults.port_name,
            baud_rate: defaults.baud_rate,
            data_bits: 8,
            parity: "none".to_string(),
            stop_bits: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    pub unit_id: u8,
    pub word_order: WordOrder,
    pub enable_mask: bool,
    pub retries: u8,
    pub response_timeout_ms: Option<u64>,
    /// Auto-read interval for `[[points]]`; polling only on demand when unset.
    pub poll_interval_ms: Option<u64>,
}

impl Default for ClientSection {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            unit_id: defaults.unit_id,
            word_order: defaults.word_order,
            enable_mask: defaults.enable_mask,
            retries: defaults.retry_count,
            response_timeout_ms: None,
            poll_interval_ms: None,
        }
    }
}

/// One `[[points]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PointEntry {
    pub name: String,
    pub table: Table,
    pub address: u16,
    #[serde(default)]
    pub bit: Option<u8>,
    #[serde(default = "default_kind")]
    pub kind: ScalarKind,
    /// Register count of text points.
    #[serde(default)]
    pub words: u16,
}

fn default_kind() -> ScalarKind {
    ScalarKind::U16
}

impl PointEntry {
    fn spec(&self) -> PointSpec {
        let kind = if self.table.is_bit() || self.bit.is_some() {
            ScalarKind::Bit
        } else {
            self.kind
        };
        let spec = PointSpec::new(self.name.clone(), self.table, self.address, kind)
            .with_text_words(self.words);
        match self.bit {
            Some(bit) => spec.with_bit(bit),
            None => spec,
        }
    }
}

impl ToolConfig {
    pub fn load(path: &Path) -> Result<Self, ToolError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ToolError> {
        Ok(toml::from_str(content)?)
    }

    pub fn socket_config(&self) -> SocketConfig {
        let section = &self.socket;
        let mut config = SocketConfig::new(section.host.clone(), section.port)
            .with_timeouts(section.timeouts())
            .with_protocol_id(section.protocol_id);
        if let Some(port) = section.local_port {
            config = config.with_local_port(port);
        }
        config
    }

    pub fn serial_config(&self) -> Result<SerialConfig, ToolError> {
        let section = &self.serial;
        let mut config = SerialConfig::new(section.port_name.clone(), section.baud_rate)
            .with_parity(parse_parity(&section.parity)?)
            .with_timeouts(self.socket.timeouts());
        config.data_bits = match section.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            _ => return Err(ToolError::Config("data_bits must be 5-8".into())),
        };
        config.stop_bits = match section.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            _ => return Err(ToolError::Config("stop_bits must be 1 or 2".into())),
        };
        Ok(config)
    }

    pub fn client_config(&self) -> ClientConfig {
        let section = &self.client;
        let mut config = ClientConfig::default()
            .with_unit_id(section.unit_id)
            .with_word_order(section.word_order)
            .with_enable_mask(section.enable_mask)
            .with_retry_count(section.retries);
        if section.retries > 0 {
            config = config.with_retry_policy(RetryPolicy::ReadOnly);
        }
        if let Some(ms) = section.response_timeout_ms {
            config = config.with_response_timeout(Duration::from_millis(ms));
        }
        config
    }

    pub fn server_config(&self) -> ServerConfig {
        let section = &self.server;
        let mut image = ImageConfig::uniform(section.size);
        for (table, family) in [
            (Table::Coils, &section.coils),
            (Table::DiscreteInputs, &section.discrete_inputs),
            (Table::HoldingRegisters, &section.holding_registers),
            (Table::InputRegisters, &section.input_registers),
        ] {
            let entry = image.table_mut(table);
            entry.enabled = family.enabled;
            entry.size = family.size.unwrap_or(section.size);
        }
        let mut config = ServerConfig::default()
            .with_bind_address(section.bind)
            .with_port(section.port)
            .with_unit_id(section.unit_id)
            .with_image(image);
        config.client_expiry = Duration::from_millis(section.client_expiry_ms);
        config
    }

    pub fn poll_config(&self) -> PollConfig {
        match self.client.poll_interval_ms {
            Some(ms) => PollConfig::default().with_interval(Duration::from_millis(ms)),
            None => PollConfig::default().with_enabled(false),
        }
    }

    pub fn point_table(&self) -> Result<PointTable, ToolError> {
        let mut table = PointTable::new();
        for entry in &self.points {
            table.register(entry.spec())?;
        }
        Ok(table)
    }
}

pub fn parse_parity(input: &str) -> Result<Parity, ToolError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "none" | "n" => Ok(Parity::None),
        "odd" | "o" => Ok(Parity::Odd),
        "even" | "e" => Ok(Parity::Even),
        other => Err(ToolError::Config(format!("unknown parity: {other}"))),
    }
}
