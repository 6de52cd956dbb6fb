use crate::config::ToolConfig;
use clap::Args;
use modlink_client::{ClientError, ModbusClient};
use modlink_core::{DecodeError, Transport, WordOrder};
use modlink_datalink::{DataLink, DataLinkError, SerialSession, TcpSession, UdpSession};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("{0}")]
    Decode(#[from] DecodeError),
    #[error("{0}")]
    DataLink(#[from] DataLinkError),
    #[error("{0}")]
    Client(#[from] ClientError),
}

/// Connection flags shared by the command-line tools.
///
/// Values come from `--config` first; any flag given on the command line
/// overrides the file.
#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// TOML file with `[socket]`, `[serial]` and `[client]` sections.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// tcp, udp, rtu or ascii.
    #[arg(long)]
    pub transport: Option<Transport>,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub local_port: Option<u16>,
    #[arg(long)]
    pub serial_port: Option<String>,
    #[arg(long)]
    pub baud: Option<u32>,
    /// Connect, send and receive timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    #[arg(long)]
    pub unit_id: Option<u8>,
    /// Retries for reads that fail on the transport.
    #[arg(long)]
    pub retries: Option<u8>,
    /// Word order of multi-register values: low-high or high-low.
    #[arg(long)]
    pub order: Option<WordOrder>,
    /// Emulate mask writes with read-modify-write.
    #[arg(long)]
    pub no_mask: bool,
}

impl ConnectionArgs {
    /// The config file, if any, with command-line overrides applied.
    pub fn resolve(&self) -> Result<ToolConfig, ToolError> {
        let mut config = match &self.config {
            Some(path) => ToolConfig::load(path)?,
            None => ToolConfig::default(),
        };
        if let Some(transport) = self.transport {
            config.socket.transport = transport;
        }
        if let Some(host) = &self.host {
            config.socket.host = host.clone();
        }
        if let Some(port) = self.port {
            config.socket.port = port;
        }
        if self.local_port.is_some() {
            config.socket.local_port = self.local_port;
        }
        if let Some(name) = &self.serial_port {
            config.serial.port_name = name.clone();
        }
        if let Some(baud) = self.baud {
            config.serial.baud_rate = baud;
        }
        if let Some(ms) = self.timeout_ms {
            config.socket.connect_timeout_ms = ms;
            config.socket.send_timeout_ms = ms;
            config.socket.receive_timeout_ms = ms;
        }
        if let Some(unit_id) = self.unit_id {
            config.client.unit_id = unit_id;
        }
        if let Some(retries) = self.retries {
            config.client.retries = retries;
        }
        if let Some(order) = self.order {
            config.client.word_order = order;
        }
        if self.no_mask {
            config.client.enable_mask = false;
        }
        Ok(config)
    }
}

/// Open the configured transport and wrap it in a client.
pub async fn build_client(args: &ConnectionArgs) -> Result<ModbusClient<Box<dyn DataLink>>, ToolError> {
    let config = args.resolve()?;
    open_client(&config).await
}

pub async fn open_client(config: &ToolConfig) -> Result<ModbusClient<Box<dyn DataLink>>, ToolError> {
    let transport = config.socket.transport;
    let link: Box<dyn DataLink> = match transport {
        Transport::Tcp => Box::new(TcpSession::connect(config.socket_config()).await?),
        Transport::Udp => Box::new(UdpSession::new(config.socket_config())),
        Transport::Rtu | Transport::Ascii => {
            Box::new(SerialSession::open(config.serial_config()?, transport)?)
        }
    };
    let client_config = config.client_config();
    debug!(%transport, unit_id = client_config.unit_id, "link opened");
    Ok(ModbusClient::with_config(link, client_config))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}

pub fn parse_bool(input: &str) -> Result<bool, String> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(format!("invalid bool value: {input}")),
    }
}
