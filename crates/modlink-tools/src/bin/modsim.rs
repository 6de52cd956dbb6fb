use clap::Parser;
use modlink_datalink::ModbusTcpServer;
use modlink_tools::common::init_tracing;
use modlink_tools::config::ToolConfig;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "modsim", about = "Modbus TCP slave backed by an in-memory register image")]
struct Args {
    /// TOML file with a `[server]` section.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    bind: Option<IpAddr>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    unit_id: Option<u8>,
    /// Registers and bits per table.
    #[arg(long)]
    size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ToolConfig::load(path)?,
        None => ToolConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(unit_id) = args.unit_id {
        config.server.unit_id = unit_id;
    }
    if let Some(size) = args.size {
        config.server.size = size;
    }

    let server = ModbusTcpServer::with_image(config.server_config()).await?;
    let mut changes = server.service().subscribe();
    let handle = server.spawn()?;
    let mut clients = handle.watch_clients();
    info!(addr = %handle.local_addr(), unit_id = config.server.unit_id, "simulator listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(change) => info!(
                    table = ?change.table,
                    address = change.address,
                    count = change.count,
                    "image written"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "image change log lagged"),
                Err(RecvError::Closed) => break,
            },
            changed = clients.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = *clients.borrow_and_update();
                info!(connected, "connected clients");
            }
        }
    }

    info!("shutting down");
    handle.shutdown().await?;
    Ok(())
}
