use clap::Parser;
use modlink_client::Poller;
use modlink_tools::common::{init_tracing, open_client, ConnectionArgs};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "modpoll", about = "Poll the `[[points]]` of a config file and print changes")]
struct Args {
    #[command(flatten)]
    conn: ConnectionArgs,
    /// Poll interval in milliseconds; overrides `client.poll_interval_ms`.
    #[arg(long)]
    interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let mut config = args.conn.resolve()?;
    if args.interval_ms.is_some() {
        config.client.poll_interval_ms = args.interval_ms;
    }
    if config.client.poll_interval_ms.is_none() {
        config.client.poll_interval_ms = Some(1000);
    }

    let points = Arc::new(config.point_table()?);
    if points.is_empty() {
        return Err("no [[points]] configured".into());
    }
    let client = Arc::new(open_client(&config).await?);
    let poll = config.poll_config();
    info!(points = points.len(), spans = points.spans().len(), interval = ?poll.interval, "polling");

    let (poller, mut changes) = Poller::spawn(client, points, poll);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Some(change) => match change.from {
                    Some(from) => println!("{} {from} -> {}", change.name, change.to),
                    None => println!("{} = {}", change.name, change.to),
                },
                None => break,
            },
        }
    }

    poller.shutdown().await;
    Ok(())
}
