use clap::Parser;
use modlink_tools::common::{build_client, init_tracing, ConnectionArgs};

#[derive(Debug, Parser)]
#[command(name = "readcoils", about = "Read coils or discrete inputs (FC01/FC02)")]
struct Args {
    #[command(flatten)]
    conn: ConnectionArgs,
    #[arg(long)]
    start: u16,
    /// Longer reads are split into several requests.
    #[arg(long)]
    quantity: usize,
    /// Read discrete inputs instead of coils.
    #[arg(long)]
    input: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let client = build_client(&args.conn).await?;

    let values = client
        .read_bools(args.start, args.quantity, args.input)
        .await?;

    let label = if args.input { "input" } else { "coil" };
    for (idx, value) in values.iter().enumerate() {
        println!("{label}={} value={}", usize::from(args.start) + idx, u8::from(*value));
    }
    Ok(())
}
