use clap::Parser;
use modlink_tools::common::{build_client, init_tracing, parse_bool, ConnectionArgs};

#[derive(Debug, Parser)]
#[command(name = "writecoil", about = "Write one or more coils (FC05/FC15)")]
struct Args {
    #[command(flatten)]
    conn: ConnectionArgs,
    #[arg(long)]
    address: u16,
    #[arg(long, value_parser = parse_bool, value_delimiter = ',', num_args = 1..)]
    values: Vec<bool>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let client = build_client(&args.conn).await?;

    match args.values.as_slice() {
        [value] => client.write_single_coil(args.address, *value).await?,
        values => client.write_bools(args.address, values).await?,
    }

    println!("wrote {} coil(s) starting at {}", args.values.len(), args.address);
    Ok(())
}
