use clap::Parser;
use modlink_core::{ScalarKind, Value};
use modlink_tools::common::{build_client, init_tracing, parse_bool, ConnectionArgs};

#[derive(Debug, Parser)]
#[command(
    name = "writeholding",
    about = "Write holding registers, typed values or single register bits"
)]
struct Args {
    #[command(flatten)]
    conn: ConnectionArgs,
    #[arg(long)]
    start: u16,
    /// u16, i16, u32, i32, u64, i64, f32, f64 or text.
    #[arg(long, default_value = "u16")]
    kind: ScalarKind,
    /// Write `--values` as booleans into bits of the register, starting here.
    #[arg(long, conflicts_with = "kind")]
    bit: Option<u8>,
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    values: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let client = build_client(&args.conn).await?;

    if let Some(bit) = args.bit {
        let bits = args
            .values
            .iter()
            .map(|raw| parse_bool(raw))
            .collect::<Result<Vec<_>, _>>()?;
        client.write_register_bits(args.start, bit, &bits).await?;
        println!("wrote {} bit(s) from {}.{}", bits.len(), args.start, bit);
        return Ok(());
    }

    if args.kind == ScalarKind::U16 {
        let words = args
            .values
            .iter()
            .map(|raw| raw.trim().parse::<u16>())
            .collect::<Result<Vec<_>, _>>()?;
        match words.as_slice() {
            [word] => client.write_single_register(args.start, *word).await?,
            words => client.write_words(args.start, words).await?,
        }
        println!("wrote {} register(s) starting at {}", words.len(), args.start);
        return Ok(());
    }

    let mut address = usize::from(args.start);
    for raw in &args.values {
        let value = Value::parse(args.kind, raw)?;
        let width = value.to_words(client.config().word_order)?.len().max(1);
        client.write_value(u16::try_from(address)?, &value).await?;
        println!("addr={address} value={value}");
        address += width;
    }
    Ok(())
}
