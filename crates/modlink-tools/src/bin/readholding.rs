use clap::Parser;
use modlink_core::ScalarKind;
use modlink_tools::common::{build_client, init_tracing, ConnectionArgs};

#[derive(Debug, Parser)]
#[command(name = "readholding", about = "Read holding or input registers (FC03/FC04)")]
struct Args {
    #[command(flatten)]
    conn: ConnectionArgs,
    #[arg(long)]
    start: u16,
    /// Number of values of `--kind` to read.
    #[arg(long, default_value_t = 1)]
    quantity: usize,
    /// u16, i16, u32, i32, u64, i64, f32, f64 or text.
    #[arg(long, default_value = "u16")]
    kind: ScalarKind,
    /// Register length of a text value.
    #[arg(long, default_value_t = 1)]
    words: usize,
    /// Read input registers instead of holding registers.
    #[arg(long)]
    input: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let client = build_client(&args.conn).await?;

    if args.kind == ScalarKind::Text {
        let text = client.read_text(args.start, args.words, args.input).await?;
        println!("addr={} text={text:?}", args.start);
        return Ok(());
    }

    let width = args.kind.words().ok_or("bit values live in coils; use readcoils")?;
    let mut address = usize::from(args.start);
    for _ in 0..args.quantity {
        let value = client
            .read_value(args.kind, u16::try_from(address)?, args.input)
            .await?;
        match value.to_words(client.config().word_order)?.as_slice() {
            [word] => println!("addr={address} value={value} (0x{word:04X})"),
            _ => println!("addr={address} value={value}"),
        }
        address += width;
    }
    Ok(())
}
