//! Command-line round-trip test tool.
//!
//! Reads a tag from a ControlLogix PLC (and optionally writes a value
//! first), printing `TAG <value(s)>` on success:
//!
//! ```text
//! eip_tag -i 192.168.1.10 -s 0 counter
//! eip_tag -i 192.168.1.10 -a 4 flow[0]
//! eip_tag -i 192.168.1.10 -w 42 setpoint
//! ```
//!
//! Exits 0 on a successful read/write, non-zero on any failure.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use etherip_driver::{cip, verbosity_filter, Result, TagPath, TcpSession};

#[derive(Parser, Debug)]
#[command(name = "eip_tag", about = "EtherNet/IP single-tag read/write test")]
struct Args {
    /// Verbosity, 0 (errors only) to 10 (frame hexdumps)
    #[arg(short = 'v', long = "verbosity", default_value_t = 3)]
    verbosity: u8,

    /// PLC hostname or IP address
    #[arg(short = 'i', long = "host")]
    host: String,

    /// TCP port of the target
    #[arg(short = 'p', long = "port", default_value_t = 0xAF12)]
    port: u16,

    /// Backplane slot of the processor
    #[arg(short = 's', long = "slot", default_value_t = 0)]
    slot: u8,

    /// Socket timeout in milliseconds
    #[arg(short = 't', long = "timeout", default_value_t = 5000)]
    timeout_ms: u64,

    /// Number of array elements to transfer
    #[arg(short = 'a', long = "elements", default_value_t = 1)]
    elements: u16,

    /// Value to write to element 0 before reading back
    #[arg(short = 'w', long = "write")]
    write: Option<f64>,

    /// Tag to read, e.g. `flow` or `arr[3].val`
    tag: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(verbosity_filter(args.verbosity))
        .with_target(false)
        .init();

    match run(&args).await {
        Ok(payload) => {
            println!(
                "{} {}",
                args.tag,
                cip::format_payload(&payload, args.elements as usize)
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("eip_tag: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<Vec<u8>> {
    let tag = TagPath::parse(&args.tag)?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let mut session = TcpSession::connect(&args.host, args.port, args.slot, timeout).await?;
    let result = round_trip(&mut session, &tag, args).await;
    session.shutdown().await;
    result
}

async fn round_trip(session: &mut TcpSession, tag: &TagPath, args: &Args) -> Result<Vec<u8>> {
    let mut payload = session.read_tag(tag, args.elements).await?.data;
    if let Some(value) = args.write {
        // echo the type the read observed
        cip::put_f64(&mut payload, 0, value)?;
        let ty = cip::payload_type(&payload)?;
        session
            .write_tag(tag, ty, args.elements, &payload[cip::TYPECODE_SIZE..])
            .await?;
        payload = session.read_tag(tag, args.elements).await?.data;
    }
    Ok(payload)
}
