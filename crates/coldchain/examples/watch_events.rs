//! Example: follow the controller contract and print each decoded event with the peer message it
//! would produce. Nothing is sent or submitted.
//!
//! Usage: cargo run -p coldchain --example watch_events -- --rpc-url URL --contract 0x... [--from-block N]
//!
//! `--from-block 0` (the default) starts at the current head; otherwise N must be at least 2.

use clap::Parser;
use coldchain::{encode_setpoint, ChainEvent, ChainEventHandler, ChainEventSource, MemoryCursorStore, RpcTransport};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
struct Args {
    #[clap(env = "RPC_URL", long)]
    rpc_url: String,
    #[clap(env = "CONTRACT_ADDRESS", long, value_parser = parse_address)]
    contract: [u8; 20],
    /// First block to scan.
    #[clap(long, default_value_t = 0, value_parser = parse_from_block)]
    from_block: u64,
}

fn parse_address(s: &str) -> Result<[u8; 20], String> {
    let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|e| e.to_string())?;
    bytes.try_into().map_err(|_| "contract must be 20 bytes".to_string())
}

// the stored cursor is the last processed block and 0 means "start at head", so block 1 itself
// cannot be requested
fn parse_from_block(s: &str) -> Result<u64, String> {
    match s.parse::<u64>().map_err(|e| e.to_string())? {
        1 => Err("use 0 to start at the chain head, or a block >= 2".to_string()),
        n => Ok(n),
    }
}

struct Print;

impl ChainEventHandler for Print {
    async fn handle(&self, event: ChainEvent) {
        match encode_setpoint(&event) {
            Some(msg) => println!("{} value={:?} peer_message={}", event.name(), event.value(), msg),
            None => println!("{}", event.name()),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let store = MemoryCursorStore::new(args.from_block.saturating_sub(1));
    let listener = ChainEventSource::new(
        RpcTransport::new(&args.rpc_url, args.contract, Duration::from_secs(10)),
        Print,
        store,
        1000,
        Duration::from_secs(5),
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let cancel = CancellationToken::new();
        let on_ctrl_c = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            on_ctrl_c.cancel();
        });
        listener.run(cancel).await
    })?;
    Ok(())
}
