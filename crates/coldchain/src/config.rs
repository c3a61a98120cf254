//! Bridge configuration.
//!
//! Parsed once at startup from command-line flags, each falling back to its environment variable
//! (`RPC_URL`, `CONTROL_PEER_URL`, `CONTRACT_ADDRESS`, `PRIVATE_KEY`, `CURSOR_PATH`,
//! `CATCHUP_BATCH_SIZE`, `SUBMIT_DRY_RUN`). Every field is immutable afterwards.
//!
//! A `.env` file, when present, is loaded into the environment first; variables already set in
//! the environment take precedence over it.

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of blocks per `eth_getLogs` request during catch-up.
pub const DEFAULT_CATCHUP_BATCH_SIZE: u64 = 10_000;

/// Default cursor file, relative to the working directory.
pub const DEFAULT_CURSOR_PATH: &str = "last_block.txt";

/// Bridge configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "coldchain", author, version, about)]
#[clap(rename_all = "kebab-case")]
pub struct BridgeConfig {
    /// Chain RPC endpoint (`http(s)://` or `ws(s)://`).
    #[clap(env = "RPC_URL", long, value_parser = parse_rpc_url)]
    pub rpc_url: String,
    /// Control peer stream endpoint (`ws(s)://`).
    #[clap(env = "CONTROL_PEER_URL", long, value_parser = parse_peer_url)]
    pub peer_url: String,
    /// Controller contract address (20 bytes hex).
    #[clap(env = "CONTRACT_ADDRESS", long = "contract", value_parser = parse_address)]
    pub contract_address: [u8; 20],
    /// secp256k1 signing key for outbound transactions (32 bytes hex).
    #[clap(env = "PRIVATE_KEY", long, hide_env_values = true, value_parser = parse_private_key)]
    pub private_key: [u8; 32],
    /// File holding the last processed block.
    #[clap(env = "CURSOR_PATH", long = "cursor", default_value = DEFAULT_CURSOR_PATH)]
    pub cursor_path: PathBuf,
    /// Max block range per eth_getLogs request.
    #[clap(
        env = "CATCHUP_BATCH_SIZE",
        long,
        default_value_t = DEFAULT_CATCHUP_BATCH_SIZE,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub catchup_batch_size: u64,
    /// Log calldata instead of signing and broadcasting.
    #[clap(env = "SUBMIT_DRY_RUN", long, action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub dry_run: bool,
    #[clap(skip)]
    pub backoff: BackoffConfig,
}

/// Fixed retry delays for the two supervisory loops.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Wait before reconnecting to the RPC endpoint.
    pub rpc_reconnect: Duration,
    /// Wait after a failed dial to the control peer.
    pub peer_dial_retry: Duration,
    /// Re-check interval while the peer connection is up.
    pub peer_idle_check: Duration,
    /// Max time one write (or close) to the control peer may take before the connection is dropped.
    pub peer_write_timeout: Duration,
    /// Max wait for the eth_subscribe response.
    pub subscribe_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rpc_reconnect: Duration::from_secs(15),
            peer_dial_retry: Duration::from_secs(10),
            peer_idle_check: Duration::from_secs(5),
            peer_write_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(10),
        }
    }
}

/// Load `.env` from the working directory or one of its parents. Returns the file loaded, or
/// None when there is none.
pub fn load_env_file() -> Result<Option<PathBuf>, dotenv::Error> {
    match dotenv::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_rpc_url(s: &str) -> Result<String, String> {
    parse_url(s, &["http://", "https://", "ws://", "wss://"])
}

fn parse_peer_url(s: &str) -> Result<String, String> {
    parse_url(s, &["ws://", "wss://"])
}

fn parse_url(s: &str, schemes: &[&str]) -> Result<String, String> {
    let s = s.trim();
    if schemes.iter().any(|scheme| s.starts_with(scheme)) {
        Ok(s.to_string())
    } else {
        Err(format!("expected one of {}, got {:?}", schemes.join(" "), s))
    }
}

fn parse_address(s: &str) -> Result<[u8; 20], String> {
    parse_fixed_hex(s)
}

fn parse_private_key(s: &str) -> Result<[u8; 32], String> {
    parse_fixed_hex(s)
}

fn parse_fixed_hex<const N: usize>(s: &str) -> Result<[u8; N], String> {
    let s = s.trim();
    let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("expected {} bytes, got {}", N, b.len()))
}
