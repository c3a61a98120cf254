//! Common helpers for integration tests.
//! Some helpers are only used by specific test binaries; allow dead_code to avoid per-binary warnings.
#![allow(dead_code)]

use anyhow::{Context, Result};
use coldchain::{ChainConnection, ChainEvent, ChainEventHandler, ChainTransport, LogSubscription, RawLog};
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub const CONTRACT: [u8; 20] = [0xc0; 20];

/// Anvil default account 0.
pub const ANVIL_KEY: [u8; 32] = [
    0xac, 0x09, 0x74, 0xbe, 0xc3, 0x9a, 0x17, 0xe3, 0x6b, 0xa4, 0xa6, 0xb4, 0xd2, 0x38, 0xff, 0x94,
    0x4b, 0xac, 0xb4, 0x78, 0xcb, 0xed, 0x5e, 0xfc, 0xae, 0x78, 0x4d, 0x7b, 0xf4, 0xf2, 0xff, 0x80,
];
pub const ANVIL_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

pub fn topic(signature: &str) -> [u8; 32] {
    Keccak256::digest(signature.as_bytes()).into()
}

/// 32-byte big-endian two's complement word.
pub fn int_word(v: i128) -> Vec<u8> {
    let fill = if v < 0 { 0xff } else { 0x00 };
    let mut word = vec![fill; 16];
    word.extend_from_slice(&v.to_be_bytes());
    word
}

pub fn log_at(block_number: u64, log_index: u64, topics: Vec<[u8; 32]>, data: Vec<u8>) -> RawLog {
    let mut tx_hash = [0u8; 32];
    tx_hash[..8].copy_from_slice(&block_number.to_be_bytes());
    tx_hash[8..16].copy_from_slice(&log_index.to_be_bytes());
    RawLog {
        address: CONTRACT,
        topics,
        data,
        block_number,
        tx_hash,
        log_index,
        removed: false,
    }
}

pub fn temperature_log(block_number: u64, log_index: u64, raw_centi: i128) -> RawLog {
    log_at(
        block_number,
        log_index,
        vec![topic("TargetTemperatureSet(int256)")],
        int_word(raw_centi),
    )
}

pub fn humidity_log(block_number: u64, log_index: u64, raw_centi: u128) -> RawLog {
    log_at(
        block_number,
        log_index,
        vec![topic("TargetHumiditySet(uint256)")],
        int_word(raw_centi as i128),
    )
}

/// Shared state behind [MockChain]. Tests mutate it directly between steps.
#[derive(Default)]
pub struct MockState {
    pub head: u64,
    pub logs: Vec<RawLog>,
    /// Number of upcoming connect attempts that fail.
    pub failing_connects: usize,
    /// Ranges whose next eth_getLogs call fails (each entry fails once).
    pub failing_ranges: Vec<(u64, u64)>,
    pub connects: usize,
    pub get_logs_calls: Vec<(u64, u64)>,
    pub subscriptions: usize,
    /// Sender for the most recent live subscription.
    pub live: Option<mpsc::UnboundedSender<Result<RawLog>>>,
}

/// In-memory chain: serves `logs` by block range and hands out channel-backed subscriptions.
#[derive(Clone, Default)]
pub struct MockChain {
    pub state: Arc<Mutex<MockState>>,
}

impl MockChain {
    pub fn with_head(head: u64) -> Self {
        let chain = Self::default();
        chain.state.lock().unwrap().head = head;
        chain
    }

    pub fn push_live(&self, log: RawLog) -> bool {
        let state = self.state.lock().unwrap();
        match &state.live {
            Some(tx) => tx.send(Ok(log)).is_ok(),
            None => false,
        }
    }

    pub fn break_subscription(&self) {
        if let Some(tx) = self.state.lock().unwrap().live.take() {
            let _ = tx.send(Err(anyhow::anyhow!("ws closed")));
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscriptions
    }

    pub fn get_logs_calls(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().get_logs_calls.clone()
    }
}

pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl ChainTransport for MockChain {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            anyhow::bail!("connection refused");
        }
        Ok(MockConnection {
            state: Arc::clone(&self.state),
        })
    }
}

impl ChainConnection for MockConnection {
    async fn block_number(&mut self) -> Result<u64> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn get_logs(&mut self, from: u64, to: u64) -> Result<Vec<RawLog>> {
        let mut state = self.state.lock().unwrap();
        state.get_logs_calls.push((from, to));
        if let Some(pos) = state.failing_ranges.iter().position(|r| *r == (from, to)) {
            state.failing_ranges.remove(pos);
            anyhow::bail!("query returned more than 10000 results");
        }
        Ok(state
            .logs
            .iter()
            .filter(|l| l.block_number >= from && l.block_number <= to)
            .cloned()
            .collect())
    }

    async fn subscribe_logs(&mut self) -> Result<LogSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.subscriptions += 1;
        state.live = Some(tx);
        Ok(LogSubscription::from_channel(rx))
    }
}

/// Forwards every handled event to a channel.
pub struct ChannelHandler(mpsc::UnboundedSender<ChainEvent>);

impl ChainEventHandler for ChannelHandler {
    async fn handle(&self, event: ChainEvent) {
        let _ = self.0.send(event);
    }
}

pub fn channel_handler() -> (ChannelHandler, mpsc::UnboundedReceiver<ChainEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelHandler(tx), rx)
}

/// Poll a synchronous `check` until it returns true or `limit` elapses.
pub async fn wait_for(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Poll an async `check` until it returns true or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Reqwest client that does not use system proxy (avoids SCDynamicStore panic in sandbox/CI).
fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("reqwest client")
}

async fn http_json_rpc(client: &reqwest::Client, url: &str, method: &str, params: Value, id: u64) -> Result<Value> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params
    });
    let resp = client.post(url).json(&body).send().await.context("HTTP request")?;
    let resp = resp.error_for_status().context("HTTP status")?;
    let v: Value = resp.json().await.context("parse response")?;
    if let Some(err) = v.get("error") {
        anyhow::bail!("RPC error: {}", err);
    }
    v.get("result").cloned().ok_or_else(|| anyhow::anyhow!("Missing result"))
}

/// Get transaction count (nonce) for address via eth_getTransactionCount.
pub async fn eth_get_transaction_count(http_url: &str, address: &str) -> Result<u64> {
    let client = http_client();
    let address = address.strip_prefix("0x").unwrap_or(address);
    let result = http_json_rpc(
        &client,
        http_url,
        "eth_getTransactionCount",
        json!([format!("0x{}", address), "latest"]),
        14,
    )
    .await?;
    let s = result.as_str().ok_or_else(|| anyhow::anyhow!("getTransactionCount result not string"))?;
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).context("parse nonce")
}

/// Send a transaction from an unlocked Anvil account and return its receipt.
pub async fn send_unlocked(http_url: &str, to: Option<&str>, data: &[u8]) -> Result<Value> {
    let client = http_client();
    let mut tx = json!({
        "from": ANVIL_ADDRESS,
        "data": format!("0x{}", hex::encode(data)),
        "gas": "0x100000",
    });
    if let Some(to) = to {
        tx["to"] = json!(to);
    }
    let hash = http_json_rpc(&client, http_url, "eth_sendTransaction", json!([tx]), 20).await?;
    for _ in 0..50 {
        let receipt = http_json_rpc(&client, http_url, "eth_getTransactionReceipt", json!([hash]), 21).await?;
        if !receipt.is_null() {
            return Ok(receipt);
        }
        sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("no receipt for {}", hash)
}

/// Init code for a contract that emits `TargetTemperatureSet(raw)` on every call.
pub fn emitter_init_code(raw: u16) -> Vec<u8> {
    let mut runtime = vec![0x61];
    runtime.extend_from_slice(&raw.to_be_bytes()); // PUSH2 raw
    runtime.extend_from_slice(&[0x60, 0x00, 0x52]); // MSTORE at 0
    runtime.push(0x7f); // PUSH32 topic
    runtime.extend_from_slice(&topic("TargetTemperatureSet(int256)"));
    runtime.extend_from_slice(&[0x60, 0x20, 0x60, 0x00, 0xa1, 0x00]); // LOG1(0, 32), STOP
    let len = runtime.len() as u8;
    let mut init = vec![
        0x60, len, 0x60, 0x0c, 0x60, 0x00, 0x39, // CODECOPY(0, 12, len)
        0x60, len, 0x60, 0x00, 0xf3, // RETURN(0, len)
    ];
    init.extend_from_slice(&runtime);
    init
}

/// True if `anvil` is in PATH.
pub fn anvil_available() -> bool {
    Command::new("anvil")
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Spawn Anvil on a dynamic port and wait until ready.
pub async fn spawn_anvil() -> Result<(Child, String)> {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .context("bind for port")?;
        listener.local_addr()?.port()
    };
    let rpc_url = format!("http://127.0.0.1:{}", port);
    let mut cmd = Command::new("anvil");
    cmd.arg("--port").arg(port.to_string()).arg("--host").arg("127.0.0.1");
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    let process = cmd.spawn().context("spawn anvil")?;
    wait_for_rpc(&rpc_url).await?;
    Ok((process, rpc_url))
}

async fn wait_for_rpc(url: &str) -> Result<()> {
    let client = http_client();
    for _ in 0..50 {
        let ok = client
            .post(url)
            .json(&json!({"jsonrpc":"2.0","method":"eth_blockNumber","params":[],"id":1}))
            .send()
            .await
            .is_ok();
        if ok {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("RPC not ready");
}
