//! Chain RPC access: JSON-RPC over HTTP for request/response calls and `eth_subscribe("logs")`
//! over WebSocket for live logs.
//!
//! [ChainTransport] / [ChainConnection] are the seam the listener runs against; [RpcTransport]
//! is the network implementation.

use crate::abi::RawLog;
use anyhow::{Context, Result};
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Opens connections to the chain. Called once per `Connecting` state.
pub trait ChainTransport: Send + Sync + 'static {
    type Connection: ChainConnection;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// One live RPC connection. Dropping it tears the connection down.
pub trait ChainConnection: Send + 'static {
    /// Current chain head.
    fn block_number(&mut self) -> impl Future<Output = Result<u64>> + Send;

    /// Contract logs in `[from, to]` (inclusive).
    fn get_logs(&mut self, from: u64, to: u64) -> impl Future<Output = Result<Vec<RawLog>>> + Send;

    /// Subscribe to contract logs from now on.
    fn subscribe_logs(&mut self) -> impl Future<Output = Result<LogSubscription>> + Send;
}

/// Stream of live logs. An `Err` item (or the end of the stream) signals that the
/// subscription is broken. Dropping the subscription stops the background reader.
pub struct LogSubscription {
    rx: mpsc::UnboundedReceiver<Result<RawLog>>,
    reader: Option<JoinHandle<()>>,
}

impl LogSubscription {
    /// Subscription fed from a channel (no background reader).
    pub fn from_channel(rx: mpsc::UnboundedReceiver<Result<RawLog>>) -> Self {
        Self { rx, reader: None }
    }

    pub async fn next(&mut self) -> Option<Result<RawLog>> {
        self.rx.recv().await
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Request/response URL for an RPC endpoint (`ws(s)` rewritten to `http(s)`).
pub fn http_url(rpc_url: &str) -> String {
    rpc_url
        .replacen("wss://", "https://", 1)
        .replacen("ws://", "http://", 1)
}

/// Subscription URL for an RPC endpoint (`http(s)` rewritten to `ws(s)`).
pub fn ws_url(rpc_url: &str) -> String {
    rpc_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1)
}

/// Reqwest client that does not use the system proxy.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .context("build HTTP client")
}

pub(crate) fn build_logs_filter(address: &[u8; 20], from_block: Option<u64>, to_block: Option<u64>) -> Value {
    let mut filter = json!({
        "address": format!("0x{}", hex::encode(address)),
    });
    if let Some(from) = from_block {
        filter["fromBlock"] = Value::String(format!("0x{:x}", from));
    }
    if let Some(to) = to_block {
        filter["toBlock"] = Value::String(format!("0x{:x}", to));
    }
    filter
}

pub async fn http_json_rpc(client: &reqwest::Client, url: &str, method: &str, params: Value, id: u64) -> Result<Value> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params
    });
    let resp = client
        .post(url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("{} request failed", method))?;
    let json: Value = resp.json().await.context("parse response")?;
    if let Some(err) = json.get("error") {
        anyhow::bail!("RPC error from {}: {}", method, err);
    }
    json.get("result")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Missing result for {}", method))
}

pub(crate) fn parse_quantity(v: &Value) -> Result<u64> {
    let s = v.as_str().ok_or_else(|| anyhow::anyhow!("quantity not string: {}", v))?;
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).with_context(|| format!("parse quantity {}", s))
}

pub async fn eth_block_number(client: &reqwest::Client, url: &str) -> Result<u64> {
    let result = http_json_rpc(client, url, "eth_blockNumber", json!([]), 1).await?;
    parse_quantity(&result).context("parse block number")
}

pub async fn eth_chain_id(client: &reqwest::Client, url: &str) -> Result<u64> {
    let result = http_json_rpc(client, url, "eth_chainId", json!([]), 2).await?;
    parse_quantity(&result).context("parse chain id")
}

pub async fn eth_gas_price(client: &reqwest::Client, url: &str) -> Result<u64> {
    let result = http_json_rpc(client, url, "eth_gasPrice", json!([]), 3).await?;
    parse_quantity(&result).context("parse gas price")
}

/// Nonce for `address` including pending transactions.
pub async fn eth_pending_nonce(client: &reqwest::Client, url: &str, address: &[u8; 20]) -> Result<u64> {
    let params = json!([format!("0x{}", hex::encode(address)), "pending"]);
    let result = http_json_rpc(client, url, "eth_getTransactionCount", params, 4).await?;
    parse_quantity(&result).context("parse nonce")
}

pub async fn eth_get_logs(client: &reqwest::Client, url: &str, filter: Value) -> Result<Vec<RawLog>> {
    let result = http_json_rpc(client, url, "eth_getLogs", json!([filter]), 5).await?;
    let arr = result.as_array().ok_or_else(|| anyhow::anyhow!("getLogs not array"))?;
    arr.iter()
        .map(|log| RawLog::from_json(log).context("decode log"))
        .collect()
}

/// Broadcast a signed raw transaction; returns the hash reported by the node.
pub async fn eth_send_raw_transaction(client: &reqwest::Client, url: &str, raw_tx: &[u8]) -> Result<String> {
    let params = json!([format!("0x{}", hex::encode(raw_tx))]);
    let result = http_json_rpc(client, url, "eth_sendRawTransaction", params, 6).await?;
    result
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("tx hash not string"))
}

/// Network transport for one contract.
#[derive(Debug, Clone)]
pub struct RpcTransport {
    http_url: String,
    ws_url: String,
    contract_address: [u8; 20],
    subscribe_timeout: Duration,
}

impl RpcTransport {
    pub fn new(rpc_url: &str, contract_address: [u8; 20], subscribe_timeout: Duration) -> Self {
        Self {
            http_url: http_url(rpc_url),
            ws_url: ws_url(rpc_url),
            contract_address,
            subscribe_timeout,
        }
    }
}

impl ChainTransport for RpcTransport {
    type Connection = RpcConnection;

    async fn connect(&self) -> Result<RpcConnection> {
        let client = http_client()?;
        let chain_id = eth_chain_id(&client, &self.http_url).await?;
        tracing::debug!(chain_id, url = %self.http_url, "RPC connected");
        Ok(RpcConnection {
            client,
            transport: self.clone(),
        })
    }
}

pub struct RpcConnection {
    client: reqwest::Client,
    transport: RpcTransport,
}

impl ChainConnection for RpcConnection {
    async fn block_number(&mut self) -> Result<u64> {
        eth_block_number(&self.client, &self.transport.http_url).await
    }

    async fn get_logs(&mut self, from: u64, to: u64) -> Result<Vec<RawLog>> {
        let filter = build_logs_filter(&self.transport.contract_address, Some(from), Some(to));
        eth_get_logs(&self.client, &self.transport.http_url, filter).await
    }

    async fn subscribe_logs(&mut self) -> Result<LogSubscription> {
        subscribe_logs(
            &self.transport.ws_url,
            self.transport.contract_address,
            self.transport.subscribe_timeout,
        )
        .await
    }
}

async fn next_text<S>(ws_receiver: &mut S, wait: Duration) -> Result<String>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(wait, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Ok(text),
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => anyhow::bail!("ws closed"),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(anyhow::anyhow!("ws: {}", e)),
            Err(_) => anyhow::bail!("subscribe timeout"),
        }
    }
}

async fn subscribe_logs(url: &str, contract_address: [u8; 20], wait: Duration) -> Result<LogSubscription> {
    let (ws_stream, _) = connect_async(url).await.context("WS connect")?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let filter = build_logs_filter(&contract_address, None, None);
    let sub_req = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": ["logs", filter]
    });
    ws_sender
        .send(Message::Text(serde_json::to_string(&sub_req)?))
        .await
        .map_err(|e| anyhow::anyhow!("send subscribe: {}", e))?;

    let v: Value = serde_json::from_str(&next_text(&mut ws_receiver, wait).await?)
        .context("parse sub response")?;
    let needs_client_filter = match v.get("error") {
        None => false,
        Some(err) => {
            let msg = err.get("message").and_then(|m| m.as_str()).unwrap_or("");
            if !(msg.contains("data did not match") || msg.contains("variant")) {
                anyhow::bail!("subscribe error: {}", err);
            }
            tracing::warn!("RPC does not support logs filter (Anvil?), using client-side filter");
            let sub_req_no_filter = json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "eth_subscribe",
                "params": ["logs"]
            });
            ws_sender
                .send(Message::Text(serde_json::to_string(&sub_req_no_filter)?))
                .await
                .map_err(|e| anyhow::anyhow!("send subscribe: {}", e))?;
            let v2: Value = serde_json::from_str(&next_text(&mut ws_receiver, wait).await?)
                .context("parse sub response")?;
            if let Some(err) = v2.get("error") {
                anyhow::bail!("subscribe error: {}", err);
            }
            true
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        // Keep the sink alive for the lifetime of the subscription.
        let _ws_sender = ws_sender;
        let failure = loop {
            let text = match ws_receiver.next().await {
                Some(Ok(Message::Text(t))) => t,
                Some(Ok(Message::Close(_))) | None => break anyhow::anyhow!("ws closed"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => break anyhow::anyhow!("ws: {}", e),
            };
            let v: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => break anyhow::anyhow!("parse ws message: {}", e),
            };
            if v.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
                continue;
            }
            let result = match v.get("params").and_then(|p| p.get("result")) {
                Some(r) => r,
                None => break anyhow::anyhow!("no params.result"),
            };
            let log = match RawLog::from_json(result) {
                Ok(log) => log,
                Err(e) => {
                    tracing::warn!(reason = %e, "undecodable subscription log skipped");
                    continue;
                }
            };
            if needs_client_filter && log.address != contract_address {
                continue;
            }
            if tx.send(Ok(log)).is_err() {
                return;
            }
        };
        let _ = tx.send(Err(failure));
    });

    Ok(LogSubscription {
        rx,
        reader: Some(reader),
    })
}
