//! Outbound transaction pipeline.
//!
//! [TxSubmitter] is a cheap, cloneable handle in front of one worker task. `submit` only enqueues,
//! and the worker builds, signs and broadcasts one transaction at a time, so two submissions
//! never race for the same nonce. Delivery is at-most-once: a failure at any step is logged
//! and the transaction is dropped, with no retry and no persisted record.

use crate::abi::{AbiError, OutboundTx};
use crate::rpc::{eth_chain_id, eth_gas_price, eth_pending_nonce, eth_send_raw_transaction, http_client, http_url};
use crate::signer::{LegacyTx, SignerError, TxSigner};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Gas limit for every outbound call.
pub const GAS_LIMIT: u64 = 300_000;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{step} failed: {reason}")]
    Rpc { step: &'static str, reason: String },
    #[error(transparent)]
    Encode(#[from] AbiError),
    #[error(transparent)]
    Sign(#[from] SignerError),
}

fn rpc_step(step: &'static str) -> impl FnOnce(anyhow::Error) -> SubmitError {
    move |e| SubmitError::Rpc {
        step,
        reason: format!("{:#}", e),
    }
}

/// Performs one submission end to end. Returns the transaction hash (hex).
pub trait SubmitBackend: Send + Sync + 'static {
    fn submit(&self, tx: &OutboundTx) -> impl Future<Output = Result<String, SubmitError>> + Send;
}

/// Signs in-process and broadcasts via eth_sendRawTransaction over a fresh HTTP client.
#[derive(Debug, Clone)]
pub struct RpcSubmitBackend {
    http_url: String,
    contract_address: [u8; 20],
    signer: TxSigner,
}

impl RpcSubmitBackend {
    pub fn new(rpc_url: &str, contract_address: [u8; 20], signer: TxSigner) -> Self {
        Self {
            http_url: http_url(rpc_url),
            contract_address,
            signer,
        }
    }

    pub fn sender(&self) -> [u8; 20] {
        self.signer.address()
    }
}

impl SubmitBackend for RpcSubmitBackend {
    async fn submit(&self, tx: &OutboundTx) -> Result<String, SubmitError> {
        let data = tx.calldata()?;
        let client = http_client().map_err(rpc_step("connect"))?;
        let url = self.http_url.as_str();

        let nonce = eth_pending_nonce(&client, url, &self.signer.address())
            .await
            .map_err(rpc_step("nonce fetch"))?;
        let gas_price = eth_gas_price(&client, url)
            .await
            .map_err(rpc_step("gas price fetch"))?;
        let chain_id = eth_chain_id(&client, url)
            .await
            .map_err(rpc_step("chain id fetch"))?;

        let legacy = LegacyTx {
            nonce,
            gas_price,
            gas_limit: GAS_LIMIT,
            to: self.contract_address,
            value: 0,
            data,
        };
        let signed = self.signer.sign(&legacy, chain_id)?;
        tracing::debug!(nonce, gas_price, chain_id, "signed transaction");

        let reported = eth_send_raw_transaction(&client, url, &signed.raw)
            .await
            .map_err(rpc_step("broadcast"))?;
        let hash = format!("0x{}", hex::encode(signed.hash));
        if !reported.eq_ignore_ascii_case(&hash) {
            tracing::warn!(local = %hash, node = %reported, "node reported a different tx hash");
        }
        Ok(hash)
    }
}

/// Logs calldata instead of broadcasting.
#[derive(Debug, Clone, Default)]
pub struct DryRunBackend;

impl SubmitBackend for DryRunBackend {
    async fn submit(&self, tx: &OutboundTx) -> Result<String, SubmitError> {
        let data = tx.calldata()?;
        tracing::info!(
            function = tx.function_name(),
            calldata = %format!("0x{}", hex::encode(&data)),
            "dry run: transaction not broadcast"
        );
        Ok("dry-run".to_string())
    }
}

/// Handle to the submission worker. Clones share the same queue.
#[derive(Debug, Clone)]
pub struct TxSubmitter {
    queue: mpsc::UnboundedSender<OutboundTx>,
}

impl TxSubmitter {
    /// Spawn the worker. It exits once every handle has been dropped and the queue is drained.
    pub fn spawn<B: SubmitBackend>(backend: B) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(backend, rx));
        (Self { queue }, worker)
    }

    /// Fire-and-forget: enqueue and return immediately.
    pub fn submit(&self, tx: OutboundTx) {
        if let Err(e) = self.queue.send(tx) {
            tracing::warn!(function = e.0.function_name(), "submission worker stopped, transaction dropped");
        }
    }
}

async fn run_worker<B: SubmitBackend>(backend: B, mut rx: mpsc::UnboundedReceiver<OutboundTx>) {
    while let Some(tx) = rx.recv().await {
        let function = tx.function_name();
        tracing::info!(function, ?tx, "submitting transaction");
        match backend.submit(&tx).await {
            Ok(hash) => tracing::info!(function, %hash, "transaction broadcast"),
            Err(e) => tracing::warn!(function, reason = %e, "submission dropped"),
        }
    }
    tracing::debug!("submission worker stopped");
}
