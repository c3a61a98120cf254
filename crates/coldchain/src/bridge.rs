//! Process wiring: the chain listener and the control-peer link run side by side, joined through
//! [MessageRouter] and [TxSubmitter], and stop on one shared cancellation token.

use crate::config::BridgeConfig;
use crate::cursor::FileCursorStore;
use crate::listener::ChainEventSource;
use crate::peer::{ControlPeerLink, PeerOutbox};
use crate::router::MessageRouter;
use crate::rpc::RpcTransport;
use crate::signer::TxSigner;
use crate::submitter::{DryRunBackend, RpcSubmitBackend, TxSubmitter};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// How long in-flight inbound messages and queued submissions or setpoints may take to finish
/// after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Bridge {
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Run both supervisory loops until `cancel` fires. Returns an error only when startup fails
    /// or the cursor file cannot be read.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let config = self.config;
        let signer = TxSigner::from_bytes(&config.private_key).context("load PRIVATE_KEY")?;
        tracing::info!(
            sender = %format!("0x{}", hex::encode(signer.address())),
            contract = %format!("0x{}", hex::encode(config.contract_address)),
            dry_run = config.dry_run,
            "starting bridge"
        );

        let (submitter, worker) = if config.dry_run {
            TxSubmitter::spawn(DryRunBackend)
        } else {
            TxSubmitter::spawn(RpcSubmitBackend::new(&config.rpc_url, config.contract_address, signer))
        };

        let link = Arc::new(ControlPeerLink::new(
            config.peer_url.clone(),
            config.backoff.peer_dial_retry,
            config.backoff.peer_idle_check,
            config.backoff.peer_write_timeout,
        ));
        let (outbox, outbox_worker) = PeerOutbox::spawn(Arc::clone(&link));
        let router = Arc::new(MessageRouter::new(submitter, outbox));

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer_task = tokio::spawn(Arc::clone(&link).run(inbound_tx, cancel.clone()));
        let inbound_task = tokio::spawn(Arc::clone(&router).run_inbound(inbound_rx));

        let listener = ChainEventSource::new(
            RpcTransport::new(&config.rpc_url, config.contract_address, config.backoff.subscribe_timeout),
            Arc::clone(&router),
            FileCursorStore::new(&config.cursor_path),
            config.catchup_batch_size,
            config.backoff.rpc_reconnect,
        );
        let listener_result = tokio::spawn(listener.run(cancel.clone())).await;

        // a fatal listener error takes the peer link down with it
        cancel.cancel();
        if let Err(e) = peer_task.await {
            tracing::warn!(reason = %e, "control peer task panicked");
        }
        if timeout(SHUTDOWN_GRACE, inbound_task).await.is_err() {
            tracing::warn!("inbound routing did not finish in time");
        }
        drop(router);
        if timeout(SHUTDOWN_GRACE, outbox_worker).await.is_err() {
            tracing::warn!("peer outbox not drained before shutdown");
        }
        if timeout(SHUTDOWN_GRACE, worker).await.is_err() {
            tracing::warn!("submission queue not drained before shutdown");
        }

        match listener_result {
            Ok(Ok(())) => {
                tracing::info!("bridge stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(e).context("chain listener"),
            Err(e) => Err(e).context("chain listener task"),
        }
    }
}
