//! Chain listener: historical catch-up followed by a live log subscription, resuming from a
//! persisted cursor.
//!
//! The listener is an explicit state machine:
//!
//! ```text
//! Connecting ─► CatchingUp ─► LiveSubscribed
//!     ▲              │              │
//!     └── Reconnecting ◄────────────┘
//! ```
//!
//! Every failure (connect, head fetch, batch scan, subscribe, subscription error) goes through
//! `Reconnecting` and starts over with a fresh connection and a fresh catch-up from the last
//! persisted cursor. Failures to get going wait the fixed reconnect delay first; a live
//! subscription that errors or ends reconnects at once. The cursor is saved after each handled log, so an interrupted batch re-scans
//! at most the logs it had already handled.
//!
//! Cancellation is observed while a handler runs, so a handler that never completes cannot keep
//! the listener from stopping.
//!
//! A notification dropped by a long-lived subscription is not noticed until the next reconnect.

use crate::abi::{decode_event, ChainEvent, RawLog};
use crate::cursor::{Cursor, CursorError, CursorStore};
use crate::rpc::{ChainConnection, ChainTransport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Receives every decoded contract event, in chain order. The cursor for a log is persisted
/// only after `handle` returns.
pub trait ChainEventHandler: Send + Sync + 'static {
    fn handle(&self, event: ChainEvent) -> impl Future<Output = ()> + Send;
}

impl<H: ChainEventHandler> ChainEventHandler for Arc<H> {
    fn handle(&self, event: ChainEvent) -> impl Future<Output = ()> + Send {
        (**self).handle(event)
    }
}

enum ListenerState<C> {
    Connecting,
    CatchingUp(C),
    LiveSubscribed { conn: C, from_block: u64 },
    Reconnecting { delay: Duration },
    Stopped,
}

/// Chain listener for one contract.
pub struct ChainEventSource<T: ChainTransport, H, S> {
    transport: T,
    handler: H,
    store: S,
    batch_size: u64,
    reconnect_delay: Duration,
    cursor: Cursor,
}

impl<T, H, S> ChainEventSource<T, H, S>
where
    T: ChainTransport,
    H: ChainEventHandler,
    S: CursorStore,
{
    pub fn new(transport: T, handler: H, store: S, batch_size: u64, reconnect_delay: Duration) -> Self {
        Self {
            transport,
            handler,
            store,
            batch_size: batch_size.max(1),
            reconnect_delay,
            cursor: Cursor::default(),
        }
    }

    /// Run until `cancel` fires. Only an unreadable cursor file ends the loop with an error;
    /// connectivity failures are retried indefinitely.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), CursorError> {
        tracing::info!("chain listener starting");
        let mut state = ListenerState::Connecting;
        loop {
            state = match state {
                ListenerState::Connecting => {
                    tokio::select! {
                        _ = cancel.cancelled() => ListenerState::Stopped,
                        res = self.transport.connect() => match res {
                            Ok(conn) => ListenerState::CatchingUp(conn),
                            Err(e) => {
                                tracing::warn!(reason = %e, "RPC connect failed");
                                self.retry_later()
                            }
                        },
                    }
                }
                ListenerState::CatchingUp(conn) => self.catch_up(conn, &cancel).await?,
                ListenerState::LiveSubscribed { conn, from_block } => {
                    self.follow(conn, from_block, &cancel).await
                }
                ListenerState::Reconnecting { delay } => {
                    tracing::info!(?delay, "reconnecting to RPC");
                    tokio::select! {
                        _ = cancel.cancelled() => ListenerState::Stopped,
                        _ = sleep(delay) => ListenerState::Connecting,
                    }
                }
                ListenerState::Stopped => break,
            };
        }
        tracing::info!(
            cursor = self.cursor.last_processed_block,
            "chain listener stopped"
        );
        Ok(())
    }

    async fn catch_up(
        &mut self,
        mut conn: T::Connection,
        cancel: &CancellationToken,
    ) -> Result<ListenerState<T::Connection>, CursorError> {
        let stored = self.store.load()?;
        self.cursor.advance(stored);

        let head = tokio::select! {
            _ = cancel.cancelled() => return Ok(ListenerState::Stopped),
            res = conn.block_number() => res,
        };
        let head = match head {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(reason = %e, "fetching chain head failed");
                return Ok(self.retry_later());
            }
        };

        if self.cursor.is_uninitialized() {
            tracing::info!(head, "first run, starting from current chain head");
            self.persist(head);
        }

        let last = self.cursor.last_processed_block;
        if head > last {
            tracing::info!(missed = head - last, from = last + 1, to = head, "catching up");
            let mut from = last + 1;
            while from <= head {
                if cancel.is_cancelled() {
                    return Ok(ListenerState::Stopped);
                }
                let to = from.saturating_add(self.batch_size - 1).min(head);
                tracing::debug!(from, to, "scanning batch");
                let logs = tokio::select! {
                    _ = cancel.cancelled() => return Ok(ListenerState::Stopped),
                    res = conn.get_logs(from, to) => res,
                };
                let mut logs = match logs {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::warn!(reason = %e, from, to, "historical log scan failed, abandoning catch-up");
                        return Ok(self.retry_later());
                    }
                };
                if !logs.is_empty() {
                    tracing::info!(count = logs.len(), from, to, "handling historical events");
                }
                logs.sort_by_key(|l| (l.block_number, l.log_index));
                for log in &logs {
                    if !self.process_log(log, cancel).await {
                        return Ok(ListenerState::Stopped);
                    }
                }
                from = to + 1;
            }
            tracing::info!(head, "catch-up complete");
        } else {
            tracing::info!(head, "no missed blocks");
        }

        Ok(ListenerState::LiveSubscribed {
            conn,
            from_block: head + 1,
        })
    }

    async fn follow(
        &mut self,
        mut conn: T::Connection,
        from_block: u64,
        cancel: &CancellationToken,
    ) -> ListenerState<T::Connection> {
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return ListenerState::Stopped,
            res = conn.subscribe_logs() => res,
        };
        let mut sub = match subscribed {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(reason = %e, "live log subscription failed");
                return self.retry_later();
            }
        };
        tracing::info!(from_block, "listening for live events");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown signal received");
                    return ListenerState::Stopped;
                }
                item = sub.next() => match item {
                    Some(Ok(log)) => {
                        if log.block_number < from_block {
                            tracing::debug!(block = log.block_number, "live log already covered by catch-up");
                            continue;
                        }
                        if !self.process_log(&log, cancel).await {
                            return ListenerState::Stopped;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(reason = %e, "subscription failed, reconnecting and catching up");
                        return ListenerState::Reconnecting { delay: Duration::ZERO };
                    }
                    None => {
                        tracing::warn!("subscription ended, reconnecting and catching up");
                        return ListenerState::Reconnecting { delay: Duration::ZERO };
                    }
                },
            }
        }
    }

    /// Handle one log and persist its block. Returns false if `cancel` fired before the handler
    /// finished; the cursor is then left where it was.
    async fn process_log(&mut self, log: &RawLog, cancel: &CancellationToken) -> bool {
        if log.removed {
            tracing::warn!(block = log.block_number, log_index = log.log_index, "ignoring removed log");
            return true;
        }
        tracing::debug!(
            block = log.block_number,
            tx = %hex::encode(log.tx_hash),
            "processing log"
        );
        match decode_event(log) {
            Ok(Some(event)) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(block = log.block_number, "shutdown while handling event");
                        return false;
                    }
                    _ = self.handler.handle(event) => {}
                }
            }
            Ok(None) => tracing::debug!(block = log.block_number, "ignoring log with unknown topic"),
            Err(e) => tracing::warn!(reason = %e, block = log.block_number, "undecodable log dropped"),
        }
        self.persist(log.block_number);
        true
    }

    fn retry_later(&self) -> ListenerState<T::Connection> {
        ListenerState::Reconnecting {
            delay: self.reconnect_delay,
        }
    }

    fn persist(&mut self, block: u64) {
        if !self.cursor.advance(block) {
            return;
        }
        if let Err(e) = self.store.save(block) {
            tracing::warn!(block, reason = %e, "failed to persist cursor; block may be reprocessed after restart");
        }
    }
}
