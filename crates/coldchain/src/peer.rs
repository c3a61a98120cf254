//! Reconnecting WebSocket link to the control peer.
//!
//! At most one connection exists at a time. Its write half lives behind a single lock shared by
//! [ControlPeerLink::send] and the receive loop; the read half is owned by the receive loop task,
//! which forwards text frames to the inbound channel until a read fails. A failed, or stalled,
//! write clears the handle and stops that connection's receive loop, and the supervisory loop in
//! [ControlPeerLink::run] dials again.
//!
//! Writes to a peer that stops reading are bounded by the write timeout. Chain-side callers go
//! through [PeerOutbox], which never waits on the socket at all.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct PeerConnection {
    id: u64,
    sink: SplitSink<WsStream, Message>,
    closed: CancellationToken,
}

/// Link to the control peer.
pub struct ControlPeerLink {
    url: String,
    dial_retry: Duration,
    idle_check: Duration,
    write_timeout: Duration,
    handle: Mutex<Option<PeerConnection>>,
    next_id: AtomicU64,
}

impl ControlPeerLink {
    pub fn new(url: impl Into<String>, dial_retry: Duration, idle_check: Duration, write_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            dial_retry,
            idle_check,
            write_timeout,
            handle: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Send one text message. Returns false when the message was dropped: either there is no
    /// connection, or the write failed or made no progress within the write timeout (the
    /// connection is then torn down, not retried).
    pub async fn send(&self, text: String) -> bool {
        let mut guard = self.handle.lock().await;
        let Some(conn) = guard.as_mut() else {
            tracing::warn!("control peer not connected, message dropped");
            return false;
        };
        let reason = match timeout(self.write_timeout, conn.sink.send(Message::Text(text))).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("write stalled for {:?}", self.write_timeout),
        };
        tracing::warn!(connection = conn.id, %reason, "write to control peer failed, dropping connection");
        if let Some(dead) = guard.take() {
            self.close(dead).await;
        }
        false
    }

    /// Close the current connection, if any.
    pub async fn disconnect(&self) {
        let conn = self.handle.lock().await.take();
        if let Some(conn) = conn {
            self.close(conn).await;
            tracing::info!("control peer connection closed");
        }
    }

    /// Supervisory loop: dial whenever disconnected, until `cancel` fires. Inbound text frames
    /// from every connection are forwarded to `inbound`.
    pub async fn run(self: Arc<Self>, inbound: mpsc::UnboundedSender<String>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.is_connected().await {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(self.idle_check) => continue,
                }
            }

            tracing::info!(url = %self.url, "connecting to control peer");
            let dialed = tokio::select! {
                _ = cancel.cancelled() => break,
                res = connect_async(self.url.as_str()) => res,
            };
            match dialed {
                Ok((ws, _)) => {
                    let (sink, stream) = ws.split();
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let closed = cancel.child_token();
                    *self.handle.lock().await = Some(PeerConnection {
                        id,
                        sink,
                        closed: closed.clone(),
                    });
                    tracing::info!(connection = id, "connected to control peer");
                    tokio::spawn(receive_loop(Arc::clone(&self), id, stream, inbound.clone(), closed));
                }
                Err(e) => {
                    tracing::warn!(reason = %e, retry_in = ?self.dial_retry, "control peer dial failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.dial_retry) => {}
                    }
                }
            }
        }
        self.disconnect().await;
        tracing::info!("control peer link stopped");
    }

    /// Drop the handle if it still belongs to connection `id`.
    async fn clear_if_current(&self, id: u64) {
        let mut guard = self.handle.lock().await;
        if guard.as_ref().map(|c| c.id) == Some(id) {
            if let Some(conn) = guard.take() {
                self.close(conn).await;
            }
        }
    }

    async fn close(&self, mut conn: PeerConnection) {
        conn.closed.cancel();
        if timeout(self.write_timeout, conn.sink.close()).await.is_err() {
            tracing::debug!(connection = conn.id, "close frame not flushed, dropping socket");
        }
    }
}

async fn receive_loop(
    link: Arc<ControlPeerLink>,
    id: u64,
    mut stream: SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => {
                tracing::debug!(connection = id, "receive loop stopped");
                return;
            }
            next = stream.next() => next,
        };
        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!(connection = id, "non UTF-8 binary frame dropped");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(connection = id, ?frame, "control peer closed the connection");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!(connection = id, reason = %e, "read from control peer failed");
                break;
            }
            None => {
                tracing::warn!(connection = id, "control peer stream ended");
                break;
            }
        };
        tracing::debug!(connection = id, raw = %text, "received from control peer");
        if inbound.send(text).is_err() {
            tracing::warn!(connection = id, "inbound consumer gone, message dropped");
        }
    }
    link.clear_if_current(id).await;
}

/// Ordered, non-blocking queue in front of a [ControlPeerLink].
///
/// `send` only enqueues; one worker task writes the messages in order. The worker exits once
/// every handle is dropped and the queue is drained.
#[derive(Debug, Clone)]
pub struct PeerOutbox {
    queue: mpsc::UnboundedSender<String>,
}

impl PeerOutbox {
    pub fn spawn(link: Arc<ControlPeerLink>) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(deliver(link, rx));
        (Self { queue }, worker)
    }

    /// Queue one message. False only when the worker is gone.
    pub fn send(&self, text: String) -> bool {
        if self.queue.send(text).is_err() {
            tracing::error!("peer outbox worker stopped, message dropped");
            return false;
        }
        true
    }
}

async fn deliver(link: Arc<ControlPeerLink>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        if !link.send(text).await {
            tracing::debug!("setpoint not delivered");
        }
    }
    tracing::debug!("peer outbox closed");
}
