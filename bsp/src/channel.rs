//! The bidirectional JSON-RPC channel over a launched server's stdio.
//!
//! [`bind`] wires a writer task (frames out over stdin) and a listener task
//! (frames in from stdout, dispatched by shape) around the raw streams.
//! Callers talk to both through a clonable [`Endpoint`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crucible_protocol::bsp::methods;
use crucible_protocol::rpc::{self, Incoming, Notification, Request, ResponseError};

use crate::client::BuildClient;
use crate::codec::{MessageReader, MessageWriter};

const OUTBOUND_CAPACITY: usize = 64;
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// The channel (writer task or stream) is gone; no more traffic is possible.
#[derive(Debug, Error)]
#[error("connection channel closed")]
pub(crate) struct ChannelClosed;

#[derive(Debug)]
pub(crate) enum Outbound {
    Send(Value),
    Shutdown,
}

type ReplySender = oneshot::Sender<Result<Value, ResponseError>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Value, ResponseError>>;
type PendingMap = Arc<tokio::sync::Mutex<HashMap<u64, ReplySender>>>;

/// Handle for issuing outbound traffic on a bound channel.
#[derive(Clone)]
pub(crate) struct Endpoint {
    writer_tx: mpsc::Sender<Outbound>,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
}

impl Endpoint {
    /// Registers a reply slot and enqueues a request frame. Queue capacity
    /// is reserved before the slot is registered and the frame handed over
    /// synchronously, so a caller that gives up while the queue is full
    /// leaves no slot behind. After this returns, a caller that gives up
    /// must [`Endpoint::forget`] the id.
    pub(crate) async fn start_request(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<(u64, ReplyReceiver), ChannelClosed> {
        let permit = self.writer_tx.reserve().await.map_err(|_| ChannelClosed)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        // Slot in place before the frame can reach the wire; an instant
        // reply still finds it.
        permit.send(Outbound::Send(Request::new(id, method, params).into_value()));
        Ok((id, rx))
    }

    /// Request nobody will wait on. The id is allocated but never
    /// registered, so a late reply is dropped by dispatch.
    pub(crate) async fn fire_request(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<(), ChannelClosed> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Request::new(id, method, params).into_value();
        self.writer_tx
            .send(Outbound::Send(frame))
            .await
            .map_err(|_| ChannelClosed)
    }

    pub(crate) async fn notify(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<(), ChannelClosed> {
        let frame = Notification::new(method, params).into_value();
        self.writer_tx
            .send(Outbound::Send(frame))
            .await
            .map_err(|_| ChannelClosed)
    }

    /// Drops the reply slot for an abandoned request.
    pub(crate) async fn forget(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    pub(crate) fn writer_handle(&self) -> mpsc::Sender<Outbound> {
        self.writer_tx.clone()
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Owns the two IO tasks behind a bound channel.
pub(crate) struct Listener {
    cancel_tx: Option<oneshot::Sender<()>>,
    reader_handle: Option<tokio::task::JoinHandle<()>>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl Listener {
    /// Stops both tasks. Awaits the reader briefly so the pending map is
    /// already drained when this returns; idempotent. The reader handle is
    /// taken on the first call since a joined handle must not be polled
    /// again.
    pub(crate) async fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut reader) = self.reader_handle.take() {
            match tokio::time::timeout(CANCEL_GRACE, &mut reader).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("listener task ended abnormally: {e}"),
                Err(_) => reader.abort(),
            }
        }
        self.writer_handle.abort();
    }
}

/// Wires the IO tasks around a launched server's streams.
///
/// `stdout` is the server's output (we read replies and notifications from
/// it), `stdin` its input (we write frames to it). Server notifications are
/// handed to `client` on the listener task.
pub(crate) fn bind<R, W>(
    stdout: R,
    stdin: W,
    client: Arc<dyn BuildClient>,
) -> (Endpoint, Listener)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let pending: PendingMap = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
    let (writer_tx, mut writer_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

    let writer_handle = tokio::spawn(async move {
        let mut writer = MessageWriter::new(stdin);
        while let Some(command) = writer_rx.recv().await {
            match command {
                Outbound::Send(frame) => {
                    if let Err(e) = writer.write_message(&frame).await {
                        tracing::warn!("build server write error: {e}");
                        break;
                    }
                }
                Outbound::Shutdown => break,
            }
        }
        // Close the stream so the server sees EOF on its stdin.
        let _ = writer.shutdown().await;
    });

    let reader_pending = pending.clone();
    let reader_writer_tx = writer_tx.clone();
    let reader_handle = tokio::spawn(async move {
        let mut reader = MessageReader::new(stdout);
        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!("listener cancelled");
                    break;
                }
                frame = reader.read_message() => match frame {
                    Ok(Some(frame)) => {
                        dispatch_frame(frame, &reader_pending, &reader_writer_tx, client.as_ref())
                            .await;
                    }
                    Ok(None) => {
                        tracing::info!("build server closed its stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("build server read error: {e}");
                        break;
                    }
                }
            }
        }
        // Whatever the exit reason, nobody will answer the in-flight
        // requests: dropping their reply slots unblocks the callers.
        reader_pending.lock().await.clear();
    });

    (
        Endpoint {
            writer_tx,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        Listener {
            cancel_tx: Some(cancel_tx),
            reader_handle: Some(reader_handle),
            writer_handle,
        },
    )
}

async fn dispatch_frame(
    frame: Value,
    pending: &tokio::sync::Mutex<HashMap<u64, ReplySender>>,
    writer_tx: &mpsc::Sender<Outbound>,
    client: &dyn BuildClient,
) {
    let Some(incoming) = Incoming::classify(&frame) else {
        tracing::trace!("ignoring malformed JSON-RPC frame");
        return;
    };

    match incoming {
        Incoming::Response { id, result } => {
            let sender = pending.lock().await.remove(&id);
            if let Some(tx) = sender {
                let _ = tx.send(result);
            } else {
                // Late replies after a timeout, or fire-and-forget ids.
                tracing::trace!(id, "dropping reply nobody is waiting for");
            }
        }
        Incoming::Request { id, method } => {
            // Answer it, or the server may block waiting on us.
            tracing::debug!("unsupported server request {method}, replying method not found");
            let reply = rpc::method_not_found(&id, &method);
            let _ = writer_tx.send(Outbound::Send(reply)).await;
        }
        Incoming::Notification { method, params } => deliver(client, &method, params),
    }
}

fn deliver(client: &dyn BuildClient, method: &str, params: Option<Value>) {
    match method {
        methods::BUILD_LOG_MESSAGE => {
            if let Some(params) = decode(method, params) {
                client.on_log_message(params);
            }
        }
        methods::BUILD_SHOW_MESSAGE => {
            if let Some(params) = decode(method, params) {
                client.on_show_message(params);
            }
        }
        methods::BUILD_TASK_START => {
            if let Some(params) = decode(method, params) {
                client.on_task_start(params);
            }
        }
        methods::BUILD_TASK_PROGRESS => {
            if let Some(params) = decode(method, params) {
                client.on_task_progress(params);
            }
        }
        methods::BUILD_TASK_FINISH => {
            if let Some(params) = decode(method, params) {
                client.on_task_finish(params);
            }
        }
        methods::BUILD_PUBLISH_DIAGNOSTICS => {
            if let Some(params) = decode(method, params) {
                client.on_publish_diagnostics(params);
            }
        }
        methods::BUILD_TARGET_DID_CHANGE => {
            if let Some(params) = decode(method, params) {
                client.on_did_change_build_target(params);
            }
        }
        _ => {
            tracing::trace!("ignoring unknown notification: {method}");
        }
    }
}

fn decode<T: DeserializeOwned>(method: &str, params: Option<Value>) -> Option<T> {
    let Some(params) = params else {
        tracing::debug!("notification {method} carries no params");
        return None;
    };
    match serde_json::from_value(params) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            tracing::debug!("could not decode {method} params: {e}");
            None
        }
    }
}
