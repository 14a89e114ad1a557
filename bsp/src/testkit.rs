//! In-memory scripted build server for exercising the channel and proxy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::channel::{self, Endpoint, Listener};
use crate::client::BuildClient;
use crate::codec::{MessageReader, MessageWriter};

/// Scripted reply for one method.
#[derive(Clone)]
pub(crate) struct Reply {
    outcome: Result<Value, (i64, &'static str)>,
    delay: Option<Duration>,
}

impl Reply {
    pub(crate) fn result(value: Value) -> Self {
        Self {
            outcome: Ok(value),
            delay: None,
        }
    }

    pub(crate) fn error(code: i64, message: &'static str) -> Self {
        Self {
            outcome: Err((code, message)),
            delay: None,
        }
    }

    pub(crate) fn delayed(value: Value, delay: Duration) -> Self {
        Self {
            outcome: Ok(value),
            delay: Some(delay),
        }
    }
}

/// A channel bound to an in-process peer that answers from a script.
///
/// Requests for unscripted methods are recorded but never answered, which
/// is exactly what a wedged server looks like from the outside.
pub(crate) struct FakeServer {
    pub(crate) endpoint: Endpoint,
    listener: Listener,
    seen: Arc<Mutex<Vec<(String, Option<Value>)>>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub(crate) fn spawn(
        script: impl IntoIterator<Item = (&'static str, Reply)>,
        client: Arc<dyn BuildClient>,
    ) -> Self {
        let script: HashMap<&'static str, Reply> = script.into_iter().collect();
        let (local, remote) = tokio::io::duplex(256 * 1024);
        let (local_read, local_write) = tokio::io::split(local);
        let (endpoint, listener) = channel::bind(local_read, local_write, client);

        let seen: Arc<Mutex<Vec<(String, Option<Value>)>>> = Arc::default();
        let task_seen = seen.clone();
        let task = tokio::spawn(async move {
            let (remote_read, remote_write) = tokio::io::split(remote);
            let mut reader = MessageReader::new(remote_read);
            let writer = Arc::new(tokio::sync::Mutex::new(MessageWriter::new(remote_write)));

            while let Ok(Some(frame)) = reader.read_message().await {
                let method = frame["method"].as_str().unwrap_or_default().to_owned();
                task_seen
                    .lock()
                    .unwrap()
                    .push((method.clone(), frame.get("params").cloned()));

                let Some(id) = frame.get("id").cloned() else {
                    continue;
                };
                let Some(reply) = script.get(method.as_str()).cloned() else {
                    continue;
                };
                let writer = writer.clone();
                tokio::spawn(async move {
                    if let Some(delay) = reply.delay {
                        tokio::time::sleep(delay).await;
                    }
                    let frame = match reply.outcome {
                        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                        Err((code, message)) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": code, "message": message},
                        }),
                    };
                    let _ = writer.lock().await.write_message(&frame).await;
                });
            }
        });

        Self {
            endpoint,
            listener,
            seen,
            task,
        }
    }

    /// Methods of every frame received so far, in arrival order.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    /// Params of the first received frame for `method`.
    pub(crate) fn params_for(&self, method: &str) -> Option<Value> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .find(|(seen, _)| seen == method)
            .and_then(|(_, params)| params.clone())
    }

    pub(crate) async fn stop(&mut self) {
        self.listener.cancel().await;
        self.task.abort();
    }
}

/// Polls `condition` for up to two seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..40 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
