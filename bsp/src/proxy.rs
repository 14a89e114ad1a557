//! The remote-call surface of a live connection.

use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crucible_protocol::bsp::{
    CompileParams, CompileResult, DependencySourcesParams, DependencySourcesResult,
    InitializeBuildParams, InitializeBuildResult, ResourcesParams, ResourcesResult, RunParams,
    RunResult, SourcesParams, SourcesResult, TestParams, TestResult,
    WorkspaceBuildTargetsResult, methods,
};
use crucible_protocol::rpc::ResponseError;

use crate::channel::{ChannelClosed, Endpoint};
use crate::settings::RequestTimeout;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("build server rejected {method}: {source}")]
    Remote {
        method: &'static str,
        #[source]
        source: ResponseError,
    },
    #[error("could not encode {method} params: {source}")]
    Encode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not decode {method} response: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("connection channel closed")]
    ChannelClosed,
}

impl From<ChannelClosed> for RequestError {
    fn from(_: ChannelClosed) -> Self {
        RequestError::ChannelClosed
    }
}

/// Typed, timeout-guarded view of the server end of a connection.
///
/// Every request races the live [`RequestTimeout`]. On expiry the call
/// resolves to `Ok(None)` and the reply slot is dropped, so one stuck
/// request cannot wedge a whole sync; the caller decides whether an absent
/// result is tolerable. Remote, decode and channel failures are real errors
/// and propagate. Notifications are not raced; they only enqueue a frame.
#[derive(Clone)]
pub struct BuildServer {
    remote: Endpoint,
    timeout: RequestTimeout,
}

impl BuildServer {
    pub(crate) fn new(remote: Endpoint, timeout: RequestTimeout) -> Self {
        Self { remote, timeout }
    }

    // ------------------------------------------------------------------
    // Handshake and teardown, driven by the connection lifecycle.
    // ------------------------------------------------------------------

    pub(crate) async fn initialize_build(
        &self,
        params: &InitializeBuildParams,
    ) -> Result<Option<InitializeBuildResult>, RequestError> {
        let method = methods::BUILD_INITIALIZE;
        self.call(method, encode(method, params)?).await
    }

    pub(crate) async fn notify_initialized(&self) -> Result<(), RequestError> {
        self.notify(methods::BUILD_INITIALIZED, None).await
    }

    /// `build/shutdown` without waiting for the reply. The id is never
    /// registered, so a late reply is dropped instead of leaking a slot.
    pub(crate) async fn begin_shutdown(&self) -> Result<(), RequestError> {
        tracing::debug!(method = methods::BUILD_SHUTDOWN, "sending request, not awaiting reply");
        self.remote.fire_request(methods::BUILD_SHUTDOWN, None).await?;
        Ok(())
    }

    pub(crate) async fn notify_exit(&self) -> Result<(), RequestError> {
        self.notify(methods::BUILD_EXIT, None).await
    }

    // ------------------------------------------------------------------
    // Workspace queries and target operations.
    // ------------------------------------------------------------------

    pub async fn workspace_build_targets(
        &self,
    ) -> Result<Option<WorkspaceBuildTargetsResult>, RequestError> {
        self.call(methods::WORKSPACE_BUILD_TARGETS, None).await
    }

    pub async fn build_target_sources(
        &self,
        params: &SourcesParams,
    ) -> Result<Option<SourcesResult>, RequestError> {
        let method = methods::BUILD_TARGET_SOURCES;
        self.call(method, encode(method, params)?).await
    }

    pub async fn build_target_resources(
        &self,
        params: &ResourcesParams,
    ) -> Result<Option<ResourcesResult>, RequestError> {
        let method = methods::BUILD_TARGET_RESOURCES;
        self.call(method, encode(method, params)?).await
    }

    pub async fn build_target_dependency_sources(
        &self,
        params: &DependencySourcesParams,
    ) -> Result<Option<DependencySourcesResult>, RequestError> {
        let method = methods::BUILD_TARGET_DEPENDENCY_SOURCES;
        self.call(method, encode(method, params)?).await
    }

    pub async fn compile(
        &self,
        params: &CompileParams,
    ) -> Result<Option<CompileResult>, RequestError> {
        let method = methods::BUILD_TARGET_COMPILE;
        self.call(method, encode(method, params)?).await
    }

    pub async fn run(&self, params: &RunParams) -> Result<Option<RunResult>, RequestError> {
        let method = methods::BUILD_TARGET_RUN;
        self.call(method, encode(method, params)?).await
    }

    pub async fn test(&self, params: &TestParams) -> Result<Option<TestResult>, RequestError> {
        let method = methods::BUILD_TARGET_TEST;
        self.call(method, encode(method, params)?).await
    }

    // ------------------------------------------------------------------

    async fn call<R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<Option<R>, RequestError> {
        let limit = self.timeout.get();
        let started = Instant::now();
        tracing::debug!(method, timeout_secs = limit.as_secs(), "sending request");

        // The enqueue sits inside the timed window: a server that stopped
        // draining its stdin counts against the deadline the same way a
        // silent one does.
        let mut in_flight = None;
        let outcome = tokio::time::timeout(limit, async {
            let (id, rx) = self.remote.start_request(method, params).await?;
            in_flight = Some(id);
            rx.await.map_err(|_| RequestError::ChannelClosed)
        })
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(Ok(value))) => match serde_json::from_value(value) {
                Ok(decoded) => {
                    tracing::debug!(method, elapsed_ms, "request completed");
                    Ok(Some(decoded))
                }
                Err(e) => {
                    tracing::debug!(method, elapsed_ms, "response failed to decode");
                    Err(RequestError::Decode { method, source: e })
                }
            },
            Ok(Ok(Err(remote))) => {
                tracing::debug!(method, elapsed_ms, code = remote.code, "request failed remotely");
                Err(RequestError::Remote {
                    method,
                    source: remote,
                })
            }
            Ok(Err(e)) => {
                tracing::debug!(method, elapsed_ms, "channel closed mid-request");
                Err(e)
            }
            Err(_) => {
                if let Some(id) = in_flight {
                    self.remote.forget(id).await;
                }
                tracing::error!(
                    method,
                    elapsed_ms,
                    "request timed out, treating result as absent"
                );
                Ok(None)
            }
        }
    }

    async fn notify(&self, method: &'static str, params: Option<Value>) -> Result<(), RequestError> {
        tracing::debug!(method, "sending notification");
        self.remote.notify(method, params).await?;
        Ok(())
    }
}

fn encode<P: Serialize>(method: &'static str, params: &P) -> Result<Option<Value>, RequestError> {
    match serde_json::to_value(params) {
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(RequestError::Encode { method, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::{BuildServer, RequestError};
    use crate::channel::bind;
    use crate::client::LoggingClient;
    use crate::settings::RequestTimeout;
    use crate::testkit::{FakeServer, Reply, eventually};
    use crucible_protocol::bsp::{BuildTargetIdentifier, CompileParams, StatusCode};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn proxy(fake: &FakeServer, timeout_secs: u64) -> BuildServer {
        BuildServer::new(fake.endpoint.clone(), RequestTimeout::new(timeout_secs))
    }

    #[tokio::test]
    async fn test_call_returns_decoded_result() {
        let mut fake = FakeServer::spawn(
            [(
                "workspace/buildTargets",
                Reply::result(json!({"targets": [{"id": {"uri": "bsp://w/app"}}]})),
            )],
            Arc::new(LoggingClient),
        );
        let server = proxy(&fake, 5);

        let result = server.workspace_build_targets().await.unwrap().unwrap();
        assert_eq!(result.targets.len(), 1);
        assert_eq!(result.targets[0].id.uri, "bsp://w/app");
        assert_eq!(fake.requests(), vec!["workspace/buildTargets"]);
        fake.stop().await;
    }

    #[tokio::test]
    async fn test_slow_reply_resolves_absent_at_the_timeout() {
        // Reply takes five seconds, the timeout is one: the call must come
        // back at the timeout with an absent result, not an error.
        let mut fake = FakeServer::spawn(
            [(
                "workspace/buildTargets",
                Reply::delayed(json!({"targets": []}), Duration::from_secs(5)),
            )],
            Arc::new(LoggingClient),
        );
        let server = proxy(&fake, 1);

        let started = Instant::now();
        let result = server.workspace_build_targets().await.unwrap();
        let elapsed = started.elapsed();

        assert!(result.is_none());
        assert!(elapsed >= Duration::from_secs(1), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "returned too late: {elapsed:?}");
        // The abandoned reply slot must not leak.
        assert_eq!(fake.endpoint.pending_len().await, 0);
        fake.stop().await;
    }

    #[tokio::test]
    async fn test_jammed_outbound_queue_resolves_absent_at_the_timeout() {
        // A peer that never reads: writes stall once the stream buffer is
        // full and the outbound queue fills up behind them. The deadline
        // must cover the enqueue too, not just the wait for a reply.
        let (local, jammed) = tokio::io::duplex(64);
        let (local_read, local_write) = tokio::io::split(local);
        let (endpoint, mut listener) = bind(local_read, local_write, Arc::new(LoggingClient));
        for _ in 0..80 {
            let squeeze = endpoint.clone();
            tokio::spawn(async move {
                let _ = squeeze
                    .notify("build/taskStart", Some(json!({"taskId": {"id": "jam"}})))
                    .await;
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let server = BuildServer::new(endpoint.clone(), RequestTimeout::new(1));
        let started = Instant::now();
        let result = server.workspace_build_targets().await.unwrap();
        let elapsed = started.elapsed();

        assert!(result.is_none());
        assert!(elapsed >= Duration::from_secs(1), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "returned too late: {elapsed:?}");
        // The request never got registered, so there is nothing to leak.
        assert_eq!(endpoint.pending_len().await, 0);

        drop(jammed);
        listener.cancel().await;
    }

    #[tokio::test]
    async fn test_remote_error_propagates() {
        let mut fake = FakeServer::spawn(
            [("buildTarget/compile", Reply::error(-32603, "compiler crashed"))],
            Arc::new(LoggingClient),
        );
        let server = proxy(&fake, 5);

        let params = CompileParams {
            targets: vec![BuildTargetIdentifier::new("bsp://w/app")],
            origin_id: None,
            arguments: Vec::new(),
        };
        match server.compile(&params).await {
            Err(RequestError::Remote { method, source }) => {
                assert_eq!(method, "buildTarget/compile");
                assert_eq!(source.code, -32603);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        fake.stop().await;
    }

    #[tokio::test]
    async fn test_undecodable_response_propagates() {
        let mut fake = FakeServer::spawn(
            [("workspace/buildTargets", Reply::result(json!({"targets": 42})))],
            Arc::new(LoggingClient),
        );
        let server = proxy(&fake, 5);

        assert!(matches!(
            server.workspace_build_targets().await,
            Err(RequestError::Decode { .. })
        ));
        fake.stop().await;
    }

    #[tokio::test]
    async fn test_closed_channel_propagates() {
        let mut fake = FakeServer::spawn([], Arc::new(LoggingClient));
        let server = proxy(&fake, 5);
        fake.stop().await;

        assert!(matches!(
            server.workspace_build_targets().await,
            Err(RequestError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_notifications_are_not_raced_against_the_timeout() {
        let mut fake = FakeServer::spawn([], Arc::new(LoggingClient));
        let server = proxy(&fake, 1);

        server.notify_exit().await.unwrap();
        assert!(eventually(|| fake.requests().contains(&"build/exit".to_owned())).await);
        assert_eq!(fake.endpoint.pending_len().await, 0);
        fake.stop().await;
    }

    #[tokio::test]
    async fn test_begin_shutdown_does_not_wait_and_drops_the_late_reply() {
        let mut fake = FakeServer::spawn(
            [("build/shutdown", Reply::result(json!(null)))],
            Arc::new(LoggingClient),
        );
        let server = proxy(&fake, 5);

        let started = Instant::now();
        server.begin_shutdown().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        // The reply arrives with no registered slot and must be dropped.
        assert!(eventually(|| fake.requests().contains(&"build/shutdown".to_owned())).await);
        assert_eq!(fake.endpoint.pending_len().await, 0);
        fake.stop().await;
    }

    #[tokio::test]
    async fn test_compile_round_trip_decodes_status() {
        let mut fake = FakeServer::spawn(
            [(
                "buildTarget/compile",
                Reply::result(json!({"statusCode": 1, "originId": "sync-7"})),
            )],
            Arc::new(LoggingClient),
        );
        let server = proxy(&fake, 5);

        let params = CompileParams {
            targets: vec![BuildTargetIdentifier::new("bsp://w/app")],
            origin_id: Some("sync-7".to_owned()),
            arguments: Vec::new(),
        };
        let result = server.compile(&params).await.unwrap().unwrap();
        assert_eq!(result.status_code, StatusCode::Ok);
        assert_eq!(result.origin_id.as_deref(), Some("sync-7"));

        let sent = fake.params_for("buildTarget/compile").unwrap();
        assert_eq!(sent["targets"][0]["uri"], "bsp://w/app");
        fake.stop().await;
    }
}
