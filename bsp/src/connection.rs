//! A managed connection to one build server: resolve the descriptor, launch
//! the process, run the `build/initialize` handshake, and tear everything
//! down again in a fixed order.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::Mutex;

use crucible_protocol::bsp::{
    BuildClientCapabilities, InitializeBuildParams, InitializeBuildResult,
};
use crucible_protocol::descriptor::ConnectionDetails;
use crucible_protocol::uri::{PathToUriError, path_to_file_uri};

use crate::channel::{self, Outbound};
use crate::client::BuildClient;
use crate::launch::{self, LaunchError};
use crate::proxy::{BuildServer, RequestError};
use crate::settings::RequestTimeout;
use crate::sources::{ConnectionSource, LocatedDetails, SourceError};

/// The protocol version advertised during the handshake.
pub const BSP_VERSION: &str = "2.1.0";

/// How long a server gets to exit on its own after `build/exit` before it
/// is killed.
const PROCESS_EXIT_GRACE: Duration = Duration::from_secs(3);

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type ActionFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// One step of the teardown sequence. Steps run in the order they were
/// queued, and a failing step never stops the steps after it.
struct DisconnectAction {
    name: &'static str,
    run: Box<dyn FnOnce() -> ActionFuture + Send>,
}

impl DisconnectAction {
    fn new<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            name,
            run: Box::new(move || Box::pin(run())),
        }
    }
}

/// A teardown step that failed.
#[derive(Debug)]
pub struct ActionFailure {
    pub action: &'static str,
    pub error: BoxError,
}

/// Teardown ran to completion but some steps failed. The first failure is
/// the primary cause; later ones are kept rather than swallowed.
#[derive(Debug)]
pub struct TeardownError {
    pub primary: ActionFailure,
    pub secondaries: Vec<ActionFailure>,
}

impl std::fmt::Display for TeardownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "disconnect step `{}` failed: {}",
            self.primary.action, self.primary.error
        )?;
        if !self.secondaries.is_empty() {
            write!(f, " ({} later steps also failed)", self.secondaries.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let primary: &(dyn std::error::Error + 'static) = self.primary.error.as_ref();
        Some(primary)
    }
}

async fn drain_actions(actions: Vec<DisconnectAction>) -> Result<(), TeardownError> {
    let mut failures = Vec::new();
    for action in actions {
        tracing::debug!(step = action.name, "running disconnect step");
        if let Err(error) = (action.run)().await {
            tracing::warn!(step = action.name, %error, "disconnect step failed");
            failures.push(ActionFailure {
                action: action.name,
                error,
            });
        }
    }

    let mut failures = failures.into_iter();
    match failures.next() {
        None => Ok(()),
        Some(primary) => Err(TeardownError {
            primary,
            secondaries: failures.collect(),
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("already connected to `{name}`")]
    AlreadyConnected { name: String },

    #[error("workspace root is not usable: {}", path.display())]
    InvalidWorkspaceRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    RootUri(#[from] PathToUriError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("build server handshake failed")]
    Initialize(#[source] RequestError),
}

/// What survives a restart: where the descriptor lives and which generator
/// produced it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConnection {
    pub connection_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
}

/// A build-server connection for one workspace.
pub struct Connection {
    workspace_root: PathBuf,
    source: ConnectionSource,
    client: Arc<dyn BuildClient>,
    timeout: RequestTimeout,
    exit_grace: Duration,
    active: Option<Active>,
}

struct Active {
    located: LocatedDetails,
    server: BuildServer,
    child: Arc<Mutex<Child>>,
    initialize: Option<InitializeBuildResult>,
    process_id: Option<u32>,
    actions: Vec<DisconnectAction>,
}

impl Connection {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        source: ConnectionSource,
        client: Arc<dyn BuildClient>,
        timeout: RequestTimeout,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            source,
            client,
            timeout,
            exit_grace: PROCESS_EXIT_GRACE,
            active: None,
        }
    }

    /// Rebuilds a disconnected connection from its persisted form. The
    /// descriptor file is re-read and re-validated now, so a stale persisted
    /// path fails here instead of at the next connect; the generator, if
    /// any, is not re-run.
    pub async fn restore(
        workspace_root: impl Into<PathBuf>,
        persisted: &PersistedConnection,
        client: Arc<dyn BuildClient>,
        timeout: RequestTimeout,
    ) -> Result<Self, SourceError> {
        let workspace_root = workspace_root.into();
        let source = ConnectionSource::File {
            path: persisted.connection_file.clone(),
        };
        source.resolve(&workspace_root).await?;
        Ok(Self::new(workspace_root, source, client, timeout))
    }

    /// The restartable identity of a live connection.
    #[must_use]
    pub fn persisted(&self) -> Option<PersistedConnection> {
        let active = self.active.as_ref()?;
        let generator = match &self.source {
            ConnectionSource::Generator { name, .. } => Some(name.clone()),
            ConnectionSource::File { .. } => None,
        };
        Some(PersistedConnection {
            connection_file: active.located.file.clone(),
            generator,
        })
    }

    /// Liveness probe: whether a connection was established and its process
    /// is still running. A server that crashed reports false here without
    /// waiting for [`Connection::disconnect`].
    pub async fn is_connected(&self) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        matches!(active.child.lock().await.try_wait(), Ok(None))
    }

    /// The request surface of the live connection, if any.
    #[must_use]
    pub fn server(&self) -> Option<&BuildServer> {
        self.active.as_ref().map(|active| &active.server)
    }

    #[must_use]
    pub fn details(&self) -> Option<&ConnectionDetails> {
        self.active.as_ref().map(|active| &active.located.details)
    }

    #[must_use]
    pub fn connection_file(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.located.file.as_path())
    }

    #[must_use]
    pub fn process_id(&self) -> Option<u32> {
        self.active.as_ref().and_then(|active| active.process_id)
    }

    /// What the server reported during the handshake. Absent when the
    /// initialize reply timed out.
    #[must_use]
    pub fn initialize_result(&self) -> Option<&InitializeBuildResult> {
        self.active.as_ref().and_then(|active| active.initialize.as_ref())
    }

    #[cfg(test)]
    fn set_exit_grace(&mut self, grace: Duration) {
        self.exit_grace = grace;
    }

    /// Resolves the descriptor, launches the server and runs the
    /// `build/initialize` handshake.
    ///
    /// If the handshake fails, the freshly spawned server is torn down
    /// again before the error is returned.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if let Some(active) = &self.active {
            return Err(ConnectError::AlreadyConnected {
                name: active.located.details.name.clone(),
            });
        }

        let root = tokio::fs::canonicalize(&self.workspace_root)
            .await
            .map_err(|source| ConnectError::InvalidWorkspaceRoot {
                path: self.workspace_root.clone(),
                source,
            })?;
        let located = self.source.resolve(&root).await?;
        let params = initialize_params(&root, &located.details)?;
        tracing::info!(
            name = %located.details.name,
            file = %located.file.display(),
            "launching build server"
        );

        let launched = launch::launch(&located.details, &root)?;
        let process_id = launched.child.id();
        let child = Arc::new(Mutex::new(launched.child));
        let (endpoint, listener) =
            channel::bind(launched.stdout, launched.stdin, self.client.clone());
        let server = BuildServer::new(endpoint.clone(), self.timeout.clone());
        let actions = teardown_actions(&server, &endpoint, &child, listener, self.exit_grace);

        let mut active = Active {
            located,
            server,
            child,
            initialize: None,
            process_id,
            actions,
        };

        match active.server.initialize_build(&params).await {
            Ok(result) => {
                if let Some(result) = &result {
                    self.client.on_build_initialize(result);
                }
                active.initialize = result;
            }
            Err(err) => {
                unwind(active).await;
                return Err(ConnectError::Initialize(err));
            }
        }
        if let Err(err) = active.server.notify_initialized().await {
            unwind(active).await;
            return Err(ConnectError::Initialize(err));
        }

        tracing::info!(
            name = %active.located.details.name,
            pid = active.process_id,
            "build server connected"
        );
        self.active = Some(active);
        Ok(())
    }

    /// Runs the teardown sequence. Safe to call when not connected.
    pub async fn disconnect(&mut self) -> Result<(), TeardownError> {
        let Some(active) = self.active.take() else {
            tracing::debug!("disconnect with no live connection");
            return Ok(());
        };

        let name = active.located.details.name.clone();
        let result = drain_actions(active.actions).await;
        match &result {
            Ok(()) => tracing::info!(name = %name, "build server disconnected"),
            Err(err) => {
                tracing::warn!(name = %name, "build server teardown incomplete: {err}");
            }
        }
        result
    }
}

/// A dead server cannot take the goodbye messages; that is not a teardown
/// failure, the process-level steps still run.
fn tolerate_closed(sent: Result<(), RequestError>) -> Result<(), BoxError> {
    match sent {
        Ok(()) => Ok(()),
        Err(RequestError::ChannelClosed) => {
            tracing::debug!("channel already closed, skipping goodbye");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Best-effort teardown of a half-connected server.
async fn unwind(active: Active) {
    if let Err(err) = drain_actions(active.actions).await {
        tracing::warn!("teardown after failed handshake also failed: {err}");
    }
}

fn initialize_params(
    root: &Path,
    details: &ConnectionDetails,
) -> Result<InitializeBuildParams, ConnectError> {
    let root_uri = path_to_file_uri(root)?.to_string();
    Ok(InitializeBuildParams {
        display_name: "crucible".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        bsp_version: BSP_VERSION.to_owned(),
        root_uri,
        capabilities: BuildClientCapabilities {
            language_ids: details.languages.clone(),
        },
    })
}

/// The fixed teardown sequence, queued at connect time so that disconnect
/// behaves the same no matter what state the server is in by then.
///
/// Order: ask nicely (`build/shutdown`, `build/exit`), give the process a
/// grace period, kill it if it is still there, then release our side of
/// the streams.
fn teardown_actions(
    server: &BuildServer,
    endpoint: &channel::Endpoint,
    child: &Arc<Mutex<Child>>,
    listener: channel::Listener,
    exit_grace: Duration,
) -> Vec<DisconnectAction> {
    let mut actions = Vec::new();

    let shutdown_server = server.clone();
    actions.push(DisconnectAction::new("send shutdown request", move || {
        async move { tolerate_closed(shutdown_server.begin_shutdown().await) }
    }));

    let exit_server = server.clone();
    actions.push(DisconnectAction::new("send exit notification", move || {
        async move { tolerate_closed(exit_server.notify_exit().await) }
    }));

    let wait_child = child.clone();
    actions.push(DisconnectAction::new("wait for server exit", move || {
        async move {
            let waited = tokio::time::timeout(exit_grace, async {
                wait_child.lock().await.wait().await
            })
            .await;
            match waited {
                Ok(Ok(status)) => {
                    tracing::debug!(%status, "build server exited");
                    Ok(())
                }
                Ok(Err(err)) => Err(err.into()),
                Err(_) => {
                    tracing::info!("build server still running after exit grace");
                    Ok(())
                }
            }
        }
    }));

    let kill_child = child.clone();
    actions.push(DisconnectAction::new("kill server process", move || {
        async move {
            let mut child = kill_child.lock().await;
            if let Ok(Some(_)) = child.try_wait() {
                return Ok(());
            }
            child.kill().await?;
            Ok(())
        }
    }));

    let writer = endpoint.writer_handle();
    actions.push(DisconnectAction::new("close server stdin", move || {
        async move {
            // The writer already being gone means the stream is closed.
            let _ = writer.send(Outbound::Shutdown).await;
            Ok(())
        }
    }));

    let mut halting = listener;
    actions.push(DisconnectAction::new("stop listener", move || {
        async move {
            halting.cancel().await;
            Ok(())
        }
    }));

    actions
}
