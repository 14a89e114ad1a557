//! Client-side handlers for server-initiated notifications.

use crucible_protocol::bsp::{
    DidChangeBuildTarget, InitializeBuildResult, LogMessageParams, PublishDiagnosticsParams,
    ShowMessageParams, TaskFinishParams, TaskProgressParams, TaskStartParams,
};

/// The local service a connection dispatches server notifications into.
///
/// Handlers run on the connection's listener task, so implementations must
/// be cheap and non-blocking; hand anything heavy to a channel or task of
/// your own. Default bodies log the traffic and drop it.
pub trait BuildClient: Send + Sync {
    /// Called once per connect, after the server answered the handshake.
    fn on_build_initialize(&self, result: &InitializeBuildResult) {
        tracing::debug!(
            server = %result.display_name,
            bsp_version = %result.bsp_version,
            "build server initialized"
        );
    }

    fn on_log_message(&self, params: LogMessageParams) {
        tracing::debug!(
            level = params.message_type.label(),
            message = %params.message,
            "build server log"
        );
    }

    fn on_show_message(&self, params: ShowMessageParams) {
        tracing::info!(
            level = params.message_type.label(),
            message = %params.message,
            "build server message"
        );
    }

    fn on_task_start(&self, params: TaskStartParams) {
        tracing::debug!(task = %params.task_id.id, message = ?params.message, "task started");
    }

    fn on_task_progress(&self, params: TaskProgressParams) {
        tracing::trace!(task = %params.task_id.id, progress = ?params.progress, "task progress");
    }

    fn on_task_finish(&self, params: TaskFinishParams) {
        tracing::debug!(task = %params.task_id.id, status = ?params.status, "task finished");
    }

    fn on_publish_diagnostics(&self, params: PublishDiagnosticsParams) {
        tracing::debug!(
            uri = %params.text_document.uri,
            count = params.diagnostics.len(),
            reset = params.reset,
            "diagnostics published"
        );
    }

    fn on_did_change_build_target(&self, params: DidChangeBuildTarget) {
        tracing::debug!(changes = params.changes.len(), "build targets changed");
    }
}

/// A client that does nothing beyond the default logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingClient;

impl BuildClient for LoggingClient {}
