//! Terminal-facing build client.
//!
//! Server chatter goes to stderr so command output on stdout stays clean
//! enough to pipe.

use crucible_bsp::BuildClient;
use crucible_protocol::bsp::{
    DiagnosticSeverity, InitializeBuildResult, LogMessageParams, PublishDiagnosticsParams,
    ShowMessageParams, TaskFinishParams, TaskStartParams,
};
use crucible_protocol::uri::file_uri_to_path;

pub struct ConsoleClient;

impl BuildClient for ConsoleClient {
    fn on_build_initialize(&self, result: &InitializeBuildResult) {
        eprintln!(
            "connected to {} {} (bsp {})",
            result.display_name, result.version, result.bsp_version
        );
    }

    fn on_log_message(&self, params: LogMessageParams) {
        eprintln!("[{}] {}", params.message_type.label(), params.message);
    }

    fn on_show_message(&self, params: ShowMessageParams) {
        eprintln!("[{}] {}", params.message_type.label(), params.message);
    }

    fn on_task_start(&self, params: TaskStartParams) {
        match params.message {
            Some(message) => eprintln!("task {} started: {message}", params.task_id.id),
            None => eprintln!("task {} started", params.task_id.id),
        }
    }

    fn on_task_finish(&self, params: TaskFinishParams) {
        eprintln!("task {} finished: {}", params.task_id.id, params.status.label());
    }

    fn on_publish_diagnostics(&self, params: PublishDiagnosticsParams) {
        let uri = &params.text_document.uri;
        let shown = file_uri_to_path(uri).map_or_else(|| uri.clone(), |p| p.display().to_string());
        for diagnostic in &params.diagnostics {
            let severity = diagnostic.severity.map_or("error", DiagnosticSeverity::label);
            eprintln!(
                "{shown}:{}:{}: {severity}: {}",
                diagnostic.range.start.line + 1,
                diagnostic.range.start.character + 1,
                diagnostic.message
            );
        }
    }
}
