//! Typed subset of the Build Server Protocol.
//!
//! Only the requests and notifications the connection layer actually speaks
//! are modeled. Everything serializes with the camelCase field names the
//! protocol mandates; integer-coded enums reject values outside the protocol
//! range at decode time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Method names, exactly as they appear in the `method` member of a frame.
pub mod methods {
    pub const BUILD_INITIALIZE: &str = "build/initialize";
    pub const BUILD_INITIALIZED: &str = "build/initialized";
    pub const BUILD_SHUTDOWN: &str = "build/shutdown";
    pub const BUILD_EXIT: &str = "build/exit";
    pub const WORKSPACE_BUILD_TARGETS: &str = "workspace/buildTargets";
    pub const BUILD_TARGET_SOURCES: &str = "buildTarget/sources";
    pub const BUILD_TARGET_RESOURCES: &str = "buildTarget/resources";
    pub const BUILD_TARGET_DEPENDENCY_SOURCES: &str = "buildTarget/dependencySources";
    pub const BUILD_TARGET_COMPILE: &str = "buildTarget/compile";
    pub const BUILD_TARGET_RUN: &str = "buildTarget/run";
    pub const BUILD_TARGET_TEST: &str = "buildTarget/test";
    pub const BUILD_LOG_MESSAGE: &str = "build/logMessage";
    pub const BUILD_SHOW_MESSAGE: &str = "build/showMessage";
    pub const BUILD_TASK_START: &str = "build/taskStart";
    pub const BUILD_TASK_PROGRESS: &str = "build/taskProgress";
    pub const BUILD_TASK_FINISH: &str = "build/taskFinish";
    pub const BUILD_PUBLISH_DIAGNOSTICS: &str = "build/publishDiagnostics";
    pub const BUILD_TARGET_DID_CHANGE: &str = "buildTarget/didChangeBuildTarget";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("value {0} is not a known protocol constant")]
pub struct UnknownEnumValue(pub i32);

// ============================================================================
// Initialization
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildClientCapabilities {
    #[serde(default)]
    pub language_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeBuildParams {
    pub display_name: String,
    pub version: String,
    pub bsp_version: String,
    pub root_uri: String,
    pub capabilities: BuildClientCapabilities,
}

/// Language coverage advertised for one provider kind (compile, test, run).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageProvider {
    #[serde(default)]
    pub language_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_provider: Option<LanguageProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_provider: Option<LanguageProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_provider: Option<LanguageProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_sources_provider: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources_provider: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_reload: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeBuildResult {
    pub display_name: String,
    pub version: String,
    pub bsp_version: String,
    #[serde(default)]
    pub capabilities: BuildServerCapabilities,
}

// ============================================================================
// Build targets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildTargetIdentifier {
    pub uri: String,
}

impl BuildTargetIdentifier {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildTargetCapabilities {
    pub can_compile: bool,
    pub can_test: bool,
    pub can_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTarget {
    pub id: BuildTargetIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub language_ids: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<BuildTargetIdentifier>,
    #[serde(default)]
    pub capabilities: BuildTargetCapabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceBuildTargetsResult {
    #[serde(default)]
    pub targets: Vec<BuildTarget>,
}

// ============================================================================
// Target metadata queries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesParams {
    pub targets: Vec<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum SourceItemKind {
    File,
    Directory,
}

impl TryFrom<i32> for SourceItemKind {
    type Error = UnknownEnumValue;

    fn try_from(value: i32) -> Result<Self, UnknownEnumValue> {
        match value {
            1 => Ok(SourceItemKind::File),
            2 => Ok(SourceItemKind::Directory),
            other => Err(UnknownEnumValue(other)),
        }
    }
}

impl From<SourceItemKind> for i32 {
    fn from(value: SourceItemKind) -> Self {
        match value {
            SourceItemKind::File => 1,
            SourceItemKind::Directory => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub uri: String,
    pub kind: SourceItemKind,
    #[serde(default)]
    pub generated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesItem {
    pub target: BuildTargetIdentifier,
    #[serde(default)]
    pub sources: Vec<SourceItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesResult {
    #[serde(default)]
    pub items: Vec<SourcesItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesParams {
    pub targets: Vec<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesItem {
    pub target: BuildTargetIdentifier,
    #[serde(default)]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesResult {
    #[serde(default)]
    pub items: Vec<ResourcesItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySourcesParams {
    pub targets: Vec<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySourcesItem {
    pub target: BuildTargetIdentifier,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencySourcesResult {
    #[serde(default)]
    pub items: Vec<DependencySourcesItem>,
}

// ============================================================================
// Compile / run / test
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum StatusCode {
    Ok,
    Error,
    Cancelled,
}

impl TryFrom<i32> for StatusCode {
    type Error = UnknownEnumValue;

    fn try_from(value: i32) -> Result<Self, UnknownEnumValue> {
        match value {
            1 => Ok(StatusCode::Ok),
            2 => Ok(StatusCode::Error),
            3 => Ok(StatusCode::Cancelled),
            other => Err(UnknownEnumValue(other)),
        }
    }
}

impl From<StatusCode> for i32 {
    fn from(value: StatusCode) -> Self {
        match value {
            StatusCode::Ok => 1,
            StatusCode::Error => 2,
            StatusCode::Cancelled => 3,
        }
    }
}

impl StatusCode {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::Error => "error",
            StatusCode::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileParams {
    pub targets: Vec<BuildTargetIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    pub status_code: StatusCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    pub target: BuildTargetIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    pub status_code: StatusCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestParams {
    pub targets: Vec<BuildTargetIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    pub status_code: StatusCode,
}

// ============================================================================
// Server-to-client notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum MessageType {
    Error,
    Warning,
    Info,
    Log,
}

impl MessageType {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            MessageType::Error => "error",
            MessageType::Warning => "warning",
            MessageType::Info => "info",
            MessageType::Log => "log",
        }
    }
}

impl TryFrom<i32> for MessageType {
    type Error = UnknownEnumValue;

    fn try_from(value: i32) -> Result<Self, UnknownEnumValue> {
        match value {
            1 => Ok(MessageType::Error),
            2 => Ok(MessageType::Warning),
            3 => Ok(MessageType::Info),
            4 => Ok(MessageType::Log),
            other => Err(UnknownEnumValue(other)),
        }
    }
}

impl From<MessageType> for i32 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Error => 1,
            MessageType::Warning => 2,
            MessageType::Info => 3,
            MessageType::Log => 4,
        }
    }
}

/// Task identity threaded through start/progress/finish notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessageParams {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowMessageParams {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStartParams {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgressParams {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFinishParams {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: StatusCode,
}

// ============================================================================
// Diagnostics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Information,
    Hint,
}

impl DiagnosticSeverity {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            DiagnosticSeverity::Error => "error",
            DiagnosticSeverity::Warning => "warning",
            DiagnosticSeverity::Information => "info",
            DiagnosticSeverity::Hint => "hint",
        }
    }
}

impl TryFrom<i32> for DiagnosticSeverity {
    type Error = UnknownEnumValue;

    fn try_from(value: i32) -> Result<Self, UnknownEnumValue> {
        match value {
            1 => Ok(DiagnosticSeverity::Error),
            2 => Ok(DiagnosticSeverity::Warning),
            3 => Ok(DiagnosticSeverity::Information),
            4 => Ok(DiagnosticSeverity::Hint),
            other => Err(UnknownEnumValue(other)),
        }
    }
}

impl From<DiagnosticSeverity> for i32 {
    fn from(value: DiagnosticSeverity) -> Self {
        match value {
            DiagnosticSeverity::Error => 1,
            DiagnosticSeverity::Warning => 2,
            DiagnosticSeverity::Information => 3,
            DiagnosticSeverity::Hint => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<DiagnosticSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishDiagnosticsParams {
    pub text_document: TextDocumentIdentifier,
    pub build_target: BuildTargetIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    pub reset: bool,
}

// ============================================================================
// Target-set changes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum BuildTargetEventKind {
    Created,
    Changed,
    Deleted,
}

impl TryFrom<i32> for BuildTargetEventKind {
    type Error = UnknownEnumValue;

    fn try_from(value: i32) -> Result<Self, UnknownEnumValue> {
        match value {
            1 => Ok(BuildTargetEventKind::Created),
            2 => Ok(BuildTargetEventKind::Changed),
            3 => Ok(BuildTargetEventKind::Deleted),
            other => Err(UnknownEnumValue(other)),
        }
    }
}

impl From<BuildTargetEventKind> for i32 {
    fn from(value: BuildTargetEventKind) -> Self {
        match value {
            BuildTargetEventKind::Created => 1,
            BuildTargetEventKind::Changed => 2,
            BuildTargetEventKind::Deleted => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTargetEvent {
    pub target: BuildTargetIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<BuildTargetEventKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DidChangeBuildTarget {
    #[serde(default)]
    pub changes: Vec<BuildTargetEvent>,
}
