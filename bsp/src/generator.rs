//! Descriptor generators: build tools that can write a `.bsp` connection
//! file into a workspace that does not have one yet.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::process::Command;

use crucible_protocol::descriptor::CONNECTION_DIR;

use crate::sources::SourceError;

/// A build tool able to produce a connection descriptor for a workspace.
#[async_trait]
pub trait DetailsGenerator: Send + Sync {
    /// Stable name used to select this generator.
    fn name(&self) -> &str;

    /// Whether this workspace looks like one this generator understands.
    fn can_generate(&self, workspace_root: &Path) -> bool;

    /// Produces the descriptor file and returns its path. Progress output
    /// from the underlying tool is forwarded to `output`.
    async fn generate(
        &self,
        workspace_root: &Path,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<PathBuf, SourceError>;
}

/// Runs `argv` in `workdir`, streaming the child's stdout into `output`.
/// The child inherits our environment and stderr.
pub(crate) async fn execute_and_wait(
    argv: &[String],
    workdir: &Path,
    output: &mut (dyn AsyncWrite + Send + Unpin),
) -> std::io::Result<ExitStatus> {
    let Some((program, args)) = argv.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty generator argv",
        ));
    };
    let mut child = Command::new(program)
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdout) = child.stdout.take() {
        tokio::io::copy(&mut stdout, output).await?;
    }
    child.wait().await
}

/// Generator that shells out to a fixed command and expects it to leave
/// `.bsp/<name>.json` behind in the workspace.
pub struct CommandGenerator {
    name: String,
    argv: Vec<String>,
    marker: String,
}

impl CommandGenerator {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        argv: impl IntoIterator<Item = impl Into<String>>,
        marker: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            argv: argv.into_iter().map(Into::into).collect(),
            marker: marker.into(),
        }
    }
}

#[async_trait]
impl DetailsGenerator for CommandGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_generate(&self, workspace_root: &Path) -> bool {
        workspace_root.join(&self.marker).exists()
    }

    async fn generate(
        &self,
        workspace_root: &Path,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<PathBuf, SourceError> {
        tracing::info!(generator = %self.name, "generating connection descriptor");
        let status = execute_and_wait(&self.argv, workspace_root, output)
            .await
            .map_err(|source| SourceError::GeneratorIo {
                name: self.name.clone(),
                source,
            })?;
        if !status.success() {
            return Err(SourceError::GeneratorFailed {
                name: self.name.clone(),
                status,
            });
        }

        let expected = workspace_root
            .join(CONNECTION_DIR)
            .join(format!("{}.json", self.name));
        if !expected.is_file() {
            return Err(SourceError::NoDescriptorProduced {
                name: self.name.clone(),
                expected,
            });
        }
        Ok(expected)
    }
}

/// All generators the application knows about, filterable per workspace.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: Vec<Arc<dyn DetailsGenerator>>,
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("generators", &self.generators.len())
            .finish()
    }
}

impl GeneratorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the well-known build tools.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self {
            generators: builtin_generators(),
        }
    }

    pub fn register(&mut self, generator: Arc<dyn DetailsGenerator>) {
        self.generators.push(generator);
    }

    /// Names of the generators that claim this workspace.
    #[must_use]
    pub fn available(&self, workspace_root: &Path) -> Vec<&str> {
        self.generators
            .iter()
            .filter(|g| g.can_generate(workspace_root))
            .map(|g| g.name())
            .collect()
    }

    #[must_use]
    pub fn can_generate_any(&self, workspace_root: &Path) -> bool {
        self.generators
            .iter()
            .any(|g| g.can_generate(workspace_root))
    }

    /// Runs the named generator, provided it claims this workspace.
    pub async fn generate(
        &self,
        name: &str,
        workspace_root: &Path,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<PathBuf, SourceError> {
        let found = self
            .generators
            .iter()
            .find(|g| g.name() == name && g.can_generate(workspace_root));
        let Some(generator) = found else {
            return Err(SourceError::UnknownGenerator {
                name: name.to_owned(),
            });
        };
        generator.generate(workspace_root, output).await
    }
}

/// The well-known build tools, keyed by the marker file that identifies
/// their workspaces. Each command is the tool's own BSP install entry point.
#[must_use]
pub fn builtin_generators() -> Vec<Arc<dyn DetailsGenerator>> {
    vec![
        Arc::new(CommandGenerator::new("cargo-bsp", ["cargo-bsp"], "Cargo.toml"))
            as Arc<dyn DetailsGenerator>,
        Arc::new(CommandGenerator::new("sbt", ["sbt", "bspConfig"], "build.sbt")),
        Arc::new(CommandGenerator::new(
            "mill-bsp",
            ["mill", "mill.bsp.BSP/install"],
            "build.sc",
        )),
    ]
}
