//! Where connection descriptors come from: an existing file under `.bsp/`,
//! or a generator that produces one on demand.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use crucible_protocol::descriptor::{CONNECTION_DIR, ConnectionDetails, DescriptorError};

use crate::generator::GeneratorRegistry;

/// A parsed descriptor together with the file it was read from.
#[derive(Debug, Clone)]
pub struct LocatedDetails {
    pub file: PathBuf,
    pub details: ConnectionDetails,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("connection file not found: {}", path.display())]
    Missing { path: PathBuf },

    #[error("failed to read connection file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid connection file {}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: DescriptorError,
    },

    #[error("no generator named `{name}` claims this workspace")]
    UnknownGenerator { name: String },

    #[error("generator `{name}` exited with {status}")]
    GeneratorFailed { name: String, status: ExitStatus },

    #[error("generator `{name}` could not run")]
    GeneratorIo {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("generator `{name}` finished without writing {}", expected.display())]
    NoDescriptorProduced { name: String, expected: PathBuf },
}

/// How the descriptor for a connection is obtained.
#[derive(Debug, Clone)]
pub enum ConnectionSource {
    /// Read an existing `.bsp/*.json` file.
    File { path: PathBuf },
    /// Run the named generator, then read the file it leaves behind.
    Generator {
        name: String,
        registry: GeneratorRegistry,
    },
}

impl ConnectionSource {
    pub async fn resolve(&self, workspace_root: &Path) -> Result<LocatedDetails, SourceError> {
        match self {
            Self::File { path } => read_details(path).await,
            Self::Generator { name, registry } => {
                // Generator progress goes to our stderr, next to the
                // child's own stderr output.
                let mut progress = tokio::io::stderr();
                let path = registry.generate(name, workspace_root, &mut progress).await?;
                read_details(&path).await
            }
        }
    }
}

async fn read_details(path: &Path) -> Result<LocatedDetails, SourceError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            return Err(SourceError::Missing {
                path: path.to_owned(),
            });
        }
        Err(source) => {
            return Err(SourceError::Read {
                path: path.to_owned(),
                source,
            });
        }
    };
    let details = ConnectionDetails::parse(&raw).map_err(|source| SourceError::Invalid {
        path: path.to_owned(),
        source,
    })?;
    Ok(LocatedDetails {
        file: path.to_owned(),
        details,
    })
}

/// Every `.bsp/*.json` file in the workspace, sorted by path. A missing
/// `.bsp` directory is an empty result, not an error.
pub async fn find_connection_files(workspace_root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let dir = workspace_root.join(CONNECTION_DIR);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
