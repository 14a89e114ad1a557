//! Launching a build server process from its connection descriptor.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crucible_protocol::ConnectionDetails;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("descriptor `{name}` has an empty argv")]
    EmptyCommand { name: String },
    #[error("build server executable `{program}` not found: {source}")]
    NotFound {
        program: String,
        #[source]
        source: which::Error,
    },
    #[error("could not spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spawned build server exposes no {stream} pipe")]
    MissingPipe { stream: &'static str },
}

/// A spawned server with its stdio pipes already taken.
pub(crate) struct Launched {
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
}

/// Spawns the server described by `details` with `workdir` as its working
/// directory.
///
/// The descriptor's env entries are layered over this process's inherited
/// environment. stderr passes straight through to ours; servers put human
/// output there precisely because stdout carries the protocol.
/// `kill_on_drop` covers drops without an explicit disconnect.
pub(crate) fn launch(details: &ConnectionDetails, workdir: &Path) -> Result<Launched, LaunchError> {
    let Some(program) = details.program() else {
        return Err(LaunchError::EmptyCommand {
            name: details.name.clone(),
        });
    };
    let resolved = which::which(program).map_err(|source| LaunchError::NotFound {
        program: program.to_owned(),
        source,
    })?;

    tracing::debug!(server = %details.name, program = %resolved.display(), "launching build server");
    let mut child = Command::new(&resolved)
        .args(details.args())
        .envs(&details.env)
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            program: program.to_owned(),
            source,
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or(LaunchError::MissingPipe { stream: "stdout" })?;
    let stdin = child
        .stdin
        .take()
        .ok_or(LaunchError::MissingPipe { stream: "stdin" })?;

    Ok(Launched {
        child,
        stdin,
        stdout,
    })
}
