//! Command-line front end for the build-server connection core.
//!
//! Resolves where the server's connection details come from, spawns and
//! handshakes the server, runs one workspace flow against it, and always
//! disconnects before exiting.

mod client;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crucible_bsp::{
    BuildServer, Connection, ConnectionSource, DEFAULT_REQUEST_TIMEOUT_SECS, GeneratorRegistry,
    ProjectDetails, RequestTimeout, collect_project_details, find_connection_files,
};
use crucible_protocol::bsp::{BuildTargetIdentifier, CompileParams, StatusCode};
use crucible_protocol::descriptor::ConnectionDetails;

use crate::client::ConsoleClient;

#[derive(Parser)]
#[command(name = "crucible", version, about = "Talk to a BSP build server")]
struct Cli {
    #[command(flatten)]
    connect: ConnectArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConnectArgs {
    /// Workspace root holding the `.bsp` directory.
    #[arg(long, global = true, default_value = ".", value_name = "DIR")]
    workspace: PathBuf,

    /// Connection file to use instead of the first `.bsp/*.json` found.
    #[arg(long, global = true, value_name = "FILE")]
    connection_file: Option<PathBuf>,

    /// Produce the connection file with this generator before connecting.
    #[arg(long, global = true, value_name = "NAME", conflicts_with = "connection_file")]
    generator: Option<String>,

    /// Seconds to wait for each server reply before treating it as absent.
    #[arg(
        long,
        global = true,
        env = "CRUCIBLE_REQUEST_TIMEOUT",
        value_name = "SECONDS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS
    )]
    request_timeout: u64,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List connection files and applicable generators for the workspace.
    Descriptors,
    /// Ask the server for its build targets.
    Targets,
    /// Collect targets, sources, resources and dependency sources.
    Sync {
        /// Re-collect every N seconds over the same connection until
        /// interrupted.
        #[arg(long, value_name = "SECONDS")]
        watch: Option<u64>,
    },
    /// Compile build targets, all compilable ones when none are given.
    Compile {
        /// Target URIs to compile.
        targets: Vec<String>,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let connect = &cli.connect;

    match cli.command {
        Command::Descriptors => descriptors(connect).await,
        Command::Targets => {
            with_connection(connect, |server| print_targets(server, connect.json)).await
        }
        Command::Sync { watch } => {
            with_connection(connect, |server| sync(server, connect.json, watch)).await
        }
        Command::Compile { targets } => {
            with_connection(connect, |server| compile(server, connect.json, targets)).await
        }
    }
}

/// Decide where the connection details come from, in precedence order:
/// an explicit file, a named generator, then the first file under `.bsp`.
async fn pick_source(args: &ConnectArgs) -> Result<ConnectionSource> {
    if let Some(path) = &args.connection_file {
        return Ok(ConnectionSource::File { path: path.clone() });
    }
    if let Some(name) = &args.generator {
        return Ok(ConnectionSource::Generator {
            name: name.clone(),
            registry: GeneratorRegistry::with_builtins(),
        });
    }

    let files = find_connection_files(&args.workspace).await?;
    let Some(first) = files.first() else {
        bail!(
            "no connection files under {}; pass --connection-file or --generator",
            args.workspace.join(".bsp").display()
        );
    };
    if files.len() > 1 {
        tracing::info!(
            chosen = %first.display(),
            found = files.len(),
            "multiple connection files, using the first"
        );
    }
    Ok(ConnectionSource::File { path: first.clone() })
}

/// Connect, run one flow against the live server, then disconnect.
/// A failed flow keeps its error even when teardown also fails; the
/// teardown failure is logged instead of masking it.
async fn with_connection<F, Fut>(args: &ConnectArgs, operation: F) -> Result<()>
where
    F: FnOnce(BuildServer) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let source = pick_source(args).await?;
    let mut connection = Connection::new(
        args.workspace.clone(),
        source,
        Arc::new(ConsoleClient),
        RequestTimeout::new(args.request_timeout),
    );
    connection.connect().await?;
    let server = connection
        .server()
        .cloned()
        .context("no live server after connect")?;

    let outcome = operation(server).await;
    match connection.disconnect().await {
        Ok(()) => outcome,
        Err(teardown) => match outcome {
            Ok(()) => Err(teardown.into()),
            Err(err) => {
                tracing::warn!("teardown also failed: {teardown}");
                Err(err)
            }
        },
    }
}

async fn descriptors(args: &ConnectArgs) -> Result<()> {
    let files = find_connection_files(&args.workspace).await?;
    let registry = GeneratorRegistry::with_builtins();
    let generators: Vec<String> = registry
        .available(&args.workspace)
        .into_iter()
        .map(str::to_owned)
        .collect();

    if args.json {
        let mut connection_files = Vec::new();
        for file in &files {
            let details = match tokio::fs::read_to_string(file).await {
                Ok(raw) => ConnectionDetails::parse(&raw).ok(),
                Err(_) => None,
            };
            connection_files.push(serde_json::json!({ "file": file, "details": details }));
        }
        let report = serde_json::json!({
            "connectionFiles": connection_files,
            "generators": generators,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if files.is_empty() {
        println!("no connection files");
    }
    for file in &files {
        match tokio::fs::read_to_string(file).await {
            Ok(raw) => match ConnectionDetails::parse(&raw) {
                Ok(details) => println!(
                    "{}  {} ({})",
                    file.display(),
                    details.name,
                    details.program().unwrap_or("?")
                ),
                Err(err) => println!("{}  invalid: {err}", file.display()),
            },
            Err(err) => println!("{}  unreadable: {err}", file.display()),
        }
    }
    if generators.is_empty() {
        println!("no applicable generators");
    } else {
        println!("generators: {}", generators.join(", "));
    }
    Ok(())
}

async fn print_targets(server: BuildServer, json: bool) -> Result<()> {
    let targets = server
        .workspace_build_targets()
        .await?
        .map(|result| result.targets)
        .unwrap_or_default();

    if json {
        println!("{}", serde_json::to_string_pretty(&targets)?);
        return Ok(());
    }
    if targets.is_empty() {
        println!("no build targets (or the server did not answer in time)");
        return Ok(());
    }
    for target in &targets {
        let mut capabilities = Vec::new();
        if target.capabilities.can_compile {
            capabilities.push("compile");
        }
        if target.capabilities.can_test {
            capabilities.push("test");
        }
        if target.capabilities.can_run {
            capabilities.push("run");
        }
        println!(
            "{}  [{}]  {}",
            target.id.uri,
            capabilities.join(" "),
            target.language_ids.join(",")
        );
    }
    Ok(())
}

async fn sync(server: BuildServer, json: bool, watch: Option<u64>) -> Result<()> {
    let details = collect_project_details(&server).await?;
    print_details(&details, json)?;

    let Some(period) = watch else {
        return Ok(());
    };
    let period = Duration::from_secs(period.max(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, disconnecting");
                return Ok(());
            }
            () = tokio::time::sleep(period) => {}
        }
        let details = collect_project_details(&server).await?;
        print_details(&details, json)?;
    }
}

fn print_details(details: &ProjectDetails, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(details)?);
        return Ok(());
    }
    println!(
        "{} targets, {} source entries, {} resource entries, {} dependency-source entries",
        details.targets.len(),
        details.sources.len(),
        details.resources.len(),
        details.dependency_sources.len()
    );
    for item in &details.sources {
        for source in &item.sources {
            println!("  {}  {}", item.target.uri, source.uri);
        }
    }
    Ok(())
}

async fn compile(server: BuildServer, json: bool, requested: Vec<String>) -> Result<()> {
    let targets: Vec<BuildTargetIdentifier> = if requested.is_empty() {
        server
            .workspace_build_targets()
            .await?
            .map(|result| result.targets)
            .unwrap_or_default()
            .into_iter()
            .filter(|target| target.capabilities.can_compile)
            .map(|target| target.id)
            .collect()
    } else {
        requested.into_iter().map(BuildTargetIdentifier::new).collect()
    };
    if targets.is_empty() {
        bail!("nothing to compile");
    }

    let params = CompileParams {
        targets,
        origin_id: None,
        arguments: Vec::new(),
    };
    let Some(result) = server.compile(&params).await? else {
        println!("no compile result within the timeout");
        return Ok(());
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("compile: {}", result.status_code.label());
    }
    if result.status_code != StatusCode::Ok {
        bail!("compile finished with status {}", result.status_code.label());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use tempfile::TempDir;

    use crate::{Cli, ConnectArgs, pick_source};
    use crucible_bsp::ConnectionSource;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    fn args_for(workspace: &std::path::Path) -> ConnectArgs {
        ConnectArgs {
            workspace: workspace.to_path_buf(),
            connection_file: None,
            generator: None,
            request_timeout: 30,
            json: false,
        }
    }

    #[tokio::test]
    async fn test_explicit_file_wins_over_discovery() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".bsp")).unwrap();
        std::fs::write(dir.path().join(".bsp/found.json"), "{}").unwrap();

        let mut args = args_for(dir.path());
        args.connection_file = Some(dir.path().join("elsewhere.json"));

        let source = pick_source(&args).await.unwrap();
        match source {
            ConnectionSource::File { path } => {
                assert_eq!(path, dir.path().join("elsewhere.json"));
            }
            ConnectionSource::Generator { .. } => panic!("expected a file source"),
        }
    }

    #[tokio::test]
    async fn test_named_generator_is_selected() {
        let dir = TempDir::new().unwrap();
        let mut args = args_for(dir.path());
        args.generator = Some("cargo-bsp".to_owned());

        let source = pick_source(&args).await.unwrap();
        match source {
            ConnectionSource::Generator { name, .. } => assert_eq!(name, "cargo-bsp"),
            ConnectionSource::File { .. } => panic!("expected a generator source"),
        }
    }

    #[tokio::test]
    async fn test_discovery_picks_the_first_file_in_order() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".bsp")).unwrap();
        std::fs::write(dir.path().join(".bsp/b.json"), "{}").unwrap();
        std::fs::write(dir.path().join(".bsp/a.json"), "{}").unwrap();

        let source = pick_source(&args_for(dir.path())).await.unwrap();
        match source {
            ConnectionSource::File { path } => assert_eq!(path, dir.path().join(".bsp/a.json")),
            ConnectionSource::Generator { .. } => panic!("expected a file source"),
        }
    }

    #[tokio::test]
    async fn test_empty_workspace_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = pick_source(&args_for(dir.path())).await.unwrap_err();
        assert!(err.to_string().contains("no connection files"));
    }
}
