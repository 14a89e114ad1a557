//! Build Server Protocol client: connection lifecycle and workspace sync.

pub mod client;
pub mod codec;
pub mod connection;
pub mod generator;
pub mod settings;
pub mod sources;
pub mod sync;

pub(crate) mod channel;
pub(crate) mod launch;
pub(crate) mod proxy;

#[cfg(test)]
pub(crate) mod testkit;

pub use client::{BuildClient, LoggingClient};
pub use connection::{
    ActionFailure, BSP_VERSION, ConnectError, Connection, PersistedConnection, TeardownError,
};
pub use generator::{CommandGenerator, DetailsGenerator, GeneratorRegistry, builtin_generators};
pub use launch::LaunchError;
pub use proxy::{BuildServer, RequestError};
pub use settings::{DEFAULT_REQUEST_TIMEOUT_SECS, RequestTimeout};
pub use sources::{ConnectionSource, LocatedDetails, SourceError, find_connection_files};
pub use sync::{ProjectDetails, collect_project_details};
