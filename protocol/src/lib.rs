//! Wire-level types for the Build Server Protocol.
//!
//! This crate contains the JSON-RPC envelope, the typed subset of BSP
//! requests and notifications the connection layer speaks, and the
//! connection-descriptor format discovered under `.bsp/`. No IO, no async.

pub mod bsp;
pub mod descriptor;
pub mod rpc;
pub mod uri;

pub use descriptor::{ConnectionDetails, DescriptorError};
pub use rpc::{Incoming, Notification, Request, ResponseError};
