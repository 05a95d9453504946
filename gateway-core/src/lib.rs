//! `gateway-core` — the MCP gateway's hard core.
//!
//! This crate implements the Broker (a virtual MCP server that federates
//! tool catalogs from many upstream MCP servers) and the Router (an
//! external-processing gRPC service that rewrites in-flight downstream
//! requests so an HTTP proxy delivers each `tools/call` to the right
//! upstream). Both share a single, atomically-swapped [`snapshot::ConfigSnapshot`].
//!
//! Nothing in this crate touches argv, a terminal, or OS signals — that is
//! `gateway-cli`'s job. This crate is a library: config parsing, transport,
//! and concurrency are all directly testable here.

pub mod broker;
pub mod config;
pub mod error;
pub mod federation;
pub mod jsonrpc;
pub mod logging;
pub mod model;
pub mod router;
pub mod snapshot;
pub mod upstream;

/// Generated bindings for the external-processing gRPC contract consumed
/// by [`router::Router`].
#[allow(clippy::similar_names)]
#[allow(clippy::doc_markdown)]
pub mod proto {
    tonic::include_proto!("envoy.service.ext_proc.v3");
}

pub use broker::{register, Broker};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use federation::{FederationIndex, ToolNameCollision};
pub use model::{Credential, ForwardedHeaders, ServerRecord, SessionId, ToolEntry};
pub use router::Router;
pub use snapshot::{ConfigSnapshot, SnapshotStore};
