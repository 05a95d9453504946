//! Error types for the gateway core.

use thiserror::Error;

/// Result type used throughout `gateway-core`.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// The gateway's error taxonomy.
///
/// Each variant maps to exactly one row of the error handling design: most
/// are recovered locally (an upstream is disabled, a collision is logged, a
/// JSON-RPC error object is returned to the caller); only `ConfigInvalid`
/// and unexpected I/O failures are fatal to the process.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The configuration document could not be parsed or failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The upstream could not be reached at all (connection refused, DNS
    /// failure, timeout before any bytes were exchanged).
    #[error("upstream '{server_id}' unreachable: {reason}")]
    UpstreamUnavailable { server_id: String, reason: String },

    /// The upstream responded to the MCP `initialize` handshake with a
    /// rejection (non-2xx status or a JSON-RPC error object).
    #[error("upstream '{server_id}' rejected handshake: {reason}")]
    HandshakeRejected { server_id: String, reason: String },

    /// The upstream negotiated a protocol version this gateway does not
    /// accept.
    #[error("upstream '{server_id}' negotiated incompatible protocol version '{version}'")]
    IncompatibleProtocol { server_id: String, version: String },

    /// Two servers in the same snapshot produced the same exposed tool
    /// name; the later one (in snapshot order) was skipped.
    #[error("tool name collision on '{exposed_name}': kept '{winner}', skipped '{loser}'")]
    ToolNameCollision { exposed_name: String, winner: String, loser: String },

    /// A `tools/call` (or Router resolution) named a tool absent from the
    /// current federation index.
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    /// A JSON-RPC batch resolved to more than one upstream server.
    #[error("batch spans multiple servers")]
    HeterogeneousBatch,

    /// The upstream's own JSON-RPC error object, forwarded verbatim.
    #[error("upstream error {code}: {message}")]
    UpstreamError { code: i64, message: String, data: Option<serde_json::Value> },

    /// A request-scoped deadline elapsed before the upstream responded.
    #[error("gateway timeout")]
    GatewayTimeout,

    /// Any failure that does not fit the taxonomy above.
    #[error("internal error: {0}")]
    Internal(String),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failure.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Transport-level HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O failure (config file reads, socket binds).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The JSON-RPC 2.0 error code this error should be reported as, when
    /// it is surfaced to a downstream MCP client or ext-proc caller.
    #[must_use]
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            GatewayError::UnknownTool(_) => -32601,
            GatewayError::HeterogeneousBatch => -32600,
            GatewayError::UpstreamError { code, .. } => *code,
            GatewayError::GatewayTimeout => -32000,
            _ => -32603,
        }
    }
}
