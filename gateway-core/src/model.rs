//! Core data model: server identity, discovered tools, and sessions.

use serde::{Deserialize, Serialize};

/// Authentication scheme carried by a [`ServerRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Credential {
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// `Authorization: APIKEY <token>` (scheme name carried verbatim).
    #[serde(rename = "APIKEY")]
    ApiKey { token: String },
}

impl Credential {
    /// Render this credential as the value of an `Authorization` header.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        match self {
            Credential::Bearer { token } => format!("Bearer {token}"),
            Credential::ApiKey { token } => format!("APIKEY {token}"),
        }
    }
}

impl std::fmt::Debug for CredentialRedacted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(Credential::Bearer { .. }) => write!(f, "Bearer(****)"),
            Some(Credential::ApiKey { .. }) => write!(f, "ApiKey(****)"),
            None => write!(f, "none"),
        }
    }
}

/// Wrapper used only to print a redacted `Debug` form of an optional
/// credential in logs.
pub struct CredentialRedacted<'a>(pub &'a Option<Credential>);

/// Identity of a registered upstream MCP server.
///
/// `hostname` and `clusterHint` are both carried through to the Router
/// untouched; which one (or both) the external proxy actually uses for
/// cluster selection is deployment-specific and out of scope for the core
/// (see the open question in the design notes).
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Stable identifier, derived from the configured `name`.
    pub id: String,
    /// Absolute MCP endpoint (scheme, host, path).
    pub url: String,
    /// Public hostname by which downstream traffic arrives.
    pub hostname: String,
    /// Prepended to every tool name from this server; empty means no
    /// prefix.
    pub tool_prefix: String,
    /// Optional bearer/API-key credential.
    pub credential: Option<Credential>,
    /// Whether this record participates in the current snapshot.
    pub enabled: bool,
    /// Opaque string understood by the external proxy as a routing
    /// destination.
    pub cluster_hint: Option<String>,
}

impl std::fmt::Debug for ServerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRecord")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("hostname", &self.hostname)
            .field("tool_prefix", &self.tool_prefix)
            .field("credential", &CredentialRedacted(&self.credential))
            .field("enabled", &self.enabled)
            .field("cluster_hint", &self.cluster_hint)
            .finish()
    }
}

impl ServerRecord {
    /// The MCP endpoint path component of `url`, e.g. `/mcp`.
    #[must_use]
    pub fn path(&self) -> String {
        url::Url::parse(&self.url).map(|u| u.path().to_string()).unwrap_or_else(|_| "/".to_string())
    }

    /// Compute the exposed name this server's `original_name` tool would
    /// receive under this record's prefix.
    #[must_use]
    pub fn exposed_name(&self, original_name: &str) -> String {
        if self.tool_prefix.is_empty() {
            original_name.to_string()
        } else {
            format!("{}{}", self.tool_prefix, original_name)
        }
    }

    /// Whether two records are equivalent for the purpose of "carry the
    /// existing Upstream Client over on reconfiguration" (§3 Lifecycles):
    /// same `url`, `credential`, and `tool_prefix`.
    #[must_use]
    pub fn connection_equivalent(&self, other: &ServerRecord) -> bool {
        self.url == other.url && self.credential == other.credential && self.tool_prefix == other.tool_prefix
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Credential::Bearer { token: a }, Credential::Bearer { token: b })
            | (Credential::ApiKey { token: a }, Credential::ApiKey { token: b }) => a == b,
            _ => false,
        }
    }
}
impl Eq for Credential {}

/// A tool discovered from an upstream server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    /// The name presented to downstream clients
    /// (`tool_prefix + original_name`, or just `original_name` when the
    /// prefix is empty).
    pub exposed_name: String,
    /// The name as declared by the upstream.
    pub original_name: String,
    /// The owning `ServerRecord.id`.
    pub server_id: String,
    /// Opaque JSON schema, passed through unmodified.
    pub schema: serde_json::Value,
}

/// Opaque MCP session identifier observed in the `mcp-session-id` header.
///
/// The core keeps no per-session state beyond this optional routing
/// affinity hint; it is never required to resolve a `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity headers observed on a downstream request, forwarded to the
/// upstream alongside its own credential: "Credentials and optionally
/// forwarded identity headers are injected" (C1 `callTool` contract).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedHeaders {
    /// The downstream's `mcp-session-id`, if present.
    pub session_id: Option<SessionId>,
}
