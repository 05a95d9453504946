//! Configuration document schema.
//!
//! Parsing from an in-memory string is a pure function (`from_yaml_str`);
//! [`GatewayConfig::from_file`] is the one-shot async loader used at
//! startup. Watching the file for changes afterward is an external
//! collaborator (`gateway-cli::config_watch`).

use serde::Deserialize;

use crate::error::{GatewayError, Result};
use crate::model::{Credential, ServerRecord};

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8080
}

fn default_router_bind_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Authentication block for a `servers[]` entry. Accepted spellings match
/// the exact strings named in §6: `Bearer` and `APIKEY`.
#[derive(Debug, Clone, Deserialize)]
pub enum AuthType {
    Bearer,
    #[serde(rename = "APIKEY")]
    ApiKey,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    pub token: Option<String>,
    /// Reserved for future schemes; never read by the core today.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// One `servers[]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub tool_prefix: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cluster_hint: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

impl ServerConfigEntry {
    /// Build the runtime [`ServerRecord`] for this entry.
    pub fn to_server_record(&self) -> Result<ServerRecord> {
        let hostname = match &self.hostname {
            Some(h) => h.clone(),
            None => url::Url::parse(&self.url)
                .ok()
                .and_then(|u| u.host_str().map(ToString::to_string))
                .ok_or_else(|| GatewayError::ConfigInvalid(format!("server '{}' has no hostname and its url has no host component", self.name)))?,
        };

        let credential = match &self.auth {
            Some(auth) => {
                let token = auth.token.clone().ok_or_else(|| {
                    GatewayError::ConfigInvalid(format!("server '{}' declares auth but no token", self.name))
                })?;
                Some(match auth.auth_type {
                    AuthType::Bearer => Credential::Bearer { token },
                    AuthType::ApiKey => Credential::ApiKey { token },
                })
            }
            None => None,
        };

        Ok(ServerRecord {
            id: self.name.clone(),
            url: self.url.clone(),
            hostname,
            tool_prefix: self.tool_prefix.clone(),
            credential,
            enabled: self.enabled,
            cluster_hint: self.cluster_hint.clone(),
        })
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfigEntry>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_router_bind_addr")]
    pub router_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            port: default_port(),
            bind_addr: default_bind_addr(),
            router_bind_addr: default_router_bind_addr(),
            log_level: default_log_level(),
        }
    }
}

impl GatewayConfig {
    /// Parse a YAML document already read into memory. Pure function, no
    /// IO — file reading and watching belong to the CLI layer.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the configuration document at `path`. The one-shot
    /// loader used at startup; `gateway-cli::config_watch` re-reads the
    /// same file on every file-system event it observes afterward.
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::ConfigInvalid(format!("cannot read config file {}: {e}", path.display())))?;
        Self::from_yaml_str(&contents)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(GatewayError::ConfigInvalid("server name must not be empty".into()));
            }
            if !seen.insert(server.name.clone()) {
                return Err(GatewayError::ConfigInvalid(format!("duplicate server name '{}'", server.name)));
            }
            url::Url::parse(&server.url)
                .map_err(|e| GatewayError::ConfigInvalid(format!("server '{}' has invalid url: {e}", server.name)))?;
        }
        Ok(())
    }

    /// Build the ordered list of [`ServerRecord`]s this document describes.
    /// Order is preserved — it is what makes collision resolution
    /// deterministic.
    pub fn server_records(&self) -> Result<Vec<ServerRecord>> {
        self.servers.iter().map(ServerConfigEntry::to_server_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
servers:
  - name: a
    url: "http://a.svc/mcp"
    toolPrefix: "a_"
  - name: b
    url: "http://b.svc/mcp"
    toolPrefix: "b_"
    enabled: false
port: 9090
"#;
        let config = GatewayConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.port, 9090);
        assert!(config.servers[0].enabled);
        assert!(!config.servers[1].enabled);
    }

    #[test]
    fn defaults_hostname_from_url() {
        let yaml = r#"
servers:
  - name: a
    url: "http://a.svc:8080/mcp"
"#;
        let config = GatewayConfig::from_yaml_str(yaml).unwrap();
        let record = config.servers[0].to_server_record().unwrap();
        assert_eq!(record.hostname, "a.svc");
    }

    #[test]
    fn rejects_duplicate_server_names() {
        let yaml = r#"
servers:
  - name: a
    url: "http://a.svc/mcp"
  - name: a
    url: "http://b.svc/mcp"
"#;
        assert!(GatewayConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn auth_bearer_round_trips_to_header() {
        let yaml = r#"
servers:
  - name: a
    url: "http://a.svc/mcp"
    auth:
      type: Bearer
      token: "secret123"
"#;
        let config = GatewayConfig::from_yaml_str(yaml).unwrap();
        let record = config.servers[0].to_server_record().unwrap();
        assert_eq!(record.credential.unwrap().to_header_value(), "Bearer secret123");
    }
}
