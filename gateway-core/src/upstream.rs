//! Upstream Client (C1): one streamable-HTTP MCP session per upstream
//! [`ServerRecord`].

use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::model::{ForwardedHeaders, ServerRecord};

/// Protocol versions this gateway's `initialize` handshake accepts from an
/// upstream. An upstream that omits `protocolVersion` entirely is accepted
/// (older servers may not echo it back); one that names a version outside
/// this set fails the handshake with `IncompatibleProtocol`.
const ACCEPTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26"];

/// An open connection to a single upstream MCP server.
///
/// Built on `reqwest::Client`, matching this codebase's existing
/// `HttpTransport`: one client per upstream, bearer/API-key header
/// injection, and an explicit connect/initialize/call lifecycle rather
/// than an always-on background task.
pub struct UpstreamClient {
    server_id: String,
    url: String,
    auth_header: Option<String>,
    client: reqwest::Client,
    initialized: bool,
}

impl UpstreamClient {
    #[must_use]
    pub fn new(record: &ServerRecord) -> Self {
        Self {
            server_id: record.id.clone(),
            url: record.url.clone(),
            auth_header: record.credential.as_ref().map(crate::model::Credential::to_header_value),
            client: reqwest::Client::new(),
            initialized: false,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("content-type", "application/json").header("accept", "application/json");
        match &self.auth_header {
            Some(header) => builder.header("authorization", header.as_str()),
            None => builder,
        }
    }

    async fn call(&self, body: Value) -> Result<Value> {
        self.send(self.request(self.client.post(&self.url)), body).await
    }

    /// Post `body` via `builder` (already carrying this client's own
    /// content-type/accept/authorization headers) and parse the response.
    async fn send(&self, builder: reqwest::RequestBuilder, body: Value) -> Result<Value> {
        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable { server_id: self.server_id.clone(), reason: e.to_string() })?;

        if !response.status().is_success() {
            return Err(GatewayError::UpstreamUnavailable {
                server_id: self.server_id.clone(),
                reason: format!("upstream returned status {}", response.status()),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable { server_id: self.server_id.clone(), reason: format!("invalid JSON response: {e}") })
    }

    /// Perform the MCP `initialize` handshake. Must succeed before
    /// `list_tools` or `call_tool` are used.
    pub async fn initialize(&mut self) -> Result<()> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": "init",
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "mcp-gateway", "version": env!("CARGO_PKG_VERSION") },
            },
        });

        let response = self.call(request).await?;
        if let Some(error) = response.get("error") {
            return Err(GatewayError::HandshakeRejected {
                server_id: self.server_id.clone(),
                reason: error.get("message").and_then(Value::as_str).unwrap_or("initialize rejected").to_string(),
            });
        }

        if let Some(negotiated) = response.get("result").and_then(|r| r.get("protocolVersion")).and_then(Value::as_str) {
            if !ACCEPTED_PROTOCOL_VERSIONS.contains(&negotiated) {
                return Err(GatewayError::IncompatibleProtocol { server_id: self.server_id.clone(), version: negotiated.to_string() });
            }
        }

        self.initialized = true;
        Ok(())
    }

    /// List tools exposed by this upstream. Returns `(original_name,
    /// schema)` pairs in the order the upstream returned them.
    pub async fn list_tools(&self) -> Result<Vec<(String, Value)>> {
        if !self.initialized {
            return Err(GatewayError::Internal(format!("list_tools called before initialize for server '{}'", self.server_id)));
        }

        let request = json!({ "jsonrpc": "2.0", "id": "list", "method": "tools/list", "params": {} });
        let response = self.call(request).await?;

        if let Some(error) = response.get("error") {
            return Err(GatewayError::UpstreamError {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                message: error.get("message").and_then(Value::as_str).unwrap_or("tools/list failed").to_string(),
                data: error.get("data").cloned(),
            });
        }

        let tools = response.get("result").and_then(|r| r.get("tools")).and_then(Value::as_array).cloned().unwrap_or_default();

        Ok(tools
            .into_iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?.to_string();
                let schema = tool.get("inputSchema").cloned().unwrap_or(Value::Null);
                Some((name, schema))
            })
            .collect())
    }

    /// Invoke `tools/call` against this upstream with the original
    /// (un-prefixed) tool name, passing `arguments` through unmodified.
    /// `forwarded` carries identity headers observed on the downstream
    /// request; those present are injected alongside this server's own
    /// credential. Returns the raw `result` or `error` envelope from the
    /// upstream, for pass-through to the downstream caller.
    pub async fn call_tool(&self, original_name: &str, arguments: Value, id: Value, forwarded: &ForwardedHeaders) -> Result<Value> {
        if !self.initialized {
            return Err(GatewayError::Internal(format!("call_tool called before initialize for server '{}'", self.server_id)));
        }

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": original_name, "arguments": arguments },
        });

        let mut builder = self.request(self.client.post(&self.url));
        if let Some(session_id) = &forwarded.session_id {
            builder = builder.header("mcp-session-id", session_id.0.as_str());
        }

        self.send(builder, request).await
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Release the underlying HTTP session. Idempotent: `reqwest::Client`
    /// holds no server-side session state of its own (each request is an
    /// independent connection from the pool), so there is nothing to tear
    /// down beyond dropping this handle; calling it twice, or never, is
    /// equally safe.
    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Credential;

    fn record() -> ServerRecord {
        ServerRecord {
            id: "a".into(),
            url: "http://127.0.0.1:1/mcp".into(),
            hostname: "a.svc".into(),
            tool_prefix: "a_".into(),
            credential: Some(Credential::Bearer { token: "tok".into() }),
            enabled: true,
            cluster_hint: None,
        }
    }

    #[test]
    fn new_client_carries_auth_header() {
        let client = UpstreamClient::new(&record());
        assert_eq!(client.auth_header.as_deref(), Some("Bearer tok"));
        assert!(!client.is_initialized());
    }

    #[tokio::test]
    async fn list_tools_before_initialize_errors() {
        let client = UpstreamClient::new(&record());
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[tokio::test]
    async fn initialize_against_unreachable_server_reports_upstream_unavailable() {
        let mut client = UpstreamClient::new(&record());
        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }));
    }

    /// A server that negotiates a `protocolVersion` this gateway does not
    /// recognize fails the handshake with `IncompatibleProtocol` rather
    /// than being silently accepted.
    #[tokio::test]
    async fn initialize_rejects_incompatible_protocol_version() {
        use http_body_util::{BodyExt, Full};
        use hyper::body::Bytes;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else { return };
            let io = TokioIo::new(stream);
            let service = service_fn(|req: hyper::Request<hyper::body::Incoming>| async move {
                let bytes = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
                let request: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                let id = request.get("id").cloned().unwrap_or(Value::Null);
                let body = json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": { "protocolVersion": "1999-01-01", "capabilities": {} },
                });
                Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap()))))
            });
            let _ = http1::Builder::new().serve_connection(io, service).await;
        });

        let mut record = record();
        record.url = format!("http://{addr}/mcp");
        let mut client = UpstreamClient::new(&record);
        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err, GatewayError::IncompatibleProtocol { version, .. } if version == "1999-01-01"));
    }

    /// `call_tool` forwards a `SessionId` from [`ForwardedHeaders`] as the
    /// `mcp-session-id` header on the outbound request.
    #[tokio::test]
    async fn call_tool_forwards_session_id_header() {
        use crate::model::SessionId;
        use http_body_util::{BodyExt, Full};
        use hyper::body::Bytes;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;
        use std::sync::{Arc, Mutex};
        use tokio::net::TcpListener;

        let observed_session_id: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let observed = Arc::clone(&observed_session_id);
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else { return };
            let io = TokioIo::new(stream);
            let observed = Arc::clone(&observed);
            let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let observed = Arc::clone(&observed);
                async move {
                    *observed.lock().unwrap() = req.headers().get("mcp-session-id").and_then(|v| v.to_str().ok()).map(str::to_string);
                    let bytes = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
                    let request: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                    let id = request.get("id").cloned().unwrap_or(Value::Null);
                    let body = json!({ "jsonrpc": "2.0", "id": id, "result": { "content": [] } });
                    Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap()))))
                }
            });
            let _ = http1::Builder::new().serve_connection(io, service).await;
        });

        let mut record = record();
        record.url = format!("http://{addr}/mcp");
        let mut client = UpstreamClient::new(&record);
        client.initialized = true;

        let forwarded = ForwardedHeaders { session_id: Some(SessionId("sess-123".into())) };
        client.call_tool("echo", json!({}), json!(1), &forwarded).await.expect("call_tool succeeds");

        assert_eq!(observed_session_id.lock().unwrap().as_deref(), Some("sess-123"));
    }
}
