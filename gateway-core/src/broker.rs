//! Broker (C3): a virtual MCP server that federates tools from every
//! registered upstream and answers `initialize` / `tools/list` /
//! `tools/call` on a single `/mcp` endpoint.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};

use crate::error::GatewayError;
use crate::model::{ForwardedHeaders, ServerRecord, SessionId};
use crate::snapshot::{ConfigSnapshot, SnapshotStore};
use crate::upstream::UpstreamClient;

/// Maximum number of upstreams registered concurrently during a
/// reconfiguration pass.
const REGISTRATION_CONCURRENCY: usize = 8;

/// Request-scoped deadline for a downstream `tools/call`, covering both the
/// handshake and the call itself (§5 Cancellation). A deadline that fires
/// is reported as `GatewayTimeout` (-32000) with the original request id,
/// never left to hang the downstream caller.
const UPSTREAM_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Registers upstreams against a new set of [`ServerRecord`]s and
/// publishes the resulting [`ConfigSnapshot`].
///
/// `previous` is the outgoing snapshot. Records whose `(url, credential,
/// tool_prefix)` are unchanged from their entry in `previous` (and which
/// were enabled there) are carried over as-is: their already-discovered
/// tools are reused and no new Upstream Client connects to re-run
/// discovery. Only added or changed records pay for a fresh `discover_one`
/// pass — this is what lets an in-flight call against an unrelated server
/// keep working across a reconfiguration without interruption (§3
/// Lifecycles).
///
/// Per-server failures (unreachable upstream, rejected handshake) disable
/// that record for this snapshot rather than aborting the whole pass; they
/// are retried on the *next* reconfiguration event only — there is no
/// internal background retry loop.
pub async fn register(servers: Vec<ServerRecord>, previous: &ConfigSnapshot) -> ConfigSnapshot {
    let semaphore = Arc::new(Semaphore::new(REGISTRATION_CONCURRENCY));
    let mut discovered = HashMap::new();
    let mut handles = Vec::new();

    for server in servers.iter().cloned() {
        if let Some(carried) = carry_forward(previous, &server) {
            discovered.insert(server.id.clone(), carried);
            continue;
        }
        let permit = Arc::clone(&semaphore);
        handles.push((server.id.clone(), tokio::spawn(async move {
            let _permit = permit.acquire_owned().await.expect("semaphore never closed");
            discover_one(&server).await
        })));
    }

    for (server_id, handle) in handles {
        match handle.await {
            Ok(Some(tools)) => {
                discovered.insert(server_id, tools);
            }
            Ok(None) => {
                tracing::warn!(server_id = %server_id, "upstream registration failed, disabling for this snapshot");
            }
            Err(join_error) => {
                tracing::error!(server_id = %server_id, error = %join_error, "registration task panicked");
            }
        }
    }

    let mut effective = servers;
    for server in &mut effective {
        if server.enabled && !discovered.contains_key(&server.id) {
            server.enabled = false;
        }
    }

    let (snapshot, collisions) = ConfigSnapshot::build(effective, &discovered);
    for collision in collisions {
        tracing::warn!(
            exposed_name = %collision.exposed_name,
            winner = %collision.winner_server_id,
            loser = %collision.loser_server_id,
            "dropped colliding tool during registration"
        );
    }
    snapshot
}

/// If `server` is connection-equivalent to (and was enabled in) its entry
/// in `previous`, return that server's already-discovered `(original_name,
/// schema)` pairs so the caller can skip re-discovery entirely.
fn carry_forward(previous: &ConfigSnapshot, server: &ServerRecord) -> Option<Vec<(String, Value)>> {
    let prior = previous.server(&server.id)?;
    if !prior.enabled || !prior.connection_equivalent(server) {
        return None;
    }
    Some(
        previous
            .index
            .list()
            .iter()
            .filter(|entry| entry.server_id == server.id)
            .map(|entry| (entry.original_name.clone(), entry.schema.clone()))
            .collect(),
    )
}

async fn discover_one(server: &ServerRecord) -> Option<Vec<(String, Value)>> {
    if !server.enabled {
        return None;
    }
    let mut client = UpstreamClient::new(server);
    if let Err(e) = client.initialize().await {
        tracing::warn!(server_id = %server.id, error = %e, "upstream initialize failed");
        return None;
    }
    match client.list_tools().await {
        Ok(tools) => Some(tools),
        Err(e) => {
            tracing::warn!(server_id = %server.id, error = %e, "upstream tools/list failed");
            None
        }
    }
}

/// The `/mcp` HTTP listener. Built on `hyper`'s HTTP/1.1 server, matching
/// this codebase's existing proxy server: one accept loop, one task per
/// connection, a `service_fn` that parses and dispatches JSON-RPC bodies.
pub struct Broker {
    store: Arc<SnapshotStore>,
    bind_addr: String,
    port: u16,
}

impl Broker {
    #[must_use]
    pub fn new(store: Arc<SnapshotStore>, bind_addr: String, port: u16) -> Self {
        Self { store, bind_addr, port }
    }

    /// Bind and serve until the process is terminated. Each accepted
    /// connection is handled on its own task.
    pub async fn serve(self) -> crate::error::Result<()> {
        let (_tx, rx) = broadcast::channel(1);
        self.serve_with_shutdown(rx).await
    }

    /// Bind and serve until `shutdown` fires, matching this codebase's
    /// broadcast-channel shutdown idiom. Connections already accepted are
    /// left to finish on their own; no new connections are accepted once
    /// the signal arrives.
    pub async fn serve_with_shutdown(self, mut shutdown: broadcast::Receiver<()>) -> crate::error::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid bind address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "broker listening");

        let store = self.store;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let store = Arc::clone(&store);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| handle_request(req, Arc::clone(&store)));
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            tracing::debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("broker shutdown signal received, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    store: Arc<SnapshotStore>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::POST {
        let mut response = Response::new(Full::new(Bytes::from("method not allowed, use POST")));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    let forwarded = ForwardedHeaders {
        session_id: req.headers().get("mcp-session-id").and_then(|v| v.to_str().ok()).map(|s| SessionId(s.to_string())),
    };

    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let request: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => return Ok(json_response(StatusCode::BAD_REQUEST, parse_error(&e))),
    };

    let snapshot = store.load();
    let response_body = dispatch(&request, &snapshot, &forwarded).await;
    Ok(json_response(StatusCode::OK, response_body))
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap_or_default())));
    *response.status_mut() = status;
    response.headers_mut().insert(hyper::header::CONTENT_TYPE, "application/json".parse().unwrap());
    response
}

fn parse_error(e: &serde_json::Error) -> Value {
    json!({ "jsonrpc": "2.0", "id": null, "error": { "code": -32700, "message": "parse error", "data": { "detail": e.to_string() } } })
}

async fn dispatch(request: &Value, snapshot: &ConfigSnapshot, forwarded: &ForwardedHeaders) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default();

    match method {
        "initialize" => success(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "mcp-gateway", "version": env!("CARGO_PKG_VERSION") },
            }),
        ),
        "tools/list" => {
            let tools: Vec<Value> = snapshot
                .index
                .list()
                .iter()
                .map(|entry| json!({ "name": entry.exposed_name, "inputSchema": entry.schema }))
                .collect();
            success(id, json!({ "tools": tools }))
        }
        "tools/call" => handle_tool_call(request, id, snapshot, forwarded).await,
        other => failure(id, -32601, format!("method not found: {other}"), None),
    }
}

async fn handle_tool_call(request: &Value, id: Value, snapshot: &ConfigSnapshot, forwarded: &ForwardedHeaders) -> Value {
    handle_tool_call_with_deadline(request, id, snapshot, forwarded, UPSTREAM_CALL_TIMEOUT).await
}

async fn handle_tool_call_with_deadline(
    request: &Value,
    id: Value,
    snapshot: &ConfigSnapshot,
    forwarded: &ForwardedHeaders,
    deadline: Duration,
) -> Value {
    let Some(exposed_name) = request.get("params").and_then(|p| p.get("name")).and_then(Value::as_str) else {
        return failure(id, -32602, "missing 'name' parameter".to_string(), None);
    };
    let arguments = request.get("params").and_then(|p| p.get("arguments")).cloned().unwrap_or_else(|| json!({}));

    let Some((server_id, original_name)) = snapshot.index.resolve(exposed_name) else {
        return failure(id, -32601, format!("unknown tool '{exposed_name}'"), None);
    };
    let Some(server) = snapshot.server(server_id) else {
        return failure(id, -32603, format!("server '{server_id}' not found in snapshot"), None);
    };

    let mut client = UpstreamClient::new(server);
    match tokio::time::timeout(deadline, client.initialize()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return failure(id, e.jsonrpc_code(), e.to_string(), None),
        Err(_) => return timeout_failure(id, server_id),
    }

    match tokio::time::timeout(deadline, client.call_tool(original_name, arguments, id.clone(), forwarded)).await {
        Ok(Ok(upstream_response)) => {
            if let Some(error) = upstream_response.get("error") {
                error.clone()
            } else {
                success(id, upstream_response.get("result").cloned().unwrap_or(Value::Null))
            }
        }
        Ok(Err(e)) => failure(id, e.jsonrpc_code(), e.to_string(), None),
        Err(_) => timeout_failure(id, server_id),
    }
}

fn timeout_failure(id: Value, server_id: &str) -> Value {
    tracing::warn!(server_id, "upstream call exceeded deadline, reporting gateway timeout");
    failure(id, GatewayError::GatewayTimeout.jsonrpc_code(), GatewayError::GatewayTimeout.to_string(), None)
}

fn success(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn failure(id: Value, code: i64, message: String, data: Option<Value>) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message, "data": data } })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_snapshot() -> ConfigSnapshot {
        ConfigSnapshot::empty()
    }

    fn server(id: &str, prefix: &str) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            url: format!("http://{id}.svc/mcp"),
            hostname: format!("{id}.svc"),
            tool_prefix: prefix.to_string(),
            credential: None,
            enabled: true,
            cluster_hint: None,
        }
    }

    /// A record whose `(url, credential, tool_prefix)` is unchanged from
    /// the outgoing snapshot is carried forward with its previously
    /// discovered tools, not marked for rediscovery.
    #[test]
    fn carry_forward_reuses_tools_for_an_unchanged_record() {
        let mut discovered = HashMap::new();
        discovered.insert("A".to_string(), vec![("echo".to_string(), json!({}))]);
        let (previous, _) = ConfigSnapshot::build(vec![server("A", "a_")], &discovered);

        let carried = carry_forward(&previous, &server("A", "a_")).expect("unchanged record is carried forward");
        assert_eq!(carried, vec![("echo".to_string(), json!({}))]);
    }

    /// A record whose `tool_prefix` (or url, or credential) changed from
    /// the outgoing snapshot is not carried forward — it must be
    /// rediscovered.
    #[test]
    fn carry_forward_refuses_a_changed_record() {
        let mut discovered = HashMap::new();
        discovered.insert("A".to_string(), vec![("echo".to_string(), json!({}))]);
        let (previous, _) = ConfigSnapshot::build(vec![server("A", "a_")], &discovered);

        assert!(carry_forward(&previous, &server("A", "changed_")).is_none());
    }

    /// A record absent from the outgoing snapshot (newly added) is never
    /// carried forward.
    #[test]
    fn carry_forward_refuses_an_unknown_record() {
        assert!(carry_forward(&empty_snapshot(), &server("A", "a_")).is_none());
    }

    #[tokio::test]
    async fn initialize_returns_server_info() {
        let request = json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" });
        let response = dispatch(&request, &empty_snapshot(), &ForwardedHeaders::default()).await;
        assert_eq!(response["result"]["serverInfo"]["name"], "mcp-gateway");
    }

    #[tokio::test]
    async fn tools_list_on_empty_snapshot_is_empty() {
        let request = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });
        let response = dispatch(&request, &empty_snapshot(), &ForwardedHeaders::default()).await;
        assert_eq!(response["result"]["tools"], json!([]));
    }

    #[tokio::test]
    async fn tools_call_with_unknown_name_is_method_error() {
        let request = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": { "name": "nope" } });
        let response = dispatch(&request, &empty_snapshot(), &ForwardedHeaders::default()).await;
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn unknown_method_reports_not_found() {
        let request = json!({ "jsonrpc": "2.0", "id": 1, "method": "prompts/list" });
        let response = dispatch(&request, &empty_snapshot(), &ForwardedHeaders::default()).await;
        assert_eq!(response["error"]["code"], -32601);
    }

    /// An upstream that never answers within the deadline is reported to
    /// the downstream caller as `-32000 Gateway timeout`, not left hanging.
    #[tokio::test]
    async fn tools_call_exceeding_deadline_is_gateway_timeout() {
        use http_body_util::{BodyExt, Full};
        use hyper::body::Bytes;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        let _ = req.into_body().collect().await;
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(Vec::new()))))
                    });
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        let server = ServerRecord {
            id: "slow".into(),
            url: format!("http://{addr}/mcp"),
            hostname: addr.to_string(),
            tool_prefix: "s_".into(),
            credential: None,
            enabled: true,
            cluster_hint: None,
        };
        let mut discovered = HashMap::new();
        discovered.insert("slow".to_string(), vec![("echo".to_string(), json!({}))]);
        let (snapshot, _) = ConfigSnapshot::build(vec![server], &discovered);

        let request = json!({ "jsonrpc": "2.0", "id": 7, "method": "tools/call", "params": { "name": "s_echo" } });
        let response =
            handle_tool_call_with_deadline(&request, json!(7), &snapshot, &ForwardedHeaders::default(), Duration::from_millis(50)).await;
        assert_eq!(response["error"]["code"], -32000);
        assert_eq!(response["id"], 7);
    }
}
