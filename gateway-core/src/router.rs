//! Router / External Processor (C5): the ext-proc gRPC service that drives
//! the proxy's request rewriting.
//!
//! One `process` call is one bidirectional stream. The state machine from
//! §4.5 is tracked in locals owned exclusively by the task spawned for that
//! stream (see [`Router::run_stream`]), so no locking is needed across
//! events within a single stream. The only state shared across streams is
//! the [`SnapshotStore`] handle, loaded once per `RequestBody`
//! end-of-stream decision, and the session-affinity table.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::jsonrpc::{self, Classification};
use crate::model::SessionId;
use crate::proto::body_mutation::Mutation as BodyMutationKind;
use crate::proto::common_response::ResponseStatus;
use crate::proto::external_processor_server::ExternalProcessor;
use crate::proto::processing_request::Request as ReqEvent;
use crate::proto::processing_response::Response as RespEvent;
use crate::proto::{
    BodyMutation, CommonResponse, HeaderMutation, HeaderValue, HeaderValueOption, HttpStatus,
    ImmediateResponse, ProcessingRequest, ProcessingResponse,
};
use crate::snapshot::{ConfigSnapshot, SnapshotStore};

const AUTHORITY_HEADER: &str = ":authority";
const PATH_HEADER: &str = ":path";
const METHOD_HEADER: &str = ":method";
const CONTENT_LENGTH_HEADER: &str = "content-length";
const AUTHORIZATION_HEADER: &str = "authorization";
const SESSION_ID_HEADER: &str = "mcp-session-id";
const SERVERNAME_HEADER: &str = "x-mcp-servername";
const TOOLNAME_HEADER: &str = "x-mcp-toolname";
const METHOD_DIAG_HEADER: &str = "x-mcp-method";

/// One resolved element of a (possibly batched) JSON-RPC request: the
/// upstream it targets, or a reason it cannot be routed.
enum Resolution {
    Routable { server_id: String, original_name: String },
    Unresolved { id: Option<serde_json::Value>, exposed_name: String },
    NotAToolCall,
}

/// The ext-proc gRPC service. Holds the shared snapshot handle and a
/// best-effort session-affinity table used when a stream's headers alone
/// (no body) must be routed — see [`Router::route_header_only`].
///
/// Cheap to clone: every field is an `Arc` or a small owned value. Each
/// `process` call clones the router and spawns the per-stream loop on its
/// own task so the gRPC call returns the response stream immediately
/// instead of blocking the whole call on the incoming stream draining.
#[derive(Clone)]
pub struct Router {
    store: Arc<SnapshotStore>,
    mcp_path: Arc<str>,
    session_affinity: Arc<Mutex<HashMap<SessionId, String>>>,
}

impl Router {
    #[must_use]
    pub fn new(store: Arc<SnapshotStore>, mcp_path: String) -> Self {
        Self { store, mcp_path: Arc::from(mcp_path), session_affinity: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn is_mcp_path(&self, path: &str) -> bool {
        path.split('?').next().unwrap_or(path) == self.mcp_path.as_ref()
    }
}

/// Headers captured from `RequestHeaders` while deciding how to handle the
/// rest of the stream (§4.5 `Init` state).
#[derive(Default, Clone)]
struct CapturedHeaders {
    authority: Option<String>,
    path: Option<String>,
    method: Option<String>,
    session_id: Option<SessionId>,
    authorization: Option<String>,
}

fn capture_headers(headers: &crate::proto::HttpHeaders) -> CapturedHeaders {
    let mut captured = CapturedHeaders::default();
    for header in &headers.headers {
        match header.key.to_ascii_lowercase().as_str() {
            AUTHORITY_HEADER => captured.authority = Some(header.value.clone()),
            PATH_HEADER => captured.path = Some(header.value.clone()),
            METHOD_HEADER => captured.method = Some(header.value.clone()),
            SESSION_ID_HEADER => captured.session_id = Some(SessionId(header.value.clone())),
            AUTHORIZATION_HEADER => captured.authorization = Some(header.value.clone()),
            _ => {}
        }
    }
    captured
}

#[tonic::async_trait]
impl ExternalProcessor for Router {
    type ProcessStream = ReceiverStream<Result<ProcessingResponse, Status>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let incoming = request.into_inner();
        let (tx, rx) = mpsc::channel(16);

        let router = self.clone();
        tokio::spawn(async move { router.run_stream(incoming, tx).await });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

impl Router {
    /// Drive one ext-proc stream end to end, per the state machine in
    /// §4.5: buffer the request body until end-of-stream, make exactly one
    /// routing decision, then pass everything else through unchanged.
    async fn run_stream(&self, mut incoming: Streaming<ProcessingRequest>, tx: mpsc::Sender<Result<ProcessingResponse, Status>>) {
        let mut captured = CapturedHeaders::default();
        let mut body_buffer: Vec<u8> = Vec::new();
        let mut pass_through = false;

        loop {
            let event = match incoming.message().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(status) => {
                    let _ = tx.send(Err(status)).await;
                    break;
                }
            };
            let Some(event) = event.request else { continue };

            let response = match event {
                ReqEvent::RequestHeaders(headers) => {
                    if pass_through {
                        continue_response(RespEvent::RequestHeaders)
                    } else {
                        captured = capture_headers(&headers);
                        let is_mcp = captured.path.as_deref().is_some_and(|p| self.is_mcp_path(p));
                        let has_body = captured.method.as_deref() != Some("GET");

                        if !is_mcp {
                            pass_through = true;
                            continue_response(RespEvent::RequestHeaders)
                        } else if has_body {
                            // AwaitBody: wait for the end-of-stream body chunk
                            // before deciding anything.
                            continue_response(RespEvent::RequestHeaders)
                        } else {
                            // HeaderOnly: no body is coming (e.g. the SSE
                            // session-establishment GET), so route on session
                            // affinity alone if we have it.
                            pass_through = true;
                            self.route_header_only(&captured).await
                        }
                    }
                }
                ReqEvent::RequestBody(chunk) => {
                    if pass_through {
                        continue_response(RespEvent::RequestBody)
                    } else {
                        body_buffer.extend_from_slice(&chunk.body);
                        if chunk.end_of_stream {
                            pass_through = true;
                            self.route_body(&captured, &body_buffer).await
                        } else {
                            continue_response(RespEvent::RequestBody)
                        }
                    }
                }
                ReqEvent::ResponseHeaders(_) => continue_response(RespEvent::ResponseHeaders),
                ReqEvent::ResponseBody(_) => continue_response(RespEvent::ResponseBody),
            };

            if tx.send(Ok(response)).await.is_err() {
                break;
            }
        }
    }

    /// `HeaderOnly` path: no body will follow this `RequestHeaders` event.
    /// Route using the session-affinity hint if one is on file; otherwise
    /// there is nothing to rewrite and the proxy is told to continue as-is.
    async fn route_header_only(&self, captured: &CapturedHeaders) -> ProcessingResponse {
        let Some(session_id) = &captured.session_id else {
            return continue_response(RespEvent::RequestHeaders);
        };
        let server_id = { self.session_affinity.lock().await.get(session_id).cloned() };
        let Some(server_id) = server_id else {
            return continue_response(RespEvent::RequestHeaders);
        };

        let snapshot = self.store.load();
        let Some(server) = snapshot.server(&server_id).filter(|s| s.enabled) else {
            return continue_response(RespEvent::RequestHeaders);
        };

        let mutation = header_mutation_for(server, None, None, captured);
        ProcessingResponse {
            response: Some(RespEvent::RequestHeaders(CommonResponse {
                status: ResponseStatus::Continue as i32,
                header_mutation: Some(mutation),
                body_mutation: None,
            })),
        }
    }

    /// `AwaitBody` end-of-stream: classify, resolve every `tools/call`
    /// element against the current snapshot, and either rewrite the body
    /// and emit routing header mutations, reject unresolved/heterogeneous
    /// batches with an immediate JSON-RPC error, or pass through untouched.
    async fn route_body(&self, captured: &CapturedHeaders, body: &[u8]) -> ProcessingResponse {
        match jsonrpc::classify(body) {
            Classification::NotJsonRpc | Classification::ParseError => return continue_response(RespEvent::RequestBody),
            Classification::Single(_) | Classification::Batch(_) => {}
        }

        let snapshot = self.store.load();
        let values: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return continue_response(RespEvent::RequestBody),
        };
        let elements: Vec<&serde_json::Value> = match &values {
            serde_json::Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };

        let resolutions: Vec<Resolution> = elements.iter().map(|element| self.resolve_element(element, &snapshot)).collect();

        // 2c: an unresolved tool in a message carrying an `id` is answered
        // immediately with -32601, without inspecting the rest of the batch.
        for resolution in &resolutions {
            if let Resolution::Unresolved { id: Some(id), exposed_name } = resolution {
                return immediate_jsonrpc_error(id.clone(), -32601, format!("Method not found: tool {exposed_name}"));
            }
        }

        let server_ids: Vec<&str> = resolutions
            .iter()
            .filter_map(|r| match r {
                Resolution::Routable { server_id, .. } => Some(server_id.as_str()),
                _ => None,
            })
            .collect();

        if server_ids.is_empty() {
            // every element was either not a tool call or an unresolved
            // notification (no id) — nothing to route, pass through.
            return continue_response(RespEvent::RequestBody);
        }

        let first = server_ids[0];
        if server_ids.iter().any(|id| *id != first) {
            let id = elements.iter().find_map(|e| e.get("id").cloned()).unwrap_or(serde_json::Value::Null);
            return immediate_jsonrpc_error(id, -32600, "Invalid Request: batch spans multiple servers".to_string());
        }

        let Some(server) = snapshot.server(first).filter(|s| s.enabled) else {
            let id = elements.iter().find_map(|e| e.get("id").cloned()).unwrap_or(serde_json::Value::Null);
            return immediate_jsonrpc_error(id, -32603, format!("server '{first}' not found in snapshot"));
        };

        if let Some(session_id) = &captured.session_id {
            self.session_affinity.lock().await.insert(session_id.clone(), server.id.clone());
        }

        let index = snapshot.index.clone();
        let rewritten = jsonrpc::rewrite_tool_call(body, move |exposed_name| index.resolve(exposed_name).map(|(_, original)| original.to_string()));
        let Ok(rewritten) = rewritten else { return continue_response(RespEvent::RequestBody) };

        let (last_tool, last_method) = elements
            .iter()
            .zip(resolutions.iter())
            .rev()
            .find_map(|(element, r)| match r {
                Resolution::Routable { original_name, .. } => {
                    Some((original_name.clone(), element.get("method").and_then(serde_json::Value::as_str).unwrap_or_default().to_string()))
                }
                _ => None,
            })
            .unwrap_or_default();

        let mutation = header_mutation_for(server, Some(last_tool.as_str()), Some(last_method.as_str()), captured);
        ProcessingResponse {
            response: Some(RespEvent::RequestBody(CommonResponse {
                status: ResponseStatus::Continue as i32,
                header_mutation: Some(header_mutation_with_body_len(mutation, rewritten.len())),
                body_mutation: Some(BodyMutation { mutation: Some(BodyMutationKind::Body(rewritten)) }),
            })),
        }
    }

    fn resolve_element(&self, element: &serde_json::Value, snapshot: &ConfigSnapshot) -> Resolution {
        if element.get("method").and_then(serde_json::Value::as_str) != Some("tools/call") {
            return Resolution::NotAToolCall;
        }
        let id = element.get("id").cloned();
        let Some(exposed_name) = jsonrpc::tool_call_name(element) else {
            return Resolution::Unresolved { id, exposed_name: String::new() };
        };
        match snapshot.index.resolve(exposed_name) {
            Some((server_id, original_name)) => Resolution::Routable { server_id: server_id.to_string(), original_name: original_name.to_string() },
            None => Resolution::Unresolved { id, exposed_name: exposed_name.to_string() },
        }
    }
}

fn continue_response(variant: fn(CommonResponse) -> RespEvent) -> ProcessingResponse {
    ProcessingResponse {
        response: Some(variant(CommonResponse { status: ResponseStatus::Continue as i32, header_mutation: None, body_mutation: None })),
    }
}

fn immediate_jsonrpc_error(id: serde_json::Value, code: i64, message: String) -> ProcessingResponse {
    let body = serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } });
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    ProcessingResponse {
        response: Some(RespEvent::ImmediateResponse(ImmediateResponse {
            status: Some(HttpStatus { code: 200 }),
            headers: Some(HeaderMutation {
                set_headers: vec![set_header(CONTENT_LENGTH_HEADER, &bytes.len().to_string())],
                remove_headers: Vec::new(),
            }),
            body: bytes,
            details: message,
        })),
    }
}

fn set_header(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption { header: Some(HeaderValue { key: key.to_string(), value: value.to_string() }), append: false }
}

/// Build the routing header mutation described in §4.5 step 3.
fn header_mutation_for(server: &crate::model::ServerRecord, tool_name: Option<&str>, method: Option<&str>, captured: &CapturedHeaders) -> HeaderMutation {
    let mut set_headers = vec![set_header(AUTHORITY_HEADER, &server.hostname), set_header(PATH_HEADER, &server.path())];

    if let Some(credential) = &server.credential {
        set_headers.push(set_header(AUTHORIZATION_HEADER, &credential.to_header_value()));
    } else if let Some(existing) = &captured.authorization {
        set_headers.push(set_header(AUTHORIZATION_HEADER, existing));
    }

    set_headers.push(set_header(SERVERNAME_HEADER, &server.id));
    if let Some(tool_name) = tool_name {
        set_headers.push(set_header(TOOLNAME_HEADER, tool_name));
    }
    if let Some(method) = method {
        set_headers.push(set_header(METHOD_DIAG_HEADER, method));
    }
    if let Some(session_id) = &captured.session_id {
        set_headers.push(set_header(SESSION_ID_HEADER, &session_id.0));
    }

    HeaderMutation { set_headers, remove_headers: Vec::new() }
}

fn header_mutation_with_body_len(mut mutation: HeaderMutation, body_len: usize) -> HeaderMutation {
    mutation.set_headers.push(set_header(CONTENT_LENGTH_HEADER, &body_len.to_string()));
    mutation
}
