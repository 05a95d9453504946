//! Static liveness handlers.
//!
//! `/healthz` always answers `200 OK` once the process has reached the
//! point of starting this listener — readiness (whether any upstream is
//! registered) is a `tools/list` call away, not this endpoint's job.
//! `/hello` is a plain-text identification endpoint useful for poking at a
//! freshly deployed gateway by hand.

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Bind and serve `/healthz` and `/hello` until `shutdown` fires.
pub async fn serve_with_shutdown(addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "health listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "health listener accept failed");
                        continue;
                    }
                };
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(handle);
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!(error = %e, "health connection closed with error");
                    }
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("health listener shutdown signal received");
                return Ok(());
            }
        }
    }
}

async fn handle(req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = match req.uri().path() {
        "/healthz" => "ok",
        "/hello" => "mcp-gateway",
        _ => {
            let mut response = Response::new(Full::new(Bytes::from("not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            return Ok(response);
        }
    };
    Ok(Response::new(Full::new(Bytes::from(body))))
}
