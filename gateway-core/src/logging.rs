//! Request-logging middleware shared by the Router's gRPC service.

use std::task::{Context, Poll};
use std::time::Instant;

use http::Request;
use tower::{Layer, Service};
use tracing::{info, warn};
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// A `Layer` that adds a request ID and timing to every request.
#[derive(Debug, Clone, Default)]
pub struct RequestLoggerLayer;

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLoggerService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RequestLoggerService { service }
    }
}

#[derive(Debug, Clone)]
pub struct RequestLoggerService<S> {
    service: S,
}

impl<S, B> Service<Request<B>> for RequestLoggerService<S>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);

        if !request.headers().contains_key(REQUEST_ID_HEADER) {
            if let Ok(header_value) = http::HeaderValue::from_str(&request_id) {
                request.headers_mut().insert(REQUEST_ID_HEADER, header_value);
            }
        }

        let uri = request.uri().path().to_string();
        let start_time = Instant::now();

        let span = tracing::span!(tracing::Level::INFO, "ext_proc_stream", request_id = %request_id, uri = %uri);
        let _enter = span.enter();
        info!(request_id = %request_id, uri = %uri, "stream opened");

        let future = self.service.call(request);
        Box::pin(async move {
            let result = future.await;
            let duration = start_time.elapsed();
            match &result {
                Ok(_) => info!(request_id = %request_id, duration_ms = duration.as_millis(), "stream completed"),
                Err(_) => warn!(request_id = %request_id, duration_ms = duration.as_millis(), "stream failed"),
            }
            result
        })
    }
}
