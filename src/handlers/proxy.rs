use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use crate::error::{Error, Result};
use crate::metrics::UPSTREAM_LATENCY;
use crate::state::AppState;

// largest request body buffered for the upstream
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

// Forwards an admitted request to the upstream
pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let start_time = Instant::now();

    match forward(&state, request).await {
        Ok(response) => {
            UPSTREAM_LATENCY.observe(start_time.elapsed().as_secs_f64());
            response
        }
        Err(e) => {
            warn!(error = %e, upstream = %state.upstream, "upstream request failed");
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

async fn forward(state: &AppState, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = format!("{}{}", state.upstream, path);

    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::upstream(format!("failed to read request body: {}", e)))?;

    let mut headers = parts.headers;
    headers.remove(header::HOST);
    headers.remove(header::CONNECTION);

    let upstream = state
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::upstream(format!("request failed: {}", e)))?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);

    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| Error::upstream(format!("failed to read response: {}", e)))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
