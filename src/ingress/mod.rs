//! Shared ingress: correlation ids, request spans and the error body stamp.
//! Route-specific middleware lives in `verify` (authentication) and
//! `normalize` (tool-call envelope flattening).

pub mod normalize;
pub mod verify;

use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use bytes::Bytes;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{ApiError, ErrorBody, ErrorEnvelope};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Largest body any ingress route buffers.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

fn accept_inbound(value: &str) -> bool {
    !value.is_empty() && value.len() <= 128 && value.bytes().all(|b| b.is_ascii_graphic())
}

/// Outermost application middleware. Adopts or mints the correlation id,
/// runs the request inside a span that later layers enrich with `tenant_id`
/// and `call_id`, and echoes the id in the header and in error bodies.
pub async fn correlation(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| accept_inbound(v))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(CorrelationId(id.clone()));

    let span = tracing::info_span!(
        "request",
        correlation_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
        tenant_id = tracing::field::Empty,
        call_id = tracing::field::Empty,
    );
    let started = Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;

    let error = response.extensions_mut().remove::<ErrorBody>();
    let kind = error.as_ref().map(|body| body.kind.clone());
    if let Some(mut body) = error {
        body.correlation_id = Some(id.clone());
        let (mut parts, _) = response.into_parts();
        let bytes = serde_json::to_vec(&ErrorEnvelope { error: &body }).unwrap_or_default();
        parts.headers.remove(header::CONTENT_LENGTH);
        response = Response::from_parts(parts, Body::from(bytes));
    }
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }

    span.in_scope(|| {
        tracing::info!(
            status = response.status().as_u16(),
            kind = kind.as_deref().unwrap_or(""),
            duration_ms = started.elapsed().as_millis() as u64,
            "Request finished"
        )
    });
    response
}

/// Buffer a request body up to `MAX_BODY_BYTES`.
pub(crate) async fn read_body(body: Body) -> Result<Bytes, ApiError> {
    axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::invalid_body(format!("unreadable body: {e}")))
}

/// Record the resolved tenant on the request span.
pub fn record_tenant(tenant_id: Uuid) {
    tracing::Span::current().record("tenant_id", tracing::field::display(tenant_id));
}

pub fn record_call(call_id: &str) {
    tracing::Span::current().record("call_id", tracing::field::display(call_id));
}
