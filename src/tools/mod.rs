//! Mid-call tool handlers and their time budget.
//!
//! Every handler runs under a hard deadline. Provider calls are timed
//! individually; any that runs past the slow threshold flags the reply with
//! `slow: true` so the agent can say it is still working on it next time.

pub mod availability;
pub mod booking;
pub mod customer;
pub mod idempotency;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::db::Snapshot;
use crate::error::ApiError;
use crate::ingress::normalize::ToolMetadata;
use crate::ingress::verify::VerifiedAgent;
use crate::ingress::read_body;
use crate::provider::ProviderError;
use crate::tenant::{ResolveInputs, ResolvedTenant};
use crate::AppState;

/// A provider call slower than this marks the reply slow.
pub const SLOW_CALL: Duration = Duration::from_millis(800);
/// Past this the tool answers `provider/timeout`.
pub const HARD_DEADLINE: Duration = Duration::from_millis(2500);

/// A normalized, authenticated tool call with its tenant resolved.
pub struct ToolCall {
    pub tenant: ResolvedTenant,
    pub metadata: ToolMetadata,
    pub payload: Value,
}

impl ToolCall {
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_value(self.payload.clone()).map_err(ApiError::from_decode)
    }
}

impl FromRequest<AppState> for ToolCall {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let verified = parts.extensions.get::<VerifiedAgent>().cloned();
        let metadata = parts
            .extensions
            .get::<ToolMetadata>()
            .cloned()
            .unwrap_or_default();

        let bytes = read_body(body).await?;
        let payload = if bytes.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(&bytes).map_err(|e| ApiError::invalid_body(e.to_string()))?
        };

        let tenant = state
            .resolver
            .resolve(&ResolveInputs {
                verified_agent: verified.as_ref().map(|v| &v.0),
                agent_id: metadata.agent_id(),
                to_number: metadata.to_number(),
                call_id: metadata.call_id(),
            })
            .await?;

        Ok(ToolCall {
            tenant,
            metadata,
            payload,
        })
    }
}

/// Tracks whether any provider call in this request ran slow.
#[derive(Clone, Default)]
pub struct Budget {
    slow: Arc<AtomicBool>,
}

impl Budget {
    /// Await a provider call, timing it against the slow threshold.
    pub async fn call<T, F>(&self, label: &'static str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let out = fut.await;
        let elapsed = started.elapsed();
        if elapsed > SLOW_CALL {
            self.slow.store(true, Ordering::Relaxed);
            tracing::warn!(
                call = label,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow provider call"
            );
        }
        out
    }

    pub fn is_slow(&self) -> bool {
        self.slow.load(Ordering::Relaxed)
    }
}

pub enum ToolReply {
    /// A JSON object; `slow` is stamped in on the way out.
    Fresh(Value),
    /// A stored response, sent byte for byte.
    Raw(Snapshot),
}

impl IntoResponse for ToolReply {
    fn into_response(self) -> Response {
        match self {
            ToolReply::Fresh(value) => Json(value).into_response(),
            ToolReply::Raw(snapshot) => {
                let status = StatusCode::from_u16(snapshot.status).unwrap_or(StatusCode::OK);
                let mut response = (status, snapshot.body).into_response();
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                response
            }
        }
    }
}

/// Run a tool body under the hard deadline and stamp `slow` on fresh replies.
pub async fn run<F, Fut>(tool: &'static str, handler: F) -> Result<ToolReply, ApiError>
where
    F: FnOnce(Budget) -> Fut,
    Fut: Future<Output = Result<ToolReply, ApiError>>,
{
    let budget = Budget::default();
    let started = Instant::now();
    let outcome = tokio::time::timeout(HARD_DEADLINE, handler(budget.clone())).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Err(_) => {
            tracing::warn!(tool, elapsed_ms, "Tool call hit the hard deadline");
            Err(ApiError::Provider(ProviderError::Timeout { provider: "booking" }))
        }
        Ok(Err(e)) => Err(e),
        Ok(Ok(ToolReply::Fresh(mut value))) => {
            if let Some(fields) = value.as_object_mut() {
                fields.insert("slow".into(), Value::Bool(budget.is_slow()));
            }
            tracing::info!(tool, elapsed_ms, slow = budget.is_slow(), "Tool call answered");
            Ok(ToolReply::Fresh(value))
        }
        Ok(Ok(raw)) => {
            tracing::info!(tool, elapsed_ms, "Tool call answered");
            Ok(raw)
        }
    }
}
