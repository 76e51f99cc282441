//! Authentication for the three request shapes: signed Retell webhooks,
//! per-agent bearer tool calls, and the shared-secret worker/admin routes.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::read_body;
use crate::db::{Agent, AgentStatus};
use crate::error::ApiError;
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "x-retell-signature";
pub const TIMESTAMP_HEADER: &str = "x-retell-timestamp";
pub const AGENT_ID_HEADER: &str = "x-agent-id";

type HmacSha256 = Hmac<Sha256>;

/// The signed `x-retell-timestamp` of a verified webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookTimestamp(pub DateTime<Utc>);

/// The agent whose bearer token authenticated a tool call.
#[derive(Debug, Clone)]
pub struct VerifiedAgent(pub Agent);

/// Check `signature` (hex) against HMAC-SHA256(secret, "<timestamp>.<body>").
/// Skew is inclusive: a timestamp exactly `skew_secs` away is accepted.
pub fn verify_signature(
    secret: &[u8],
    timestamp: &str,
    signature: &str,
    body: &[u8],
    now: i64,
    skew_secs: u64,
) -> Result<i64, ApiError> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| ApiError::InvalidSignature)?;
    if now.abs_diff(ts) > skew_secs {
        return Err(ApiError::StaleTimestamp);
    }

    let expected = hex::decode(signature.trim()).map_err(|_| ApiError::InvalidSignature)?;
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| ApiError::internal(format!("hmac key: {e}")))?;
    mac.update(timestamp.trim().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ApiError::InvalidSignature)?;
    Ok(ts)
}

/// Webhook routes: verify the signature over the exact bytes received, then
/// hand the same bytes on.
pub async fn verify_webhook(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (parts, body) = req.into_parts();
    let bytes = read_body(body).await?;

    let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
    let (Some(timestamp), Some(signature)) = (header(TIMESTAMP_HEADER), header(SIGNATURE_HEADER))
    else {
        tracing::warn!("Webhook without signature headers");
        return Err(ApiError::InvalidSignature);
    };

    let ts = verify_signature(
        state.config.retell.api_key.as_bytes(),
        timestamp,
        signature,
        &bytes,
        Utc::now().timestamp(),
        state.config.retell.signature_skew_secs,
    )
    .inspect_err(|e| tracing::warn!(kind = %e.kind(), "Webhook signature rejected"))?;

    let mut req = Request::from_parts(parts, Body::from(bytes));
    if let Some(at) = Utc.timestamp_opt(ts, 0).single() {
        req.extensions_mut().insert(WebhookTimestamp(at));
    }
    Ok(next.run(req).await)
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Tool routes: `Authorization: Bearer <token>` plus `x-agent-id`. The agent
/// must exist, be active, and its stored hash must match the token.
pub async fn verify_tool_token(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer(req.headers()).map(str::to_string);
    let external_id = req
        .headers()
        .get(AGENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (Some(token), Some(external_id)) = (token, external_id) else {
        tracing::warn!("Tool call without bearer token or agent id");
        return Err(ApiError::InvalidToken);
    };

    let agent = state.store.agent_by_external_id(&external_id).await?;
    let presented = hash_token(&token);
    let verified = agent.filter(|a| {
        constant_time_eq(presented.as_bytes(), a.bearer_token_hash.to_ascii_lowercase().as_bytes())
            && a.status == AgentStatus::Active
    });
    let Some(agent) = verified else {
        tracing::warn!(agent_id = %external_id, "Tool call token rejected");
        return Err(ApiError::InvalidToken);
    };

    req.extensions_mut().insert(VerifiedAgent(agent));
    Ok(next.run(req).await)
}

/// Shared-secret bearer check for worker and admin routes. An unconfigured
/// secret rejects everything.
pub fn check_bearer(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    if expected.is_empty() {
        tracing::warn!("Route token not configured, rejecting request");
        return Err(ApiError::InvalidToken);
    }
    match bearer(headers) {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => {
            tracing::warn!("Unauthorized request");
            Err(ApiError::InvalidToken)
        }
    }
}

pub async fn verify_worker(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    check_bearer(req.headers(), &state.config.workers.token)?;
    Ok(next.run(req).await)
}

pub async fn verify_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    check_bearer(req.headers(), &state.config.admin.token)?;
    Ok(next.run(req).await)
}
