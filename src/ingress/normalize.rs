//! Tool-call envelope flattening.
//!
//! Retell sends tool arguments in one of three shapes:
//!
//! ```json
//! { "args": {...}, "call": {...}, "name": "create-booking" }
//! { "tool": { "name": "...", "arguments": {...} }, "call": {...} }
//! { ...args, "call_id": "..." }            // with x-retell-call-id
//! ```
//!
//! All of them become the same interior payload. The envelope fields travel
//! beside the request as [`ToolMetadata`]; handlers never see the shape.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, Method, Uri};
use axum::middleware::Next;
use axum::response::Response;
use serde_json::{Map, Value};

use super::read_body;
use crate::error::ApiError;

pub const CALL_ID_HEADER: &str = "x-retell-call-id";

const META_KEYS: [&str; 4] = ["call", "tool", "name", "agent_id"];
/// Meta keys found inside the arguments, kept even when the envelope
/// overrides them.
const STRIPPED_KEY: &str = "stripped";

/// Envelope fields removed from the payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolMetadata(pub Map<String, Value>);

impl ToolMetadata {
    fn call_field(&self, field: &str) -> Option<&str> {
        self.0.get("call")?.get(field)?.as_str()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_field("call_id")
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.0
            .get("agent_id")
            .and_then(Value::as_str)
            .or_else(|| self.call_field("agent_id"))
    }

    pub fn to_number(&self) -> Option<&str> {
        self.call_field("to_number")
    }

    pub fn from_number(&self) -> Option<&str> {
        self.call_field("from_number")
    }

    /// A meta-named key the agent sent inside the arguments, e.g. a
    /// caller's `name`.
    pub fn argument(&self, key: &str) -> Option<&str> {
        self.0.get(STRIPPED_KEY)?.get(key)?.as_str()
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.0
            .get("name")
            .and_then(Value::as_str)
            .or_else(|| self.0.get("tool")?.get("name")?.as_str())
    }
}

/// The body exactly as received, kept for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct RetellOriginalBody(pub Value);

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub payload: Value,
    pub metadata: ToolMetadata,
}

pub fn is_envelope(body: &Value, has_call_header: bool) -> bool {
    has_call_header
        || body
            .as_object()
            .is_some_and(|o| ["args", "call", "tool", "name"].iter().any(|k| o.contains_key(*k)))
}

fn arguments(tool: &Value) -> Result<Option<Value>, ApiError> {
    match tool.get("arguments") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Some(Value::Object(Map::new()))),
        Some(Value::String(s)) => serde_json::from_str(s)
            .map(Some)
            .map_err(|e| ApiError::invalid_body(format!("tool.arguments is not JSON: {e}"))),
        Some(other) => Ok(Some(other.clone())),
    }
}

/// Flatten `body`. A body that is not an envelope comes back unchanged, so
/// normalizing an already normalized payload is a no-op.
pub fn normalize(body: &Value, header_call_id: Option<&str>) -> Result<Normalized, ApiError> {
    if !is_envelope(body, header_call_id.is_some()) {
        return Ok(Normalized {
            payload: body.clone(),
            metadata: ToolMetadata::default(),
        });
    }

    let mut payload = match body.get("args") {
        Some(Value::Null) => Value::Object(Map::new()),
        Some(args) => args.clone(),
        None => match body.get("tool").map(arguments).transpose()?.flatten() {
            Some(args) => args,
            None => body.clone(),
        },
    };

    let mut metadata = Map::new();
    if let Some(fields) = payload.as_object_mut() {
        let mut stripped = Map::new();
        for key in META_KEYS {
            if let Some(value) = fields.remove(key) {
                metadata.insert(key.to_string(), value.clone());
                stripped.insert(key.to_string(), value);
            }
        }
        if !stripped.is_empty() {
            metadata.insert(STRIPPED_KEY.to_string(), Value::Object(stripped));
        }
        // Flat payloads carry the call id at the top level.
        if let Some(call_id) = fields.remove("call_id") {
            let call = metadata
                .entry("call")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(call) = call.as_object_mut() {
                call.entry("call_id").or_insert(call_id);
            }
        }
    }
    // Envelope-level fields win over anything found inside the arguments.
    if let Some(envelope) = body.as_object() {
        for key in META_KEYS {
            if let Some(value) = envelope.get(key) {
                metadata.insert(key.to_string(), value.clone());
            }
        }
    }

    let mut metadata = ToolMetadata(metadata);
    if let Some(call_id) = header_call_id.filter(|id| !id.is_empty()) {
        if metadata.call_id().is_none() {
            let call = metadata
                .0
                .entry("call")
                .or_insert_with(|| Value::Object(Map::new()));
            if !call.is_object() {
                *call = Value::Object(Map::new());
            }
            if let Some(call) = call.as_object_mut() {
                call.insert("call_id".to_string(), Value::String(call_id.to_string()));
            }
        }
    }

    Ok(Normalized { payload, metadata })
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Merge payload fields into the query string. Keys already present in the
/// query keep their explicit values.
pub fn merge_query(uri: &Uri, payload: &Value) -> Result<Uri, ApiError> {
    let existing: Vec<(String, String)> = uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &existing {
        serializer.append_pair(k, v);
    }
    if let Some(fields) = payload.as_object() {
        for (k, v) in fields {
            if v.is_null() || existing.iter().any(|(ek, _)| ek == k) {
                continue;
            }
            serializer.append_pair(k, &query_value(v));
        }
    }
    let query = serializer.finish();

    let path_and_query = if query.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), query)
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| ApiError::invalid_body(format!("query rebuild failed: {e}")))?,
    );
    Uri::from_parts(parts).map_err(|e| ApiError::invalid_body(format!("query rebuild failed: {e}")))
}

/// Tool routes only. Webhook bodies are left untouched for signature checks.
pub async fn normalize_tool_call(req: Request, next: Next) -> Result<Response, ApiError> {
    let (mut parts, body) = req.into_parts();
    let bytes = read_body(body).await?;
    let original: Value = if bytes.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::invalid_body(format!("body is not JSON: {e}")))?
    };

    let header_call_id = parts
        .headers
        .get(CALL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let Normalized { payload, metadata } = normalize(&original, header_call_id.as_deref())?;

    if let Some(call_id) = metadata.call_id() {
        super::record_call(call_id);
    }
    tracing::debug!(tool = metadata.tool_name().unwrap_or(""), "Normalized tool call");

    let body = if parts.method == Method::GET || parts.method == Method::HEAD {
        parts.uri = merge_query(&parts.uri, &payload)?;
        Body::from(bytes)
    } else {
        let rewritten = serde_json::to_vec(&payload)
            .map_err(|e| ApiError::internal(format!("payload encode: {e}")))?;
        parts.headers.remove(header::CONTENT_LENGTH);
        Body::from(rewritten)
    };

    parts.extensions.insert(metadata);
    parts.extensions.insert(RetellOriginalBody(original));
    Ok(next.run(Request::from_parts(parts, body)).await)
}
