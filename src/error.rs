use std::borrow::Cow;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::booking::Slot;
use crate::db::DbError;
use crate::provider::ProviderError;

/// Sent with a 503 when the provider's 429 named no delay.
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// Error surfaced by an HTTP handler. Every variant maps to one stable `kind`
/// string and one status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid token")]
    InvalidToken,
    #[error("stale timestamp")]
    StaleTimestamp,
    #[error("{message}")]
    Validation {
        kind: &'static str,
        message: String,
    },
    #[error("tenant not found")]
    TenantNotFound,
    #[error("tenant resolution is ambiguous")]
    TenantAmbiguous,
    #[error("requested slot is unavailable")]
    SlotUnavailable { alternates: Vec<Slot> },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("{detail}")]
    Internal {
        kind: &'static str,
        detail: String,
    },
}

impl ApiError {
    pub fn missing_field(field: &str) -> Self {
        Self::Validation {
            kind: "validation/missing-field",
            message: format!("missing field `{field}`"),
        }
    }

    pub fn invalid_field(field: &str, reason: impl std::fmt::Display) -> Self {
        Self::Validation {
            kind: "validation/invalid-field",
            message: format!("invalid `{field}`: {reason}"),
        }
    }

    pub fn invalid_body(reason: impl std::fmt::Display) -> Self {
        Self::Validation {
            kind: "validation/invalid-body",
            message: reason.to_string(),
        }
    }

    /// Map a serde decoding failure onto the validation kinds.
    pub fn from_decode(err: serde_json::Error) -> Self {
        let message = err.to_string();
        let kind = if message.starts_with("missing field") {
            "validation/missing-field"
        } else {
            "validation/invalid-field"
        };
        Self::Validation { kind, message }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            kind: "internal/error",
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> Cow<'static, str> {
        match self {
            Self::InvalidSignature => "auth/invalid-signature".into(),
            Self::InvalidToken => "auth/invalid-token".into(),
            Self::StaleTimestamp => "auth/stale-timestamp".into(),
            Self::Validation { kind, .. } => (*kind).into(),
            Self::TenantNotFound => "tenant/not-found".into(),
            Self::TenantAmbiguous => "tenant/ambiguous".into(),
            Self::SlotUnavailable { .. } => "booking/slot-unavailable".into(),
            Self::Provider(e) => e.kind().into(),
            Self::Database(_) => "internal/database".into(),
            Self::Internal { kind, .. } => (*kind).into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidSignature | Self::InvalidToken | Self::StaleTimestamp => {
                StatusCode::UNAUTHORIZED
            }
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::TenantNotFound => StatusCode::NOT_FOUND,
            Self::TenantAmbiguous | Self::SlotUnavailable { .. } => StatusCode::CONFLICT,
            Self::Provider(e) => match e {
                ProviderError::RateLimited { .. } => StatusCode::SERVICE_UNAVAILABLE,
                ProviderError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                ProviderError::NotFound { .. } => StatusCode::NOT_FOUND,
                ProviderError::Conflict { .. } => StatusCode::CONFLICT,
                ProviderError::Invalid { .. } => StatusCode::BAD_REQUEST,
                ProviderError::Unknown { .. } => StatusCode::BAD_GATEWAY,
            },
            Self::Database(_) | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show the caller. Auth failures never say which field
    /// failed; internal failures never carry details.
    fn public_message(&self) -> String {
        match self {
            Self::InvalidSignature | Self::InvalidToken | Self::StaleTimestamp => {
                "unauthorized".to_string()
            }
            Self::Database(_) | Self::Internal { .. } => "internal error".to_string(),
            // Provider text stays in the logs.
            Self::Provider(e) => match e {
                ProviderError::RateLimited { .. } => "provider is rate limiting, retry later",
                ProviderError::NotFound { .. } => "not found at the provider",
                ProviderError::Conflict { .. } => "provider reported a conflict",
                ProviderError::Timeout { .. } => "provider timed out",
                ProviderError::Invalid { .. } => "provider rejected the request",
                ProviderError::Unknown { .. } => "upstream provider error",
            }
            .to_string(),
            other => other.to_string(),
        }
    }
}

/// JSON error body. Stashed in the response extensions so the correlation
/// layer can stamp `correlationId` into it on the way out.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternates: Option<Vec<Slot>>,
}

#[derive(Serialize)]
pub struct ErrorEnvelope<'a> {
    pub error: &'a ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();

        match &self {
            Self::Database(e) => tracing::error!(kind = %kind, error = %e, "Request failed"),
            Self::Internal { detail, .. } => {
                tracing::error!(kind = %kind, detail = %detail, "Request failed")
            }
            Self::Provider(e) => tracing::warn!(kind = %kind, error = %e, "Provider call failed"),
            _ => tracing::info!(kind = %kind, status = status.as_u16(), "Request rejected"),
        }

        let body = ErrorBody {
            kind: kind.into_owned(),
            message: self.public_message(),
            correlation_id: None,
            alternates: match &self {
                Self::SlotUnavailable { alternates } => Some(alternates.clone()),
                _ => None,
            },
        };

        let mut response = (status, Json(ErrorEnvelope { error: &body })).into_response();
        if let Self::Provider(ProviderError::RateLimited { retry_after, .. }) = &self {
            let secs = retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response.extensions_mut().insert(body);
        response
    }
}
