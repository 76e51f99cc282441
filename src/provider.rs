//! Shared outer contract for provider adapters: error classification and the
//! retry loop. Adapters classify; nothing downstream reads provider error text.

use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use crate::backoff::RetryPolicy;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} rate limited the request")]
    RateLimited {
        provider: &'static str,
        retry_after: Option<u64>,
    },
    #[error("{provider}: not found: {message}")]
    NotFound {
        provider: &'static str,
        message: String,
    },
    #[error("{provider}: conflict: {message}")]
    Conflict {
        provider: &'static str,
        message: String,
    },
    #[error("{provider}: timed out")]
    Timeout { provider: &'static str },
    #[error("{provider}: invalid request: {message}")]
    Invalid {
        provider: &'static str,
        message: String,
    },
    #[error("{provider}: {message}")]
    Unknown {
        provider: &'static str,
        message: String,
        retryable: bool,
    },
}

impl ProviderError {
    pub fn unknown(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Unknown {
            provider,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn invalid(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            provider,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "provider/rate-limited",
            Self::NotFound { .. } => "provider/not-found",
            Self::Conflict { .. } => "provider/conflict",
            Self::Timeout { .. } => "provider/timeout",
            Self::Invalid { .. } => "provider/invalid",
            Self::Unknown { .. } => "provider/unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unknown { retryable: true, .. }
        )
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(
        provider: &'static str,
        status: StatusCode,
        retry_after: Option<u64>,
        body: &str,
    ) -> Self {
        let message = format!("{status}: {}", truncate(body, 300));
        match status.as_u16() {
            429 => Self::RateLimited {
                provider,
                retry_after,
            },
            404 => Self::NotFound { provider, message },
            409 => Self::Conflict { provider, message },
            400 | 422 => Self::Invalid { provider, message },
            408 => Self::Timeout { provider },
            s if s >= 500 => Self::Unknown {
                provider,
                message,
                retryable: true,
            },
            _ => Self::unknown(provider, message),
        }
    }

    /// Classify a transport-level failure.
    pub fn from_transport(provider: &'static str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { provider }
        } else {
            Self::Unknown {
                provider,
                message: err.to_string(),
                retryable: true,
            }
        }
    }
}

/// Retry class of an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safety {
    /// Side-effect free lookups.
    Read,
    /// Mutation the provider deduplicates by Idempotency-Key.
    KeyedWrite,
    /// Mutation with no idempotency guarantee.
    Write,
}

impl Safety {
    fn policy(self) -> RetryPolicy {
        match self {
            Safety::Read => RetryPolicy::provider_reads(),
            Safety::KeyedWrite => RetryPolicy::provider_keyed_writes(),
            Safety::Write => RetryPolicy::once(),
        }
    }
}

/// Send a request built by `build`, decode the JSON response, and retry per
/// the safety class. An empty success body decodes as JSON `null`.
pub async fn execute<T, F>(provider: &'static str, safety: Safety, build: F) -> Result<T, ProviderError>
where
    T: DeserializeOwned,
    F: Fn() -> RequestBuilder,
{
    let policy = safety.policy();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match send_once(provider, build()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && !policy.exhausted(attempt) => {
                let delay = policy.next_delay(attempt);
                tracing::warn!(
                    provider,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    kind = e.kind(),
                    "Retrying provider call: {e}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn send_once<T: DeserializeOwned>(
    provider: &'static str,
    request: RequestBuilder,
) -> Result<T, ProviderError> {
    let resp = request
        .send()
        .await
        .map_err(|e| ProviderError::from_transport(provider, &e))?;

    let status = resp.status();
    if !status.is_success() {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(provider, status, retry_after, &body));
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ProviderError::from_transport(provider, &e))?;
    let slice: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
    serde_json::from_slice(slice)
        .map_err(|e| ProviderError::unknown(provider, format!("malformed response: {e}")))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
