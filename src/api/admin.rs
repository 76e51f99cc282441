use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiError;
use crate::tasks::{PhoneAction, PhoneNumberTask};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumberRequest {
    pub action: PhoneAction,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub area_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub forwarding_number: Option<String>,
    /// Lets the caller retry this request safely; minted when absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// POST /api/admin/tenants/{tenant_id}/phone-numbers: queue a purchase,
/// release or assignment for the phone-number worker.
///
/// Answers 202 with the task id once the outbox row is written.
pub async fn enqueue_phone_numbers(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let tenant_id: Uuid = tenant_id
        .parse()
        .map_err(|_| ApiError::invalid_field("tenant_id", "expected a UUID"))?;
    let req: PhoneNumberRequest = serde_json::from_slice(&body).map_err(ApiError::from_decode)?;

    if state.store.tenant(tenant_id).await?.is_none() {
        return Err(ApiError::TenantNotFound);
    }
    crate::ingress::record_tenant(tenant_id);

    if let Some(agent_id) = req.agent_id {
        let belongs = state
            .store
            .agent(agent_id)
            .await?
            .is_some_and(|a| a.tenant_id == tenant_id);
        if !belongs {
            return Err(ApiError::invalid_field("agentId", "not an agent of this tenant"));
        }
    }

    let task = PhoneNumberTask {
        action: req.action,
        tenant_id,
        agent_id: req.agent_id,
        phone_number: req.phone_number.map(|n| n.trim().to_string()),
        area_code: req.area_code,
        country: req.country.unwrap_or_else(|| "US".to_string()),
        forwarding_number: req.forwarding_number,
        idempotency_key: req
            .idempotency_key
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
    };
    let task_id = state.tasks.enqueue(task).await?;
    tracing::info!(task_id = %task_id, action = ?req.action, "Phone number task queued");

    Ok((StatusCode::ACCEPTED, Json(json!({ "taskId": task_id }))))
}
