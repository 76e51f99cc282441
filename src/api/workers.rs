//! In-process sidecar workers the outbox delivers to. Each is idempotent by
//! the payload's `idempotencyKey`: a redelivery replays the first answer.

use axum::body::Bytes;
use axum::extract::State;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::db::{AssignmentType, DbError, NewPhoneAssignment, Snapshot};
use crate::error::ApiError;
use crate::phone::redact;
use crate::provider::ProviderError;
use crate::tasks::{PhoneAction, PhoneNumberTask, SmsTask, TaskContract};
use crate::tools::idempotency::{self, Acquired};
use crate::tools::ToolReply;
use crate::twilio::messages::OutboundMessage;
use crate::AppState;

const TELEPHONY: &str = "telephony";

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(ApiError::from_decode)
}

fn snapshot(body: serde_json::Value) -> Result<Snapshot, ApiError> {
    Ok(Snapshot {
        status: 200,
        body: serde_json::to_string(&body)
            .map_err(|e| ApiError::internal(format!("snapshot encode: {e}")))?,
    })
}

/// POST /api/workers/send-sms
pub async fn send_sms(State(state): State<AppState>, body: Bytes) -> Result<ToolReply, ApiError> {
    let task: SmsTask = decode(&body)?;
    task.validate()?;
    let key = idempotency::key(uuid::Uuid::nil(), "send-sms", &[&task.idempotency_key]);

    let guard = match idempotency::acquire(&state.store, &key, None, "send-sms").await? {
        Acquired::Replay(snapshot) => {
            tracing::info!("Duplicate SMS delivery, replaying");
            return Ok(ToolReply::Raw(snapshot));
        }
        Acquired::Owner(guard) => guard,
    };

    let sid = state
        .twilio
        .send_message(&OutboundMessage {
            to: &task.to,
            body: &task.body,
            channel: task.channel,
            from: task.from.as_deref(),
        })
        .await?;
    tracing::info!(to = %redact(&task.to), message_sid = %sid, "SMS worker sent message");

    let stored = snapshot(json!({ "ok": true, "sid": sid }))?;
    guard.complete(&stored).await?;
    Ok(ToolReply::Raw(stored))
}

/// POST /api/workers/phone-numbers
///
/// Provider calls happen outside any transaction; the assignment is then
/// recorded under the tenant row lock. A purchase whose assignment cannot
/// be recorded is released again.
pub async fn phone_numbers(State(state): State<AppState>, body: Bytes) -> Result<ToolReply, ApiError> {
    let task: PhoneNumberTask = decode(&body)?;
    task.validate()?;
    if state.store.tenant(task.tenant_id).await?.is_none() {
        return Err(ApiError::TenantNotFound);
    }
    crate::ingress::record_tenant(task.tenant_id);

    let key = idempotency::key(task.tenant_id, "phone-numbers", &[&task.idempotency_key]);
    let guard = match idempotency::acquire(&state.store, &key, Some(task.tenant_id), "phone-numbers").await? {
        Acquired::Replay(snapshot) => return Ok(ToolReply::Raw(snapshot)),
        Acquired::Owner(guard) => guard,
    };

    let result = match task.action {
        PhoneAction::Purchase => purchase(&state, &task).await?,
        PhoneAction::AssignExisting => assign_existing(&state, &task).await?,
        PhoneAction::Release => release(&state, &task).await?,
    };

    let stored = snapshot(result)?;
    guard.complete(&stored).await?;
    Ok(ToolReply::Raw(stored))
}

fn assignment_conflict(err: DbError, number: &str) -> ApiError {
    match err {
        DbError::Conflict(_) => ApiError::invalid_field("phoneNumber", format!("{number} is already assigned")),
        other => other.into(),
    }
}

async fn purchase(state: &AppState, task: &PhoneNumberTask) -> Result<serde_json::Value, ApiError> {
    let number = match &task.phone_number {
        Some(number) => number.clone(),
        None => state
            .twilio
            .search_available(&task.country, task.area_code.as_deref(), 1)
            .await?
            .into_iter()
            .next()
            .map(|n| n.phone_number)
            .ok_or_else(|| ProviderError::NotFound {
                provider: TELEPHONY,
                message: format!(
                    "no numbers available in {} {}",
                    task.country,
                    task.area_code.as_deref().unwrap_or("")
                ),
            })?,
    };

    let owned = state.twilio.purchase(&number).await?;
    let recorded = state
        .store
        .record_assignment(&NewPhoneAssignment {
            tenant_id: task.tenant_id,
            agent_id: task.agent_id,
            external_phone_id: Some(owned.sid.clone()),
            phone_number: owned.phone_number.clone(),
            forwarding_number: task.forwarding_number.clone(),
            assignment_type: AssignmentType::New,
            metadata: json!({ "source": "purchase" }),
        })
        .await;

    let assignment = match recorded {
        Ok(assignment) => assignment,
        Err(e) => {
            tracing::error!(sid = %owned.sid, "Recording purchased number failed, releasing it: {e}");
            if let Err(release_err) = state.twilio.release(&owned.sid).await {
                tracing::error!(sid = %owned.sid, "Compensating release failed: {release_err}");
            }
            return Err(assignment_conflict(e, &owned.phone_number));
        }
    };

    state.resolver.invalidate_number(&assignment.phone_number).await;
    tracing::info!(phone = %redact(&assignment.phone_number), "Number purchased and assigned");
    Ok(json!({
        "ok": true,
        "action": "purchase",
        "phoneNumber": assignment.phone_number,
        "assignmentId": assignment.id,
    }))
}

async fn assign_existing(state: &AppState, task: &PhoneNumberTask) -> Result<serde_json::Value, ApiError> {
    let number = task
        .phone_number
        .as_deref()
        .ok_or_else(|| ApiError::missing_field("phoneNumber"))?;
    let owned = state
        .twilio
        .find_owned(number)
        .await?
        .ok_or_else(|| ProviderError::NotFound {
            provider: TELEPHONY,
            message: format!("{} is not on the account", redact(number)),
        })?;

    let assignment = state
        .store
        .record_assignment(&NewPhoneAssignment {
            tenant_id: task.tenant_id,
            agent_id: task.agent_id,
            external_phone_id: Some(owned.sid),
            phone_number: owned.phone_number,
            forwarding_number: task.forwarding_number.clone(),
            assignment_type: AssignmentType::Existing,
            metadata: json!({ "source": "existing" }),
        })
        .await
        .map_err(|e| assignment_conflict(e, number))?;

    state.resolver.invalidate_number(&assignment.phone_number).await;
    Ok(json!({
        "ok": true,
        "action": "assign_existing",
        "phoneNumber": assignment.phone_number,
        "assignmentId": assignment.id,
    }))
}

async fn release(state: &AppState, task: &PhoneNumberTask) -> Result<serde_json::Value, ApiError> {
    let number = task
        .phone_number
        .as_deref()
        .ok_or_else(|| ApiError::missing_field("phoneNumber"))?;
    let Some(active) = state.store.active_assignment(task.tenant_id, number).await? else {
        tracing::info!(phone = %redact(number), "Number already released");
        return Ok(json!({ "ok": true, "action": "release", "phoneNumber": number, "released": false }));
    };

    // Numbers the tenant brought with them stay on the account.
    if active.assignment_type == AssignmentType::New {
        if let Some(sid) = &active.external_phone_id {
            state.twilio.release(sid).await?;
        }
    }
    state.store.release_assignment(task.tenant_id, number).await?;
    state.resolver.invalidate_number(number).await;
    Ok(json!({ "ok": true, "action": "release", "phoneNumber": number, "released": true }))
}
