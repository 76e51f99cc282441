//! Signed Retell lifecycle webhooks. The signature has already been checked
//! over the raw bytes by `verify_webhook`; these handlers attribute the call
//! to a tenant, merge the event, and answer 200 only once it is durable.

pub mod lifecycle;

use std::time::Duration;

use axum::extract::{Request, State};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::db::{AnalysisWrite, CallAnalysis, DbError, NewTask, Tenant};
use crate::error::ApiError;
use crate::ingress::verify::WebhookTimestamp;
use crate::ingress::{read_body, record_call};
use crate::phone::{is_e164, redact};
use crate::tasks::{EmailTask, SmsTask, TaskContract};
use crate::tenant::{ResolveInputs, ResolvedTenant};
use crate::tools::idempotency;
use crate::twilio::messages::Channel;
use crate::AppState;

use lifecycle::{analysis_from, parse_payload, CallEvent, CallEventKind, RetellCall, WebhookPayload};

const WEBHOOK_DEADLINE: Duration = Duration::from_secs(5);

/// POST /api/webhooks/retell/call-started
pub async fn call_started(State(state): State<AppState>, req: Request) -> Result<Json<Value>, ApiError> {
    handle(&state, CallEventKind::Started, req).await
}

/// POST /api/webhooks/retell/call-ended
pub async fn call_ended(State(state): State<AppState>, req: Request) -> Result<Json<Value>, ApiError> {
    handle(&state, CallEventKind::Ended, req).await
}

/// POST /api/webhooks/retell/call-analyzed
pub async fn call_analyzed(State(state): State<AppState>, req: Request) -> Result<Json<Value>, ApiError> {
    handle(&state, CallEventKind::Analyzed, req).await
}

async fn handle(state: &AppState, kind: CallEventKind, req: Request) -> Result<Json<Value>, ApiError> {
    let (parts, body) = req.into_parts();
    let received_at = parts
        .extensions
        .get::<WebhookTimestamp>()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);
    let bytes = read_body(body).await?;
    let raw: Value = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::invalid_body(format!("webhook body is not JSON: {e}")))?;
    let payload = parse_payload(&raw)?;
    record_call(&payload.call.call_id);

    if let Some(event) = payload.event.as_deref() {
        if event != kind.as_str() {
            tracing::warn!(event, route = kind.as_str(), "Webhook event does not match its route, using the route");
        }
    }

    match tokio::time::timeout(WEBHOOK_DEADLINE, process(state, kind, &payload, raw, received_at)).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Internal {
            kind: "internal/timeout",
            detail: format!("{} processing exceeded {WEBHOOK_DEADLINE:?}", kind.as_str()),
        }),
    }
}

async fn process(
    state: &AppState,
    kind: CallEventKind,
    payload: &WebhookPayload,
    raw: Value,
    received_at: DateTime<Utc>,
) -> Result<Json<Value>, ApiError> {
    let call = &payload.call;
    let resolved = state
        .resolver
        .resolve(&ResolveInputs {
            verified_agent: None,
            agent_id: call.agent_id.as_deref(),
            to_number: call.business_number(),
            call_id: Some(&call.call_id),
        })
        .await?;

    let event = CallEvent::new(
        kind,
        resolved.tenant.id,
        resolved.agent.as_ref().map(|a| a.id),
        call,
        raw,
    );
    let record = state.store.apply_call_event(&event).await.map_err(|e| match e {
        DbError::TenantMismatch(call_id) => {
            tracing::warn!(call_id = %call_id, "Call belongs to another tenant, ignoring event");
            ApiError::TenantNotFound
        }
        other => other.into(),
    })?;
    tracing::info!(
        event = kind.as_str(),
        status = %record.status,
        last_event = record.last_event,
        "Call event applied"
    );

    if kind == CallEventKind::Analyzed {
        let analysis = analysis_from(payload, received_at);
        analyze(state, &resolved, call, &analysis).await?;
    }

    Ok(Json(json!({ "ok": true })))
}

async fn analyze(
    state: &AppState,
    resolved: &ResolvedTenant,
    call: &RetellCall,
    analysis: &CallAnalysis,
) -> Result<(), ApiError> {
    let follow_ups = follow_ups(state, &resolved.tenant, call, analysis).await?;
    let outcome = state.store.write_analysis(analysis, &follow_ups).await?;
    tracing::info!(
        outcome = ?outcome,
        analyzed_at = %analysis.analyzed_at,
        booking_created = analysis.booking_created,
        "Analysis overwrite check"
    );
    if outcome != AnalysisWrite::Kept && !follow_ups.is_empty() {
        state.tasks.notify();
    }
    Ok(())
}

/// Notification tasks for an analyzed call: a summary to every owner address
/// and, when enabled, a confirmation text to the caller after a booking.
async fn follow_ups(
    state: &AppState,
    tenant: &Tenant,
    call: &RetellCall,
    analysis: &CallAnalysis,
) -> Result<Vec<NewTask>, ApiError> {
    let mut recipients = state.store.owner_emails(tenant.id).await?;
    if let Some(extra) = tenant.notification_email.as_deref().filter(|e| !e.is_empty()) {
        if !recipients.iter().any(|r| r.eq_ignore_ascii_case(extra)) {
            recipients.push(extra.to_string());
        }
    }

    let mut tasks = Vec::new();
    let text = summary_text(tenant, call, analysis);
    for to in recipients {
        let email = EmailTask {
            idempotency_key: idempotency::key(tenant.id, "analysis-email", &[&call.call_id, &to]),
            subject: format!("Call summary for {}", tenant.business_name),
            text: Some(text.clone()),
            html: None,
            from: state.config.notifications.email_from.clone(),
            tenant: Some(tenant.slug.clone()),
            to,
        };
        match email.into_task() {
            Ok(task) => tasks.push(task),
            Err(e) => tracing::warn!("Skipping owner email: {e}"),
        }
    }

    let caller = call.caller_number().filter(|n| is_e164(n));
    if analysis.booking_created && state.config.notifications.sms_confirmations {
        match caller {
            Some(to) => {
                let sms = SmsTask {
                    to: to.to_string(),
                    body: format!(
                        "Thanks for calling {}! Your appointment is booked. Call us back if anything changes.",
                        tenant.business_name
                    ),
                    channel: Channel::Sms,
                    from: None,
                    idempotency_key: idempotency::key(tenant.id, "analysis-sms", &[&call.call_id]),
                };
                match sms.into_task() {
                    Ok(task) => tasks.push(task),
                    Err(e) => tracing::warn!(to = %redact(to), "Skipping confirmation text: {e}"),
                }
            }
            None => tracing::info!("No caller number for the confirmation text"),
        }
    }
    Ok(tasks)
}

fn summary_text(tenant: &Tenant, call: &RetellCall, analysis: &CallAnalysis) -> String {
    let mut lines = vec![format!("{} received a call.", tenant.business_name)];
    if let Some(caller) = call.caller_number() {
        lines.push(format!("Caller: {caller}"));
    }
    lines.push(format!(
        "Analyzed: {}",
        analysis.analyzed_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    if let Some(summary) = &analysis.summary {
        lines.push(format!("Summary: {summary}"));
    }
    if let Some(sentiment) = &analysis.sentiment {
        lines.push(format!("Sentiment: {sentiment}"));
    }
    lines.push(format!(
        "Booking made: {}",
        if analysis.booking_created { "yes" } else { "no" }
    ));
    lines.push(format!("Call id: {}", call.call_id));
    lines.join("\n")
}
