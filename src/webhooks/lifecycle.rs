//! Call lifecycle: Retell webhook payloads and the order-independent merge of
//! `call_started` / `call_ended` / `call_analyzed` into one `CallRecord`.
//!
//! Each field has an owning event. The owner overwrites; every other event
//! only fills the field when it is still empty. That makes the stored record
//! independent of arrival order and of duplicates.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::db::{CallAnalysis, CallRecord, CallStatus};
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallEventKind {
    Started = 1,
    Ended = 2,
    Analyzed = 3,
}

impl CallEventKind {
    pub fn rank(self) -> i16 {
        self as i16
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "call_started",
            Self::Ended => "call_ended",
            Self::Analyzed => "call_analyzed",
        }
    }
}

/// Retell webhook body: `{ "event": "...", "call": {...} }`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub event: Option<String>,
    pub call: RetellCall,
    #[serde(default)]
    pub analyzed_at: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetellCall {
    pub call_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub from_number: Option<String>,
    #[serde(default)]
    pub to_number: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub start_timestamp: Option<i64>,
    #[serde(default)]
    pub end_timestamp: Option<i64>,
    #[serde(default)]
    pub disconnection_reason: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub call_cost: Option<CallCost>,
    #[serde(default)]
    pub call_analysis: Option<RetellAnalysis>,
}

impl RetellCall {
    /// The number that belongs to the business on this call.
    pub fn business_number(&self) -> Option<&str> {
        match self.direction.as_deref() {
            Some("outbound") => self.from_number.as_deref(),
            _ => self.to_number.as_deref(),
        }
    }

    /// The number of the person on the other end.
    pub fn caller_number(&self) -> Option<&str> {
        match self.direction.as_deref() {
            Some("outbound") => self.to_number.as_deref(),
            _ => self.from_number.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallCost {
    /// Total cost in cents.
    #[serde(default)]
    pub combined_cost: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetellAnalysis {
    #[serde(default)]
    pub call_summary: Option<String>,
    #[serde(default)]
    pub user_sentiment: Option<String>,
    #[serde(default)]
    pub call_successful: Option<bool>,
    #[serde(default)]
    pub custom_analysis_data: Option<Value>,
    #[serde(default)]
    pub analyzed_at: Option<Value>,
}

/// One lifecycle event, already attributed to a tenant.
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub kind: CallEventKind,
    pub tenant_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub call_id: String,
    pub direction: Option<String>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cost_cents: Option<i64>,
    pub disconnection_reason: Option<String>,
    pub raw: Value,
}

impl CallEvent {
    pub fn new(
        kind: CallEventKind,
        tenant_id: Uuid,
        agent_id: Option<Uuid>,
        call: &RetellCall,
        raw: Value,
    ) -> Self {
        let started_at = call.start_timestamp.and_then(from_millis);
        // An end before its own start is treated as a zero-length call.
        let ended_at = match (call.end_timestamp.and_then(from_millis), started_at) {
            (Some(end), Some(start)) if end < start => Some(start),
            (end, _) => end,
        };
        Self {
            kind,
            tenant_id,
            agent_id,
            call_id: call.call_id.clone(),
            direction: call.direction.clone(),
            from_number: call.from_number.clone(),
            to_number: call.to_number.clone(),
            started_at,
            ended_at,
            cost_cents: call
                .call_cost
                .as_ref()
                .and_then(|c| c.combined_cost)
                .map(|c| c.round() as i64),
            disconnection_reason: call.disconnection_reason.clone(),
            raw,
        }
    }

    fn owns_timing_start(&self) -> bool {
        self.kind == CallEventKind::Started
    }

    fn owns_ending(&self) -> bool {
        self.kind == CallEventKind::Ended
    }
}

/// Disconnection reasons that mean the call never properly happened.
pub fn is_failure(reason: &str) -> bool {
    reason.starts_with("error")
        || reason.starts_with("dial_")
        || matches!(
            reason,
            "concurrency_limit_reached" | "no_valid_payment" | "scam_detected"
        )
}

fn owned<T: Clone>(owner: bool, current: Option<T>, incoming: &Option<T>) -> Option<T> {
    match (owner, incoming) {
        (true, Some(v)) => Some(v.clone()),
        _ => current.or_else(|| incoming.clone()),
    }
}

/// Merge `event` into the stored record (if any).
pub fn merge(current: Option<CallRecord>, event: &CallEvent) -> CallRecord {
    let started_owner = event.owns_timing_start();
    let ending_owner = event.owns_ending();

    let mut record = current.unwrap_or_else(|| CallRecord {
        id: Uuid::new_v4(),
        tenant_id: event.tenant_id,
        agent_id: None,
        call_id: event.call_id.clone(),
        direction: None,
        from_number: None,
        to_number: None,
        started_at: None,
        ended_at: None,
        status: CallStatus::InProgress,
        cost_cents: None,
        disconnection_reason: None,
        last_event: 0,
        raw_payload: Value::Null,
    });

    record.agent_id = owned(started_owner, record.agent_id, &event.agent_id);
    record.direction = owned(started_owner, record.direction.take(), &event.direction);
    record.from_number = owned(started_owner, record.from_number.take(), &event.from_number);
    record.to_number = owned(started_owner, record.to_number.take(), &event.to_number);
    record.started_at = owned(started_owner, record.started_at, &event.started_at);

    record.ended_at = owned(ending_owner, record.ended_at, &event.ended_at);
    record.cost_cents = owned(ending_owner, record.cost_cents, &event.cost_cents);
    record.disconnection_reason = owned(
        ending_owner,
        record.disconnection_reason.take(),
        &event.disconnection_reason,
    );

    if ending_owner {
        record.status = match event.disconnection_reason.as_deref() {
            Some(reason) if is_failure(reason) => CallStatus::Failed,
            _ => CallStatus::Ended,
        };
    }

    if let (Some(start), Some(end)) = (record.started_at, record.ended_at) {
        if end < start {
            record.ended_at = Some(start);
        }
    }

    if event.kind.rank() >= record.last_event {
        record.last_event = event.kind.rank();
        record.raw_payload = event.raw.clone();
    }

    record
}

/// Build the analysis row for a `call_analyzed` event. `fallback` is the
/// verified webhook timestamp, used when the payload carries no `analyzed_at`.
pub fn analysis_from(payload: &WebhookPayload, fallback: DateTime<Utc>) -> CallAnalysis {
    let call = &payload.call;
    let analysis = call.call_analysis.as_ref();
    let analyzed_at = payload
        .analyzed_at
        .as_ref()
        .or_else(|| analysis.and_then(|a| a.analyzed_at.as_ref()))
        .and_then(parse_instant)
        .unwrap_or(fallback);
    let extracted_fields = analysis
        .and_then(|a| a.custom_analysis_data.clone())
        .unwrap_or_else(|| Value::Object(Default::default()));
    let booking_created = extracted_fields
        .get("booking_created")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    CallAnalysis {
        call_id: call.call_id.clone(),
        summary: analysis.and_then(|a| a.call_summary.clone()),
        sentiment: analysis.and_then(|a| a.user_sentiment.clone()),
        successful: analysis.and_then(|a| a.call_successful).unwrap_or(false),
        booking_created,
        transcript: call.transcript.clone(),
        extracted_fields,
        analyzed_at,
    }
}

pub fn parse_payload(body: &Value) -> Result<WebhookPayload, ApiError> {
    let payload: WebhookPayload =
        serde_json::from_value(body.clone()).map_err(ApiError::from_decode)?;
    if payload.call.call_id.trim().is_empty() {
        return Err(ApiError::missing_field("call.call_id"));
    }
    Ok(payload)
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// RFC 3339 string, or epoch number (milliseconds when large, else seconds).
fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        Value::Number(n) => {
            let n = n.as_i64()?;
            if n > 100_000_000_000 {
                from_millis(n)
            } else {
                Utc.timestamp_opt(n, 0).single()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const START: i64 = 1_761_998_400_000;
    const END: i64 = 1_761_998_700_000;

    fn call(extra: Value) -> RetellCall {
        let mut base = json!({
            "call_id": "call_1",
            "agent_id": "agent_ext",
            "direction": "inbound",
            "from_number": "+12025550100",
            "to_number": "+12025551234",
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).unwrap()
    }

    fn event(kind: CallEventKind, extra: Value) -> CallEvent {
        let tenant = Uuid::from_u128(1);
        CallEvent::new(kind, tenant, None, &call(extra), json!({ "event": kind.as_str() }))
    }

    fn started() -> CallEvent {
        event(CallEventKind::Started, json!({ "start_timestamp": START }))
    }

    fn ended() -> CallEvent {
        event(
            CallEventKind::Ended,
            json!({
                "start_timestamp": START - 5_000,
                "end_timestamp": END,
                "disconnection_reason": "user_hangup",
                "call_cost": { "combined_cost": 42.4 }
            }),
        )
    }

    fn analyzed() -> CallEvent {
        event(
            CallEventKind::Analyzed,
            json!({
                "start_timestamp": START - 9_000,
                "end_timestamp": END + 9_000,
                "call_cost": { "combined_cost": 99.0 }
            }),
        )
    }

    fn apply_all(events: &[&CallEvent]) -> CallRecord {
        let mut current: Option<CallRecord> = None;
        for e in events {
            current = Some(merge(current, e));
        }
        let mut record = current.unwrap();
        record.id = Uuid::nil();
        record
    }

    #[test]
    fn canonical_order() {
        let record = apply_all(&[&started(), &ended(), &analyzed()]);
        assert_eq!(record.status, CallStatus::Ended);
        assert_eq!(record.started_at, from_millis(START));
        assert_eq!(record.ended_at, from_millis(END));
        assert_eq!(record.cost_cents, Some(42));
        assert_eq!(record.last_event, 3);
        assert_eq!(record.raw_payload["event"], "call_analyzed");
    }

    #[test]
    fn every_permutation_with_duplicates_converges() {
        let (s, e, a) = (started(), ended(), analyzed());
        let canonical = apply_all(&[&s, &e, &a]);
        let orders: Vec<Vec<&CallEvent>> = vec![
            vec![&s, &a, &e],
            vec![&e, &s, &a],
            vec![&e, &a, &s],
            vec![&a, &s, &e],
            vec![&a, &e, &s],
            vec![&e, &e, &s, &a, &s],
            vec![&a, &a, &e, &s, &e],
            vec![&s, &s, &e, &a, &a],
        ];
        for order in orders {
            let names: Vec<_> = order.iter().map(|e| e.kind.as_str()).collect();
            assert_eq!(apply_all(&order), canonical, "order {names:?}");
        }
    }

    #[test]
    fn end_before_start_keeps_both_timestamps() {
        let record = apply_all(&[&ended(), &started()]);
        assert_eq!(record.status, CallStatus::Ended);
        assert_eq!(record.started_at, from_millis(START));
        assert_eq!(record.ended_at, from_millis(END));
    }

    #[test]
    fn failed_disconnection_marks_failed() {
        let e = event(
            CallEventKind::Ended,
            json!({ "end_timestamp": END, "disconnection_reason": "dial_no_answer" }),
        );
        let record = merge(None, &e);
        assert_eq!(record.status, CallStatus::Failed);
    }

    #[test]
    fn started_alone_is_in_progress() {
        let record = merge(None, &started());
        assert_eq!(record.status, CallStatus::InProgress);
        assert_eq!(record.ended_at, None);
    }

    #[test]
    fn end_is_clamped_to_start() {
        let late_start = event(
            CallEventKind::Started,
            json!({ "start_timestamp": END + 60_000 }),
        );
        let record = apply_all(&[&ended(), &late_start]);
        assert!(record.ended_at >= record.started_at);
    }

    #[test]
    fn analysis_prefers_payload_timestamp() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "event": "call_analyzed",
            "analyzed_at": "2025-11-01T14:30:00Z",
            "call": {
                "call_id": "call_1",
                "transcript": "Agent: hi",
                "call_analysis": {
                    "call_summary": "Booked a haircut",
                    "user_sentiment": "Positive",
                    "call_successful": true,
                    "custom_analysis_data": { "booking_created": true }
                }
            }
        }))
        .unwrap();
        let fallback = Utc.timestamp_opt(0, 0).unwrap();
        let analysis = analysis_from(&payload, fallback);
        assert_eq!(analysis.analyzed_at.to_rfc3339(), "2025-11-01T14:30:00+00:00");
        assert!(analysis.booking_created);
        assert!(analysis.successful);
        assert_eq!(analysis.summary.as_deref(), Some("Booked a haircut"));
    }

    #[test]
    fn analysis_falls_back_to_webhook_timestamp() {
        let payload = parse_payload(&json!({ "call": { "call_id": "c" } })).unwrap();
        let fallback = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(analysis_from(&payload, fallback).analyzed_at, fallback);
    }

    #[test]
    fn epoch_instants() {
        assert_eq!(
            parse_instant(&json!(1_700_000_000)),
            Utc.timestamp_opt(1_700_000_000, 0).single()
        );
        assert_eq!(
            parse_instant(&json!(1_700_000_000_123_i64)),
            from_millis(1_700_000_000_123)
        );
    }

    #[test]
    fn missing_call_id_is_rejected() {
        let err = parse_payload(&json!({ "call": { "call_id": " " } })).unwrap_err();
        assert_eq!(err.kind(), "validation/missing-field");
        let err = parse_payload(&json!({ "event": "call_started" })).unwrap_err();
        assert_eq!(err.kind(), "validation/missing-field");
    }
}
