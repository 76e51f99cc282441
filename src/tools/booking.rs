use axum::extract::State;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;

use super::idempotency::{self, Acquired};
use super::{availability, run, Budget, ToolCall, ToolReply};
use crate::booking::{Booking, NewBooking, Slot};
use crate::db::{Snapshot, Tenant};
use crate::error::ApiError;
use crate::phone::{redact, require_e164};
use crate::provider::ProviderError;
use crate::AppState;

const ALTERNATES: usize = 3;
/// How far past the requested start to look for the slot and alternates.
const SEARCH_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBooking {
    customer_phone: String,
    service_id: String,
    start_at: String,
    #[serde(default)]
    staff_id: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    customer_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBooking {
    booking_id: String,
    version: i64,
}

/// Short code read back to the caller; derived from the booking id so a
/// replay always reads the same code.
pub fn confirmation_number(booking_id: &str) -> String {
    let tail: Vec<char> = booking_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    tail[tail.len().saturating_sub(6)..]
        .iter()
        .collect::<String>()
        .to_ascii_uppercase()
}

fn parse_start(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| ApiError::invalid_field("startAt", "expected an RFC 3339 timestamp"))
}

fn valid_booking_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 192
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Up to three open slots at or after `after`, other than the one that failed.
pub fn alternates(slots: &[Slot], after: DateTime<Utc>) -> Vec<Slot> {
    slots
        .iter()
        .filter(|s| s.start_at > after)
        .take(ALTERNATES)
        .cloned()
        .collect()
}

fn snapshot(body: serde_json::Value) -> Result<Snapshot, ApiError> {
    Ok(Snapshot {
        status: 200,
        body: serde_json::to_string(&body)
            .map_err(|e| ApiError::internal(format!("snapshot encode: {e}")))?,
    })
}

struct BookingRequest<'a> {
    tenant: &'a Tenant,
    args: &'a CreateBooking,
    phone: &'a str,
    start_at: DateTime<Utc>,
    idempotency_key: &'a str,
}

async fn book(
    state: &AppState,
    budget: &Budget,
    req: &BookingRequest<'_>,
) -> Result<(Booking, Slot), ApiError> {
    let tenant = req.tenant;
    let slots = availability::search(
        &state.booking,
        budget,
        tenant,
        &req.args.service_id,
        req.args.staff_id.as_deref(),
        req.start_at,
        SEARCH_DAYS,
    )
    .await?;

    let Some(slot) = slots.iter().find(|s| s.start_at == req.start_at).cloned() else {
        tracing::info!(start_at = %req.start_at, "Requested slot not offered");
        return Err(ApiError::SlotUnavailable {
            alternates: alternates(&slots, req.start_at),
        });
    };

    let customer = match budget
        .call(
            "find_customer",
            state.booking.find_customer_by_phone(tenant, req.phone),
        )
        .await?
    {
        Some(c) => c,
        None => {
            let key = idempotency::key(tenant.id, "create-customer", &[req.phone]);
            budget
                .call(
                    "create_customer",
                    state.booking.create_customer(
                        tenant,
                        req.phone,
                        req.args.customer_name.as_deref(),
                        &key,
                    ),
                )
                .await?
        }
    };

    let created = budget
        .call(
            "create_booking",
            state.booking.create_booking(
                tenant,
                &NewBooking {
                    slot: &slot,
                    customer_id: &customer.id,
                    note: req.args.notes.as_deref(),
                    idempotency_key: req.idempotency_key,
                },
            ),
        )
        .await;

    match created {
        Ok(booking) => Ok((booking, slot)),
        Err(ProviderError::Conflict { .. }) => {
            tracing::info!(start_at = %req.start_at, "Slot taken at booking time");
            Err(ApiError::SlotUnavailable {
                alternates: alternates(&slots, req.start_at),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// POST /api/tools/create-booking
pub async fn create_booking(
    State(state): State<AppState>,
    call: ToolCall,
) -> Result<ToolReply, ApiError> {
    let args: CreateBooking = call.args()?;
    let phone = require_e164("customerPhone", &args.customer_phone)?;
    if args.service_id.trim().is_empty() {
        return Err(ApiError::missing_field("serviceId"));
    }
    let start_at = parse_start(&args.start_at)?;
    let canonical_start = start_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let tenant = &call.tenant.tenant;

    // Without a call id the caller's number stands in, so two calls never
    // share a booking.
    let call_scope = match call.metadata.call_id() {
        Some(id) => id.to_string(),
        None => {
            tracing::warn!(phone = %redact(&phone), "create-booking without a call id");
            format!("phone:{phone}")
        }
    };
    let key = idempotency::key(
        tenant.id,
        "create-booking",
        &[&call_scope, args.service_id.trim(), &canonical_start],
    );

    run("create-booking", |budget| async move {
        let guard = match idempotency::acquire(&state.store, &key, Some(tenant.id), "create-booking").await? {
            Acquired::Replay(snapshot) => return Ok(ToolReply::Raw(snapshot)),
            Acquired::Owner(guard) => guard,
        };

        let (booking, slot) = book(
            &state,
            &budget,
            &BookingRequest {
                tenant,
                args: &args,
                phone: &phone,
                start_at,
                idempotency_key: guard.key(),
            },
        )
        .await?;

        let stored = snapshot(json!({
            "bookingId": booking.id,
            "confirmationNumber": confirmation_number(&booking.id),
            "startAt": booking.start_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "serviceId": slot.service_id,
            "staffId": slot.staff_id,
            "slow": budget.is_slow(),
        }))?;
        guard.complete(&stored).await?;
        Ok(ToolReply::Raw(stored))
    })
    .await
}

/// POST /api/tools/cancel-booking
pub async fn cancel_booking(
    State(state): State<AppState>,
    call: ToolCall,
) -> Result<ToolReply, ApiError> {
    let args: CancelBooking = call.args()?;
    let booking_id = args.booking_id.trim().to_string();
    if !valid_booking_id(&booking_id) {
        return Err(ApiError::invalid_field("bookingId", "unexpected characters"));
    }
    let tenant = &call.tenant.tenant;
    let key = idempotency::key(tenant.id, "cancel-booking", &[&booking_id]);

    run("cancel-booking", |budget| async move {
        let guard = match idempotency::acquire(&state.store, &key, Some(tenant.id), "cancel-booking").await? {
            Acquired::Replay(snapshot) => return Ok(ToolReply::Raw(snapshot)),
            Acquired::Owner(guard) => guard,
        };
        let cancelled = budget
            .call(
                "cancel_booking",
                state
                    .booking
                    .cancel_booking(tenant, &booking_id, args.version, guard.key()),
            )
            .await?;
        let stored = snapshot(json!({
            "ok": true,
            "bookingId": cancelled.id,
            "status": cancelled.status,
            "slow": budget.is_slow(),
        }))?;
        guard.complete(&stored).await?;
        Ok(ToolReply::Raw(stored))
    })
    .await
}
