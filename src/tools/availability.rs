use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use moka::future::Cache;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{run, Budget, ToolCall, ToolReply};
use crate::booking::{AvailabilityQuery, BookingClient, Slot, MAX_WINDOW_DAYS};
use crate::db::Tenant;
use crate::error::ApiError;
use crate::AppState;

pub const MAX_SLOTS: usize = 20;
const DEFAULT_WINDOW_DAYS: i64 = 14;
const CACHE_TTL: Duration = Duration::from_secs(30);

/// Short-lived availability results, per tenant and query.
#[derive(Clone)]
pub struct AvailabilityCache {
    inner: Cache<String, Arc<Vec<Slot>>>,
}

impl AvailabilityCache {
    pub fn new() -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(5_000)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckAvailability {
    service_id: String,
    #[serde(rename = "dateISO", alias = "dateIso", alias = "date")]
    date_iso: String,
    #[serde(default)]
    staff_id: Option<String>,
    #[serde(default)]
    window_days: Option<i64>,
}

/// A calendar date is local midnight in the tenant's zone; anything else
/// must be a full RFC 3339 instant.
pub fn window_start(date_iso: &str, tz: Tz) -> Result<DateTime<Utc>, ApiError> {
    let s = date_iso.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(s) {
        return Ok(instant.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ApiError::invalid_field("dateISO", "expected YYYY-MM-DD or RFC 3339"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ApiError::invalid_field("dateISO", "no such date"))?;
    // Midnight can fall in a DST gap; take the first valid local instant.
    let local = tz
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(midnight + chrono::Duration::hours(1))).earliest())
        .ok_or_else(|| ApiError::invalid_field("dateISO", "no such local time"))?;
    Ok(local.with_timezone(&Utc))
}

/// Search the booking platform, sorted by start time and capped.
pub async fn search(
    booking: &BookingClient,
    budget: &Budget,
    tenant: &Tenant,
    service_id: &str,
    staff_id: Option<&str>,
    from: DateTime<Utc>,
    days: i64,
) -> Result<Vec<Slot>, ApiError> {
    let query = AvailabilityQuery {
        service_id,
        staff_id,
        from,
        to: from + chrono::Duration::days(days),
    };
    let mut slots = budget
        .call("search_availability", booking.search_availability(tenant, &query))
        .await?;
    if let Some(staff) = staff_id {
        slots.retain(|s| s.staff_id.as_deref().map_or(true, |id| id == staff));
    }
    slots.sort_by_key(|s| s.start_at);
    Ok(slots)
}

fn cache_key(tenant_id: Uuid, args: &CheckAvailability, days: i64) -> String {
    format!(
        "{tenant_id}|{}|{}|{}|{days}",
        args.service_id,
        args.date_iso.trim(),
        args.staff_id.as_deref().unwrap_or("")
    )
}

/// POST /api/tools/check-availability
pub async fn check_availability(
    State(state): State<AppState>,
    call: ToolCall,
) -> Result<ToolReply, ApiError> {
    let args: CheckAvailability = call.args()?;
    if args.service_id.trim().is_empty() {
        return Err(ApiError::missing_field("serviceId"));
    }
    let days = args.window_days.unwrap_or(DEFAULT_WINDOW_DAYS);
    if !(1..=MAX_WINDOW_DAYS).contains(&days) {
        return Err(ApiError::invalid_field(
            "windowDays",
            format!("must be between 1 and {MAX_WINDOW_DAYS}"),
        ));
    }
    let tenant = &call.tenant.tenant;
    let tz = tenant.tz();
    let start = window_start(&args.date_iso, tz)?;

    run("check-availability", |budget| async move {
        let key = cache_key(tenant.id, &args, days);
        let slots = match state.availability.inner.get(&key).await {
            Some(hit) => {
                tracing::debug!("Availability cache hit");
                hit
            }
            None => {
                // The platform rejects ranges that start in the past.
                let from = start.max(Utc::now());
                let found = search(
                    &state.booking,
                    &budget,
                    tenant,
                    &args.service_id,
                    args.staff_id.as_deref(),
                    from,
                    days,
                )
                .await?;
                let found = Arc::new(found);
                state.availability.inner.insert(key, found.clone()).await;
                found
            }
        };

        let shown: Vec<&Slot> = slots.iter().take(MAX_SLOTS).collect();
        Ok(ToolReply::Fresh(json!({
            "slots": shown,
            "count": shown.len(),
            "timezone": tz.name(),
        })))
    })
    .await
}
