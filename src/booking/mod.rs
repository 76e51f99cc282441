//! Booking platform adapter (Square v2 REST), authenticated per tenant.

mod square;

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::BookingConfig;
use crate::db::Tenant;
use crate::provider::{execute, ProviderError, Safety};

pub const PROVIDER: &str = "booking";

/// Square rejects availability ranges longer than 32 days.
pub const MAX_WINDOW_DAYS: i64 = 31;

/// A bookable start time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub start_at: DateTime<Utc>,
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staff_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    #[serde(skip)]
    pub service_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Customer {
    pub fn display_name(&self) -> Option<String> {
        match (&self.given_name, &self.family_name) {
            (Some(g), Some(f)) => Some(format!("{g} {f}")),
            (Some(n), None) | (None, Some(n)) => Some(n.clone()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Booking {
    pub id: String,
    pub version: i64,
    pub status: Option<String>,
    pub start_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AvailabilityQuery<'a> {
    pub service_id: &'a str,
    pub staff_id: Option<&'a str>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBooking<'a> {
    pub slot: &'a Slot,
    pub customer_id: &'a str,
    pub note: Option<&'a str>,
    pub idempotency_key: &'a str,
}

impl From<square::Availability> for Slot {
    fn from(a: square::Availability) -> Self {
        let segment = a.appointment_segments.into_iter().next();
        Slot {
            start_at: a.start_at,
            service_id: segment
                .as_ref()
                .map(|s| s.service_variation_id.clone())
                .unwrap_or_default(),
            staff_id: segment.as_ref().and_then(|s| s.team_member_id.clone()),
            duration_minutes: segment.as_ref().and_then(|s| s.duration_minutes),
            service_version: segment.and_then(|s| s.service_variation_version),
        }
    }
}

impl From<square::CustomerObject> for Customer {
    fn from(c: square::CustomerObject) -> Self {
        Customer {
            id: c.id,
            given_name: c.given_name,
            family_name: c.family_name,
            phone: c.phone_number,
            email: c.email_address,
        }
    }
}

impl From<square::BookingObject> for Booking {
    fn from(b: square::BookingObject) -> Self {
        Booking {
            id: b.id,
            version: b.version,
            status: b.status,
            start_at: b.start_at,
        }
    }
}

/// Drop `null` members so optional fields are omitted rather than sent empty.
fn compact(mut value: Value) -> Value {
    if let Some(fields) = value.as_object_mut() {
        fields.retain(|_, v| !v.is_null());
        for v in fields.values_mut() {
            *v = compact(v.take());
        }
    } else if let Some(items) = value.as_array_mut() {
        for v in items.iter_mut() {
            *v = compact(v.take());
        }
    }
    value
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct BookingClient {
    client: reqwest::Client,
    api_base: String,
    api_version: String,
}

impl BookingClient {
    pub fn new(config: &BookingConfig) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
        })
    }

    fn request(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_base))
            .bearer_auth(token)
            .header("Square-Version", &self.api_version)
    }

    fn token(tenant: &Tenant) -> Result<&str, ProviderError> {
        tenant
            .booking_access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::invalid(PROVIDER, "tenant has no booking connection"))
    }

    fn location(tenant: &Tenant) -> Result<&str, ProviderError> {
        tenant
            .booking_location_id
            .as_deref()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ProviderError::invalid(PROVIDER, "tenant has no booking location"))
    }

    /// Open start times for a service in `[from, to)`.
    pub async fn search_availability(
        &self,
        tenant: &Tenant,
        query: &AvailabilityQuery<'_>,
    ) -> Result<Vec<Slot>, ProviderError> {
        let token = Self::token(tenant)?;
        let location = Self::location(tenant)?;
        let mut segment = json!({ "service_variation_id": query.service_id });
        if let Some(staff) = query.staff_id {
            segment["team_member_id_filter"] = json!({ "any": [staff] });
        }
        let body = json!({
            "query": {
                "filter": {
                    "start_at_range": {
                        "start_at": rfc3339(query.from),
                        "end_at": rfc3339(query.to),
                    },
                    "location_id": location,
                    "segment_filters": [segment],
                }
            }
        });

        let resp: square::AvailabilityResponse = execute(PROVIDER, Safety::Read, || {
            self.request(Method::POST, "/v2/bookings/availability/search", token)
                .json(&body)
        })
        .await?;
        Ok(resp.availabilities.into_iter().map(Slot::from).collect())
    }

    /// Create a booking. The idempotency key goes both in the header and the
    /// body so a retried request cannot book twice.
    pub async fn create_booking(
        &self,
        tenant: &Tenant,
        booking: &NewBooking<'_>,
    ) -> Result<Booking, ProviderError> {
        let token = Self::token(tenant)?;
        let location = Self::location(tenant)?;
        let slot = booking.slot;
        let body = compact(json!({
            "idempotency_key": booking.idempotency_key,
            "booking": {
                "start_at": rfc3339(slot.start_at),
                "location_id": location,
                "customer_id": booking.customer_id,
                "customer_note": booking.note,
                "appointment_segments": [{
                    "service_variation_id": slot.service_id,
                    "service_variation_version": slot.service_version,
                    "team_member_id": slot.staff_id,
                    "duration_minutes": slot.duration_minutes,
                }],
            }
        }));

        let resp: square::BookingEnvelope = execute(PROVIDER, Safety::KeyedWrite, || {
            self.request(Method::POST, "/v2/bookings", token)
                .header("Idempotency-Key", booking.idempotency_key)
                .json(&body)
        })
        .await
        .map_err(slot_conflict)?;

        let created = Booking::from(resp.booking);
        tracing::info!(booking_id = %created.id, start_at = %created.start_at, "Booking created");
        Ok(created)
    }

    pub async fn cancel_booking(
        &self,
        tenant: &Tenant,
        booking_id: &str,
        version: i64,
        idempotency_key: &str,
    ) -> Result<Booking, ProviderError> {
        let token = Self::token(tenant)?;
        let body = json!({
            "idempotency_key": idempotency_key,
            "booking_version": version,
        });
        let path = format!("/v2/bookings/{booking_id}/cancel");
        let resp: square::BookingEnvelope = execute(PROVIDER, Safety::KeyedWrite, || {
            self.request(Method::POST, &path, token)
                .header("Idempotency-Key", idempotency_key)
                .json(&body)
        })
        .await?;
        tracing::info!(booking_id, "Booking cancelled");
        Ok(Booking::from(resp.booking))
    }

    pub async fn find_customer_by_phone(
        &self,
        tenant: &Tenant,
        phone: &str,
    ) -> Result<Option<Customer>, ProviderError> {
        let token = Self::token(tenant)?;
        let body = json!({
            "query": { "filter": { "phone_number": { "exact": phone } } },
            "limit": 1,
        });
        let resp: square::CustomerSearchResponse = execute(PROVIDER, Safety::Read, || {
            self.request(Method::POST, "/v2/customers/search", token)
                .json(&body)
        })
        .await?;
        Ok(resp.customers.into_iter().next().map(Customer::from))
    }

    pub async fn create_customer(
        &self,
        tenant: &Tenant,
        phone: &str,
        name: Option<&str>,
        idempotency_key: &str,
    ) -> Result<Customer, ProviderError> {
        let token = Self::token(tenant)?;
        let (given, family) = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(n) => match n.split_once(' ') {
                Some((g, f)) => (Some(g), Some(f.trim())),
                None => (Some(n), None),
            },
            None => (None, None),
        };
        let body = compact(json!({
            "idempotency_key": idempotency_key,
            "phone_number": phone,
            "given_name": given,
            "family_name": family,
            "note": "Created by the phone receptionist",
        }));
        let resp: square::CustomerEnvelope = execute(PROVIDER, Safety::KeyedWrite, || {
            self.request(Method::POST, "/v2/customers", token)
                .header("Idempotency-Key", idempotency_key)
                .json(&body)
        })
        .await?;
        let customer = Customer::from(resp.customer);
        tracing::info!(customer_id = %customer.id, "Customer created");
        Ok(customer)
    }
}

/// Square reports a taken slot as a 400 with an availability error code.
fn slot_conflict(err: ProviderError) -> ProviderError {
    match err {
        ProviderError::Invalid { provider, message }
            if message.contains("BOOKING_SLOT") || message.to_lowercase().contains("not available") =>
        {
            ProviderError::Conflict { provider, message }
        }
        other => other,
    }
}
