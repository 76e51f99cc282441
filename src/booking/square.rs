//! Square v2 wire types. Only the fields this service reads.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AvailabilityResponse {
    #[serde(default)]
    pub availabilities: Vec<Availability>,
}

#[derive(Debug, Deserialize)]
pub struct Availability {
    pub start_at: DateTime<Utc>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub appointment_segments: Vec<AppointmentSegment>,
}

#[derive(Debug, Deserialize)]
pub struct AppointmentSegment {
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    pub service_variation_id: String,
    #[serde(default)]
    pub team_member_id: Option<String>,
    #[serde(default)]
    pub service_variation_version: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BookingEnvelope {
    pub booking: BookingObject,
}

#[derive(Debug, Deserialize)]
pub struct BookingObject {
    pub id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub status: Option<String>,
    pub start_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CustomerSearchResponse {
    #[serde(default)]
    pub customers: Vec<CustomerObject>,
}

#[derive(Debug, Deserialize)]
pub struct CustomerEnvelope {
    pub customer: CustomerObject,
}

#[derive(Debug, Deserialize)]
pub struct CustomerObject {
    pub id: String,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}
