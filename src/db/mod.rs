//! Persistence: entity models and the store traits the handlers depend on.
//!
//! `postgres::PgStore` is the production implementation. Tests run against
//! `memory::MemoryStore`, which shares the lifecycle merge with the Postgres
//! store so both apply webhook events identically.

#[cfg(test)]
pub mod memory;
pub mod postgres;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::webhooks::lifecycle::CallEvent;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("cross-tenant write rejected for {0}")]
    TenantMismatch(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Text-backed enums stored as lowercase strings.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DbError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DbError::Corrupt(format!(
                        "unknown {} value {other:?}",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

text_enum!(TenantStatus {
    Pending => "pending",
    Active => "active",
    Suspended => "suspended",
});

text_enum!(AgentStatus {
    Draft => "draft",
    Active => "active",
    Paused => "paused",
});

text_enum!(AssignmentStatus {
    Active => "active",
    Released => "released",
});

text_enum!(AssignmentType {
    New => "new",
    Existing => "existing",
});

text_enum!(CallStatus {
    InProgress => "in_progress",
    Ended => "ended",
    Failed => "failed",
});

text_enum!(TaskKind {
    SendEmail => "send_email",
    SendSms => "send_sms",
    PhoneNumbers => "phone_numbers",
});

text_enum!(TaskState {
    Pending => "pending",
    InFlight => "in_flight",
    Done => "done",
    Dead => "dead",
});

#[derive(Debug, Clone, PartialEq)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub business_name: String,
    pub timezone: String,
    pub status: TenantStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub booking_access_token: Option<String>,
    pub booking_location_id: Option<String>,
    pub auto_create_customers: bool,
    pub notification_email: Option<String>,
}

impl Tenant {
    /// The tenant's IANA zone. Unknown names fall back to UTC.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            tracing::warn!(tenant_id = %self.id, timezone = %self.timezone, "Invalid tenant timezone, using UTC");
            chrono_tz::UTC
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_agent_id: String,
    pub bearer_token_hash: String,
    pub status: AgentStatus,
    pub voice_profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhoneAssignment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub external_phone_id: Option<String>,
    pub phone_number: String,
    pub status: AssignmentStatus,
    pub forwarding_number: Option<String>,
    pub assignment_type: AssignmentType,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct NewPhoneAssignment {
    pub tenant_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub external_phone_id: Option<String>,
    pub phone_number: String,
    pub forwarding_number: Option<String>,
    pub assignment_type: AssignmentType,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub call_id: String,
    pub direction: Option<String>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: CallStatus,
    pub cost_cents: Option<i64>,
    pub disconnection_reason: Option<String>,
    /// Rank of the lifecycle event whose payload is in `raw_payload`.
    pub last_event: i16,
    pub raw_payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallAnalysis {
    pub call_id: String,
    pub summary: Option<String>,
    pub sentiment: Option<String>,
    pub successful: bool,
    pub booking_created: bool,
    pub transcript: Option<String>,
    pub extracted_fields: Value,
    pub analyzed_at: DateTime<Utc>,
}

/// Outcome of a monotonic analysis write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisWrite {
    Inserted,
    Overwritten,
    /// The stored analysis is as new or newer; nothing changed.
    Kept,
}

/// A stored response, replayed byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// This caller owns the key and must complete or release it.
    Acquired,
    /// Another caller holds the key and has not finished.
    InFlight,
    Completed(Snapshot),
}

/// Unfinished claims older than this are taken over by the next caller.
pub const CLAIM_LEASE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub kind: TaskKind,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    pub payload: Value,
    pub state: TaskState,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn tenant(&self, id: Uuid) -> Result<Option<Tenant>, DbError>;
    async fn agent(&self, id: Uuid) -> Result<Option<Agent>, DbError>;
    async fn agent_by_external_id(&self, external_agent_id: &str)
        -> Result<Option<Agent>, DbError>;
    /// Active assignments for an E.164 number, across all tenants.
    async fn active_assignments(&self, phone_number: &str)
        -> Result<Vec<PhoneAssignment>, DbError>;
    async fn owner_emails(&self, tenant_id: Uuid) -> Result<Vec<String>, DbError>;
}

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn call_record(&self, call_id: &str) -> Result<Option<CallRecord>, DbError>;
    /// Merge a lifecycle event into the stored record under a row lock.
    async fn apply_call_event(&self, event: &CallEvent) -> Result<CallRecord, DbError>;
    /// Write the analysis when it is newer than the stored one. `follow_ups`
    /// are enqueued in the same transaction, only when something was written.
    async fn write_analysis(
        &self,
        analysis: &CallAnalysis,
        follow_ups: &[NewTask],
    ) -> Result<AnalysisWrite, DbError>;
    async fn analysis(&self, call_id: &str) -> Result<Option<CallAnalysis>, DbError>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn claim(
        &self,
        key: &str,
        tenant_id: Option<Uuid>,
        route: &str,
        ttl: Duration,
    ) -> Result<Claim, DbError>;
    async fn complete(&self, key: &str, snapshot: &Snapshot) -> Result<(), DbError>;
    /// Drop an unfinished claim so a retry can proceed.
    async fn release(&self, key: &str) -> Result<(), DbError>;
    async fn purge_expired(&self) -> Result<u64, DbError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn enqueue(&self, task: &NewTask) -> Result<Uuid, DbError>;
    /// Lease up to `batch` due tasks: marks them in flight, bumps `attempts`
    /// and pushes `next_attempt_at` out by `lease` so a crashed worker's tasks
    /// come due again.
    async fn lease_due(&self, batch: i64, lease: Duration) -> Result<Vec<Task>, DbError>;
    async fn mark_done(&self, id: Uuid) -> Result<(), DbError>;
    async fn schedule_retry(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), DbError>;
    async fn mark_dead(&self, id: Uuid, error: &str) -> Result<(), DbError>;
    async fn task(&self, id: Uuid) -> Result<Option<Task>, DbError>;
}

#[async_trait]
pub trait PhoneStore: Send + Sync {
    /// Record an assignment while holding the tenant row lock.
    async fn record_assignment(
        &self,
        assignment: &NewPhoneAssignment,
    ) -> Result<PhoneAssignment, DbError>;
    /// Mark the tenant's active assignment for `phone_number` released.
    async fn release_assignment(
        &self,
        tenant_id: Uuid,
        phone_number: &str,
    ) -> Result<Option<PhoneAssignment>, DbError>;
    async fn active_assignment(
        &self,
        tenant_id: Uuid,
        phone_number: &str,
    ) -> Result<Option<PhoneAssignment>, DbError>;
}

/// Everything the HTTP layer needs from persistence.
pub trait Store: TenantStore + CallStore + IdempotencyStore + TaskStore + PhoneStore {}

impl<T> Store for T where T: TenantStore + CallStore + IdempotencyStore + TaskStore + PhoneStore {}
