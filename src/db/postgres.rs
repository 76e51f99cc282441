use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::{
    Agent, AnalysisWrite, CallAnalysis, CallRecord, CallStore, Claim, DbError, IdempotencyStore,
    NewPhoneAssignment, NewTask, PhoneAssignment, PhoneStore, Snapshot, Task, TaskStore, Tenant,
    TenantStore, CLAIM_LEASE,
};
use crate::config::DatabaseConfig;
use crate::webhooks::lifecycle::{self, CallEvent};

pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .connect(&config.url)
        .await
}

/// Apply pending forward-only migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unique_violation(err: sqlx::Error, what: &str) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            DbError::Conflict(what.to_string())
        }
        _ => DbError::Sqlx(err),
    }
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant, DbError> {
    Ok(Tenant {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        business_name: row.try_get("business_name")?,
        timezone: row.try_get("timezone")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        trial_ends_at: row.try_get("trial_ends_at")?,
        booking_access_token: row.try_get("booking_access_token")?,
        booking_location_id: row.try_get("booking_location_id")?,
        auto_create_customers: row.try_get("auto_create_customers")?,
        notification_email: row.try_get("notification_email")?,
    })
}

fn agent_from_row(row: &PgRow) -> Result<Agent, DbError> {
    Ok(Agent {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        external_agent_id: row.try_get("external_agent_id")?,
        bearer_token_hash: row.try_get("bearer_token_hash")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        voice_profile: row.try_get("voice_profile")?,
    })
}

fn assignment_from_row(row: &PgRow) -> Result<PhoneAssignment, DbError> {
    Ok(PhoneAssignment {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        agent_id: row.try_get("agent_id")?,
        external_phone_id: row.try_get("external_phone_id")?,
        phone_number: row.try_get("phone_number")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        forwarding_number: row.try_get("forwarding_number")?,
        assignment_type: row.try_get::<String, _>("assignment_type")?.parse()?,
        metadata: row.try_get("metadata")?,
    })
}

fn call_from_row(row: &PgRow) -> Result<CallRecord, DbError> {
    Ok(CallRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        agent_id: row.try_get("agent_id")?,
        call_id: row.try_get("call_id")?,
        direction: row.try_get("direction")?,
        from_number: row.try_get("from_number")?,
        to_number: row.try_get("to_number")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        cost_cents: row.try_get("cost_cents")?,
        disconnection_reason: row.try_get("disconnection_reason")?,
        last_event: row.try_get("last_event")?,
        raw_payload: row.try_get("raw_payload")?,
    })
}

fn analysis_from_row(row: &PgRow) -> Result<CallAnalysis, DbError> {
    Ok(CallAnalysis {
        call_id: row.try_get("call_id")?,
        summary: row.try_get("summary")?,
        sentiment: row.try_get("sentiment")?,
        successful: row.try_get("successful")?,
        booking_created: row.try_get("booking_created")?,
        transcript: row.try_get("transcript")?,
        extracted_fields: row.try_get("extracted_fields")?,
        analyzed_at: row.try_get("analyzed_at")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<Task, DbError> {
    Ok(Task {
        id: row.try_get("id")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        payload: row.try_get("payload")?,
        state: row.try_get::<String, _>("state")?.parse()?,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl TenantStore for PgStore {
    async fn tenant(&self, id: Uuid) -> Result<Option<Tenant>, DbError> {
        let row = sqlx::query(
            "SELECT id, slug, business_name, timezone, status, trial_ends_at, \
                    booking_access_token, booking_location_id, auto_create_customers, \
                    notification_email \
             FROM tenants WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn agent(&self, id: Uuid) -> Result<Option<Agent>, DbError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, external_agent_id, bearer_token_hash, status, voice_profile \
             FROM agents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn agent_by_external_id(
        &self,
        external_agent_id: &str,
    ) -> Result<Option<Agent>, DbError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, external_agent_id, bearer_token_hash, status, voice_profile \
             FROM agents WHERE external_agent_id = $1",
        )
        .bind(external_agent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn active_assignments(
        &self,
        phone_number: &str,
    ) -> Result<Vec<PhoneAssignment>, DbError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, agent_id, external_phone_id, phone_number, status, \
                    forwarding_number, assignment_type, metadata \
             FROM phone_assignments WHERE phone_number = $1 AND status = 'active'",
        )
        .bind(phone_number)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(assignment_from_row).collect()
    }

    async fn owner_emails(&self, tenant_id: Uuid) -> Result<Vec<String>, DbError> {
        let emails = sqlx::query_scalar::<_, String>(
            "SELECT email FROM users WHERE tenant_id = $1 AND role = 'owner' ORDER BY email",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(emails)
    }
}

#[async_trait]
impl CallStore for PgStore {
    async fn call_record(&self, call_id: &str) -> Result<Option<CallRecord>, DbError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, agent_id, call_id, direction, from_number, to_number, \
                    started_at, ended_at, status, cost_cents, disconnection_reason, \
                    last_event, raw_payload \
             FROM call_records WHERE call_id = $1",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(call_from_row).transpose()
    }

    async fn apply_call_event(&self, event: &CallEvent) -> Result<CallRecord, DbError> {
        // A concurrent first insert makes ours a no-op; go round again and
        // merge into the row that won.
        for _ in 0..3 {
            let mut tx = self.pool.begin().await?;
            let existing = sqlx::query(
                "SELECT id, tenant_id, agent_id, call_id, direction, from_number, to_number, \
                        started_at, ended_at, status, cost_cents, disconnection_reason, \
                        last_event, raw_payload \
                 FROM call_records WHERE call_id = $1 FOR UPDATE",
            )
            .bind(&event.call_id)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(call_from_row)
            .transpose()?;

            if let Some(current) = &existing {
                if current.tenant_id != event.tenant_id {
                    return Err(DbError::TenantMismatch(event.call_id.clone()));
                }
            }

            let is_new = existing.is_none();
            let merged = lifecycle::merge(existing, event);

            if is_new {
                let inserted = sqlx::query(
                    "INSERT INTO call_records (id, tenant_id, agent_id, call_id, direction, \
                         from_number, to_number, started_at, ended_at, status, cost_cents, \
                         disconnection_reason, last_event, raw_payload) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
                     ON CONFLICT (call_id) DO NOTHING",
                )
                .bind(merged.id)
                .bind(merged.tenant_id)
                .bind(merged.agent_id)
                .bind(&merged.call_id)
                .bind(&merged.direction)
                .bind(&merged.from_number)
                .bind(&merged.to_number)
                .bind(merged.started_at)
                .bind(merged.ended_at)
                .bind(merged.status.as_str())
                .bind(merged.cost_cents)
                .bind(&merged.disconnection_reason)
                .bind(merged.last_event)
                .bind(&merged.raw_payload)
                .execute(&mut *tx)
                .await?;
                if inserted.rows_affected() == 0 {
                    tx.rollback().await?;
                    continue;
                }
            } else {
                sqlx::query(
                    "UPDATE call_records SET agent_id = $2, direction = $3, from_number = $4, \
                         to_number = $5, started_at = $6, ended_at = $7, status = $8, \
                         cost_cents = $9, disconnection_reason = $10, last_event = $11, \
                         raw_payload = $12, updated_at = now() \
                     WHERE call_id = $1",
                )
                .bind(&merged.call_id)
                .bind(merged.agent_id)
                .bind(&merged.direction)
                .bind(&merged.from_number)
                .bind(&merged.to_number)
                .bind(merged.started_at)
                .bind(merged.ended_at)
                .bind(merged.status.as_str())
                .bind(merged.cost_cents)
                .bind(&merged.disconnection_reason)
                .bind(merged.last_event)
                .bind(&merged.raw_payload)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            return Ok(merged);
        }
        Err(DbError::Conflict(format!(
            "call {} kept changing during merge",
            event.call_id
        )))
    }

    async fn write_analysis(
        &self,
        analysis: &CallAnalysis,
        follow_ups: &[NewTask],
    ) -> Result<AnalysisWrite, DbError> {
        let mut tx = self.pool.begin().await?;
        let inserted: Option<bool> = sqlx::query_scalar(
            "INSERT INTO call_analyses (call_id, summary, sentiment, successful, \
                 booking_created, transcript, extracted_fields, analyzed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (call_id) DO UPDATE SET \
                 summary = EXCLUDED.summary, sentiment = EXCLUDED.sentiment, \
                 successful = EXCLUDED.successful, booking_created = EXCLUDED.booking_created, \
                 transcript = EXCLUDED.transcript, extracted_fields = EXCLUDED.extracted_fields, \
                 analyzed_at = EXCLUDED.analyzed_at \
             WHERE call_analyses.analyzed_at < EXCLUDED.analyzed_at \
             RETURNING (xmax = 0)",
        )
        .bind(&analysis.call_id)
        .bind(&analysis.summary)
        .bind(&analysis.sentiment)
        .bind(analysis.successful)
        .bind(analysis.booking_created)
        .bind(&analysis.transcript)
        .bind(&analysis.extracted_fields)
        .bind(analysis.analyzed_at)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match inserted {
            None => AnalysisWrite::Kept,
            Some(true) => AnalysisWrite::Inserted,
            Some(false) => AnalysisWrite::Overwritten,
        };

        if outcome != AnalysisWrite::Kept {
            for task in follow_ups {
                insert_task(&mut tx, task).await?;
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn analysis(&self, call_id: &str) -> Result<Option<CallAnalysis>, DbError> {
        let row = sqlx::query(
            "SELECT call_id, summary, sentiment, successful, booking_created, transcript, \
                    extracted_fields, analyzed_at \
             FROM call_analyses WHERE call_id = $1",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(analysis_from_row).transpose()
    }
}

async fn insert_task(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    task: &NewTask,
) -> Result<Uuid, DbError> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO tasks (id, kind, payload) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(task.kind.as_str())
        .bind(&task.payload)
        .execute(&mut **tx)
        .await?;
    Ok(id)
}

#[async_trait]
impl IdempotencyStore for PgStore {
    async fn claim(
        &self,
        key: &str,
        tenant_id: Option<Uuid>,
        route: &str,
        ttl: Duration,
    ) -> Result<Claim, DbError> {
        let ttl_secs = ttl.as_secs_f64();
        let inserted = sqlx::query(
            "INSERT INTO idempotency_keys (key, tenant_id, route, expires_at) \
             VALUES ($1, $2, $3, now() + make_interval(secs => $4)) \
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(tenant_id)
        .bind(route)
        .bind(ttl_secs)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(Claim::Acquired);
        }

        // Expired keys and abandoned claims are taken over in place.
        let taken = sqlx::query(
            "UPDATE idempotency_keys \
             SET tenant_id = $2, route = $3, response_status = NULL, response_snapshot = NULL, \
                 created_at = now(), expires_at = now() + make_interval(secs => $4) \
             WHERE key = $1 AND (expires_at <= now() \
                 OR (response_snapshot IS NULL AND created_at <= now() - make_interval(secs => $5)))",
        )
        .bind(key)
        .bind(tenant_id)
        .bind(route)
        .bind(ttl_secs)
        .bind(CLAIM_LEASE.as_secs_f64())
        .execute(&self.pool)
        .await?;
        if taken.rows_affected() == 1 {
            return Ok(Claim::Acquired);
        }

        let row = sqlx::query(
            "SELECT response_status, response_snapshot FROM idempotency_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(Claim::InFlight);
        };
        let status: Option<i16> = row.try_get("response_status")?;
        let body: Option<String> = row.try_get("response_snapshot")?;
        Ok(match (status, body) {
            (Some(status), Some(body)) => Claim::Completed(Snapshot {
                status: status as u16,
                body,
            }),
            _ => Claim::InFlight,
        })
    }

    async fn complete(&self, key: &str, snapshot: &Snapshot) -> Result<(), DbError> {
        let updated = sqlx::query(
            "UPDATE idempotency_keys SET response_status = $2, response_snapshot = $3 WHERE key = $1",
        )
        .bind(key)
        .bind(snapshot.status as i16)
        .bind(&snapshot.body)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("idempotency key {key}")));
        }
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND response_snapshot IS NULL")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, DbError> {
        let deleted = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn enqueue(&self, task: &NewTask) -> Result<Uuid, DbError> {
        let mut tx = self.pool.begin().await?;
        let id = insert_task(&mut tx, task).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn lease_due(&self, batch: i64, lease: Duration) -> Result<Vec<Task>, DbError> {
        let rows = sqlx::query(
            "UPDATE tasks SET state = 'in_flight', attempts = attempts + 1, \
                 next_attempt_at = now() + make_interval(secs => $2), updated_at = now() \
             WHERE id IN ( \
                 SELECT id FROM tasks \
                 WHERE state IN ('pending', 'in_flight') AND next_attempt_at <= now() \
                 ORDER BY next_attempt_at \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING id, kind, payload, state, attempts, next_attempt_at, last_error",
        )
        .bind(batch)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn mark_done(&self, id: Uuid) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE tasks SET state = 'done', last_error = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE tasks SET state = 'pending', next_attempt_at = $2, last_error = $3, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead(&self, id: Uuid, error: &str) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE tasks SET state = 'dead', last_error = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task(&self, id: Uuid) -> Result<Option<Task>, DbError> {
        let row = sqlx::query(
            "SELECT id, kind, payload, state, attempts, next_attempt_at, last_error \
             FROM tasks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }
}

#[async_trait]
impl PhoneStore for PgStore {
    async fn record_assignment(
        &self,
        assignment: &NewPhoneAssignment,
    ) -> Result<PhoneAssignment, DbError> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM tenants WHERE id = $1 FOR UPDATE")
                .bind(assignment.tenant_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(DbError::NotFound(format!("tenant {}", assignment.tenant_id)));
        }

        let row = sqlx::query(
            "INSERT INTO phone_assignments (id, tenant_id, agent_id, external_phone_id, \
                 phone_number, status, forwarding_number, assignment_type, metadata) \
             VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8) \
             RETURNING id, tenant_id, agent_id, external_phone_id, phone_number, status, \
                 forwarding_number, assignment_type, metadata",
        )
        .bind(Uuid::new_v4())
        .bind(assignment.tenant_id)
        .bind(assignment.agent_id)
        .bind(&assignment.external_phone_id)
        .bind(&assignment.phone_number)
        .bind(&assignment.forwarding_number)
        .bind(assignment.assignment_type.as_str())
        .bind(&assignment.metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, &assignment.phone_number))?;

        let recorded = assignment_from_row(&row)?;
        tx.commit().await?;
        Ok(recorded)
    }

    async fn release_assignment(
        &self,
        tenant_id: Uuid,
        phone_number: &str,
    ) -> Result<Option<PhoneAssignment>, DbError> {
        let row = sqlx::query(
            "UPDATE phone_assignments SET status = 'released', released_at = now() \
             WHERE tenant_id = $1 AND phone_number = $2 AND status = 'active' \
             RETURNING id, tenant_id, agent_id, external_phone_id, phone_number, status, \
                 forwarding_number, assignment_type, metadata",
        )
        .bind(tenant_id)
        .bind(phone_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn active_assignment(
        &self,
        tenant_id: Uuid,
        phone_number: &str,
    ) -> Result<Option<PhoneAssignment>, DbError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, agent_id, external_phone_id, phone_number, status, \
                    forwarding_number, assignment_type, metadata \
             FROM phone_assignments \
             WHERE tenant_id = $1 AND phone_number = $2 AND status = 'active'",
        )
        .bind(tenant_id)
        .bind(phone_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }
}

/// These run against a real database and are skipped when `DATABASE_URL` is
/// unset. Every test uses fresh ids, so they share one database safely.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AssignmentType, TaskKind, TaskState};
    use serde_json::json;

    async fn store() -> Option<PgStore> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL unset, skipping Postgres test");
            return None;
        };
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        Some(PgStore::new(pool))
    }

    async fn insert_tenant(store: &PgStore) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO tenants (id, slug, business_name, timezone, status) \
             VALUES ($1, $2, 'Test Salon', 'America/New_York', 'active')",
        )
        .bind(id)
        .bind(format!("salon-{id}"))
        .execute(&store.pool)
        .await
        .unwrap();
        id
    }

    async fn insert_call(store: &PgStore, tenant_id: Uuid) -> String {
        let call_id = format!("call_{}", Uuid::new_v4().simple());
        sqlx::query(
            "INSERT INTO call_records (id, tenant_id, call_id, status, last_event, raw_payload) \
             VALUES ($1, $2, $3, 'ended', 2, '{}'::jsonb)",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(&call_id)
        .execute(&store.pool)
        .await
        .unwrap();
        call_id
    }

    async fn tasks_with_marker(store: &PgStore, marker: &str) -> i64 {
        sqlx::query_scalar("SELECT count(*) FROM tasks WHERE payload->>'marker' = $1")
            .bind(marker)
            .fetch_one(&store.pool)
            .await
            .unwrap()
    }

    fn analysis(call_id: &str, summary: &str, analyzed_at: DateTime<Utc>) -> CallAnalysis {
        CallAnalysis {
            call_id: call_id.to_string(),
            summary: Some(summary.to_string()),
            sentiment: Some("positive".into()),
            successful: true,
            booking_created: false,
            transcript: None,
            extracted_fields: json!({}),
            analyzed_at,
        }
    }

    #[tokio::test]
    async fn abandoned_claim_is_taken_over() {
        let Some(store) = store().await else { return };
        let key = format!("key-{}", Uuid::new_v4());
        let ttl = Duration::from_secs(3600);

        assert_eq!(store.claim(&key, None, "send-sms", ttl).await.unwrap(), Claim::Acquired);
        assert_eq!(store.claim(&key, None, "send-sms", ttl).await.unwrap(), Claim::InFlight);

        // Age the unfinished claim past its lease.
        sqlx::query(
            "UPDATE idempotency_keys SET created_at = now() - make_interval(secs => $2) \
             WHERE key = $1",
        )
        .bind(&key)
        .bind(CLAIM_LEASE.as_secs_f64() + 5.0)
        .execute(&store.pool)
        .await
        .unwrap();
        assert_eq!(store.claim(&key, None, "send-sms", ttl).await.unwrap(), Claim::Acquired);

        let snapshot = Snapshot {
            status: 200,
            body: r#"{"sent":true}"#.into(),
        };
        store.complete(&key, &snapshot).await.unwrap();
        assert_eq!(
            store.claim(&key, None, "send-sms", ttl).await.unwrap(),
            Claim::Completed(snapshot)
        );
    }

    #[tokio::test]
    async fn expired_completed_key_is_claimed_afresh() {
        let Some(store) = store().await else { return };
        let tenant_id = insert_tenant(&store).await;
        let key = format!("key-{}", Uuid::new_v4());

        let claim = store
            .claim(&key, Some(tenant_id), "create-booking", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(claim, Claim::Acquired);
        let snapshot = Snapshot {
            status: 200,
            body: r#"{"bookingId":"b1"}"#.into(),
        };
        store.complete(&key, &snapshot).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let claim = store
            .claim(&key, Some(tenant_id), "create-booking", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(claim, Claim::Acquired);
        let stale: Option<String> =
            sqlx::query_scalar("SELECT response_snapshot FROM idempotency_keys WHERE key = $1")
                .bind(&key)
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(stale, None);
    }

    #[tokio::test]
    async fn duplicate_or_older_analysis_is_kept() {
        let Some(store) = store().await else { return };
        let tenant_id = insert_tenant(&store).await;
        let call_id = insert_call(&store, tenant_id).await;
        let marker = Uuid::new_v4().to_string();
        let follow_ups = [NewTask {
            kind: TaskKind::SendEmail,
            payload: json!({ "marker": marker }),
        }];
        let at = Utc::now();

        let first = store
            .write_analysis(&analysis(&call_id, "booked a cut", at), &follow_ups)
            .await
            .unwrap();
        assert_eq!(first, AnalysisWrite::Inserted);

        let duplicate = store
            .write_analysis(&analysis(&call_id, "duplicate", at), &follow_ups)
            .await
            .unwrap();
        assert_eq!(duplicate, AnalysisWrite::Kept);

        let older = store
            .write_analysis(
                &analysis(&call_id, "stale", at - chrono::Duration::hours(1)),
                &follow_ups,
            )
            .await
            .unwrap();
        assert_eq!(older, AnalysisWrite::Kept);

        let stored = store.analysis(&call_id).await.unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("booked a cut"));
        assert_eq!(tasks_with_marker(&store, &marker).await, 1);

        let newer = store
            .write_analysis(
                &analysis(&call_id, "rescheduled", at + chrono::Duration::hours(1)),
                &follow_ups,
            )
            .await
            .unwrap();
        assert_eq!(newer, AnalysisWrite::Overwritten);
        let stored = store.analysis(&call_id).await.unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("rescheduled"));
        assert_eq!(tasks_with_marker(&store, &marker).await, 2);

        sqlx::query("DELETE FROM tasks WHERE payload->>'marker' = $1")
            .bind(&marker)
            .execute(&store.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_pollers_lease_disjoint_tasks() {
        let Some(store) = store().await else { return };
        let marker = Uuid::new_v4().to_string();
        let mut ours = Vec::new();
        for n in 0..20 {
            let task = NewTask {
                kind: TaskKind::SendSms,
                payload: json!({ "marker": marker, "n": n }),
            };
            ours.push(store.enqueue(&task).await.unwrap());
        }

        let lease = Duration::from_secs(3600);
        let (a, b) = tokio::join!(store.lease_due(10_000, lease), store.lease_due(10_000, lease));
        let (a, b) = (a.unwrap(), b.unwrap());

        let a_ids: std::collections::HashSet<Uuid> = a.iter().map(|t| t.id).collect();
        assert!(b.iter().all(|t| !a_ids.contains(&t.id)));
        for id in &ours {
            let leased = a.iter().chain(&b).filter(|t| t.id == *id).count();
            assert_eq!(leased, 1, "task {id} leased {leased} times");
        }
        for task in a.iter().chain(&b).filter(|t| ours.contains(&t.id)) {
            assert_eq!(task.state, TaskState::InFlight);
            assert_eq!(task.attempts, 1);
        }

        // Leased tasks are not due again until the lease runs out.
        let again = store.lease_due(10_000, lease).await.unwrap();
        assert!(again.iter().all(|t| !ours.contains(&t.id)));

        for id in ours {
            store.mark_done(id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn second_active_assignment_is_a_conflict() {
        let Some(store) = store().await else { return };
        let first = insert_tenant(&store).await;
        let second = insert_tenant(&store).await;
        let number = format!("+1202{:07}", rand::random::<u32>() % 10_000_000);
        let assignment = |tenant_id| NewPhoneAssignment {
            tenant_id,
            agent_id: None,
            external_phone_id: None,
            phone_number: number.clone(),
            forwarding_number: None,
            assignment_type: AssignmentType::New,
            metadata: json!({}),
        };

        let recorded = store.record_assignment(&assignment(first)).await.unwrap();
        assert_eq!(recorded.phone_number, number);
        let err = store.record_assignment(&assignment(second)).await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(ref n) if *n == number), "{err:?}");

        store.release_assignment(first, &number).await.unwrap();
        store.record_assignment(&assignment(second)).await.unwrap();
        store.release_assignment(second, &number).await.unwrap();
    }
}
