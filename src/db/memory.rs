//! In-memory store for tests. Same merge and write rules as `PgStore`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    Agent, AnalysisWrite, AssignmentStatus, CallAnalysis, CallRecord, CallStore, Claim, DbError,
    IdempotencyStore, NewPhoneAssignment, NewTask, PhoneAssignment, PhoneStore, Snapshot, Task,
    TaskState, TaskStore, Tenant, TenantStore, CLAIM_LEASE,
};
use crate::webhooks::lifecycle::{self, CallEvent};

struct KeyRow {
    snapshot: Option<Snapshot>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    tenants: HashMap<Uuid, Tenant>,
    agents: HashMap<Uuid, Agent>,
    owners: HashMap<Uuid, Vec<String>>,
    assignments: Vec<PhoneAssignment>,
    calls: HashMap<String, CallRecord>,
    analyses: HashMap<String, CallAnalysis>,
    analysis_checks: usize,
    keys: HashMap<String, KeyRow>,
    tasks: Vec<Task>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call-lifecycle write fail as if the database were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<(), DbError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DbError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.inner.lock().unwrap().tenants.insert(tenant.id, tenant);
    }

    pub fn insert_agent(&self, agent: Agent) {
        self.inner.lock().unwrap().agents.insert(agent.id, agent);
    }

    pub fn insert_owner(&self, tenant_id: Uuid, email: &str) {
        self.inner
            .lock()
            .unwrap()
            .owners
            .entry(tenant_id)
            .or_default()
            .push(email.to_string());
    }

    pub fn insert_assignment(&self, assignment: PhoneAssignment) {
        self.inner.lock().unwrap().assignments.push(assignment);
    }

    pub fn insert_call(&self, record: CallRecord) {
        self.inner
            .lock()
            .unwrap()
            .calls
            .insert(record.call_id.clone(), record);
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.lock().unwrap().tasks.clone()
    }

    pub fn analysis_count(&self) -> usize {
        self.inner.lock().unwrap().analyses.len()
    }

    /// Number of monotonic analysis writes attempted.
    pub fn analysis_checks(&self) -> usize {
        self.inner.lock().unwrap().analysis_checks
    }

    pub fn assignments(&self) -> Vec<PhoneAssignment> {
        self.inner.lock().unwrap().assignments.clone()
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn tenant(&self, id: Uuid) -> Result<Option<Tenant>, DbError> {
        Ok(self.inner.lock().unwrap().tenants.get(&id).cloned())
    }

    async fn agent(&self, id: Uuid) -> Result<Option<Agent>, DbError> {
        Ok(self.inner.lock().unwrap().agents.get(&id).cloned())
    }

    async fn agent_by_external_id(
        &self,
        external_agent_id: &str,
    ) -> Result<Option<Agent>, DbError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .agents
            .values()
            .find(|a| a.external_agent_id == external_agent_id)
            .cloned())
    }

    async fn active_assignments(
        &self,
        phone_number: &str,
    ) -> Result<Vec<PhoneAssignment>, DbError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .assignments
            .iter()
            .filter(|a| a.phone_number == phone_number && a.status == AssignmentStatus::Active)
            .cloned()
            .collect())
    }

    async fn owner_emails(&self, tenant_id: Uuid) -> Result<Vec<String>, DbError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .owners
            .get(&tenant_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn call_record(&self, call_id: &str) -> Result<Option<CallRecord>, DbError> {
        Ok(self.inner.lock().unwrap().calls.get(call_id).cloned())
    }

    async fn apply_call_event(&self, event: &CallEvent) -> Result<CallRecord, DbError> {
        self.check_failing()?;
        let mut inner = self.inner.lock().unwrap();
        let existing = inner.calls.get(&event.call_id).cloned();
        if let Some(current) = &existing {
            if current.tenant_id != event.tenant_id {
                return Err(DbError::TenantMismatch(event.call_id.clone()));
            }
        }
        let merged = lifecycle::merge(existing, event);
        inner.calls.insert(merged.call_id.clone(), merged.clone());
        Ok(merged)
    }

    async fn write_analysis(
        &self,
        analysis: &CallAnalysis,
        follow_ups: &[NewTask],
    ) -> Result<AnalysisWrite, DbError> {
        self.check_failing()?;
        let mut inner = self.inner.lock().unwrap();
        inner.analysis_checks += 1;
        let outcome = match inner.analyses.get(&analysis.call_id) {
            None => AnalysisWrite::Inserted,
            Some(stored) if stored.analyzed_at < analysis.analyzed_at => AnalysisWrite::Overwritten,
            Some(_) => AnalysisWrite::Kept,
        };
        if outcome != AnalysisWrite::Kept {
            inner
                .analyses
                .insert(analysis.call_id.clone(), analysis.clone());
            let now = Utc::now();
            for task in follow_ups {
                inner.tasks.push(Task {
                    id: Uuid::new_v4(),
                    kind: task.kind,
                    payload: task.payload.clone(),
                    state: TaskState::Pending,
                    attempts: 0,
                    next_attempt_at: now,
                    last_error: None,
                });
            }
        }
        Ok(outcome)
    }

    async fn analysis(&self, call_id: &str) -> Result<Option<CallAnalysis>, DbError> {
        Ok(self.inner.lock().unwrap().analyses.get(call_id).cloned())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn claim(
        &self,
        key: &str,
        _tenant_id: Option<Uuid>,
        _route: &str,
        ttl: Duration,
    ) -> Result<Claim, DbError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let existing = inner.keys.get(key).map(|row| {
            let takeover = row.expires_at <= now
                || (row.snapshot.is_none() && row.created_at <= now - to_chrono(CLAIM_LEASE));
            (takeover, row.snapshot.clone())
        });
        match existing {
            None | Some((true, _)) => {
                inner.keys.insert(
                    key.to_string(),
                    KeyRow {
                        snapshot: None,
                        created_at: now,
                        expires_at: now + to_chrono(ttl),
                    },
                );
                Ok(Claim::Acquired)
            }
            Some((false, Some(snapshot))) => Ok(Claim::Completed(snapshot)),
            Some((false, None)) => Ok(Claim::InFlight),
        }
    }

    async fn complete(&self, key: &str, snapshot: &Snapshot) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.keys.get_mut(key) {
            Some(row) => {
                row.snapshot = Some(snapshot.clone());
                Ok(())
            }
            None => Err(DbError::NotFound(format!("idempotency key {key}"))),
        }
    }

    async fn release(&self, key: &str) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .keys
            .get(key)
            .is_some_and(|row| row.snapshot.is_none())
        {
            inner.keys.remove(key);
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, DbError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let before = inner.keys.len();
        inner.keys.retain(|_, row| row.expires_at > now);
        Ok((before - inner.keys.len()) as u64)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(&self, task: &NewTask) -> Result<Uuid, DbError> {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().tasks.push(Task {
            id,
            kind: task.kind,
            payload: task.payload.clone(),
            state: TaskState::Pending,
            attempts: 0,
            next_attempt_at: Utc::now(),
            last_error: None,
        });
        Ok(id)
    }

    async fn lease_due(&self, batch: i64, lease: Duration) -> Result<Vec<Task>, DbError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut due: Vec<&mut Task> = inner
            .tasks
            .iter_mut()
            .filter(|t| {
                matches!(t.state, TaskState::Pending | TaskState::InFlight)
                    && t.next_attempt_at <= now
            })
            .collect();
        due.sort_by_key(|t| t.next_attempt_at);
        Ok(due
            .into_iter()
            .take(batch.max(0) as usize)
            .map(|t| {
                t.state = TaskState::InFlight;
                t.attempts += 1;
                t.next_attempt_at = now + to_chrono(lease);
                t.clone()
            })
            .collect())
    }

    async fn mark_done(&self, id: Uuid) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(t) = inner.tasks.iter_mut().find(|t| t.id == id) {
            t.state = TaskState::Done;
            t.last_error = None;
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(t) = inner.tasks.iter_mut().find(|t| t.id == id) {
            t.state = TaskState::Pending;
            t.next_attempt_at = next_attempt_at;
            t.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn mark_dead(&self, id: Uuid, error: &str) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(t) = inner.tasks.iter_mut().find(|t| t.id == id) {
            t.state = TaskState::Dead;
            t.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn task(&self, id: Uuid) -> Result<Option<Task>, DbError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }
}

#[async_trait]
impl PhoneStore for MemoryStore {
    async fn record_assignment(
        &self,
        assignment: &NewPhoneAssignment,
    ) -> Result<PhoneAssignment, DbError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.tenants.contains_key(&assignment.tenant_id) {
            return Err(DbError::NotFound(format!("tenant {}", assignment.tenant_id)));
        }
        if inner
            .assignments
            .iter()
            .any(|a| a.phone_number == assignment.phone_number && a.status == AssignmentStatus::Active)
        {
            return Err(DbError::Conflict(assignment.phone_number.clone()));
        }
        let recorded = PhoneAssignment {
            id: Uuid::new_v4(),
            tenant_id: assignment.tenant_id,
            agent_id: assignment.agent_id,
            external_phone_id: assignment.external_phone_id.clone(),
            phone_number: assignment.phone_number.clone(),
            status: AssignmentStatus::Active,
            forwarding_number: assignment.forwarding_number.clone(),
            assignment_type: assignment.assignment_type,
            metadata: assignment.metadata.clone(),
        };
        inner.assignments.push(recorded.clone());
        Ok(recorded)
    }

    async fn release_assignment(
        &self,
        tenant_id: Uuid,
        phone_number: &str,
    ) -> Result<Option<PhoneAssignment>, DbError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .assignments
            .iter_mut()
            .find(|a| {
                a.tenant_id == tenant_id
                    && a.phone_number == phone_number
                    && a.status == AssignmentStatus::Active
            })
            .map(|a| {
                a.status = AssignmentStatus::Released;
                a.clone()
            }))
    }

    async fn active_assignment(
        &self,
        tenant_id: Uuid,
        phone_number: &str,
    ) -> Result<Option<PhoneAssignment>, DbError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .assignments
            .iter()
            .find(|a| {
                a.tenant_id == tenant_id
                    && a.phone_number == phone_number
                    && a.status == AssignmentStatus::Active
            })
            .cloned())
    }
}
