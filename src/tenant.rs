//! Tenant resolution from partial call metadata.
//!
//! Sources are tried in a fixed order; each answers found, not found, or
//! ambiguous, and the first definitive answer wins.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use uuid::Uuid;

use crate::db::{Agent, Store, Tenant, TenantStatus};
use crate::error::ApiError;

const CACHE_TTL: Duration = Duration::from_secs(60);
const CACHE_CAPACITY: u64 = 10_000;

/// Everything a request knows that could identify its tenant.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResolveInputs<'a> {
    pub verified_agent: Option<&'a Agent>,
    pub agent_id: Option<&'a str>,
    pub to_number: Option<&'a str>,
    pub call_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ResolvedTenant {
    pub tenant: Tenant,
    pub agent: Option<Agent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hit {
    tenant_id: Uuid,
    agent_id: Option<Uuid>,
}

#[derive(Debug, PartialEq, Eq)]
enum Lookup {
    Found(Hit),
    NotFound,
    Ambiguous,
}

#[derive(Debug, Clone, Copy)]
enum Source {
    VerifiedAgent,
    AgentId,
    ToNumber,
    CallId,
}

const ORDER: [Source; 4] = [
    Source::VerifiedAgent,
    Source::AgentId,
    Source::ToNumber,
    Source::CallId,
];

#[derive(Clone)]
pub struct TenantResolver {
    store: Arc<dyn Store>,
    cache: Cache<String, Hit>,
}

impl TenantResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    pub async fn resolve(&self, inputs: &ResolveInputs<'_>) -> Result<ResolvedTenant, ApiError> {
        for source in ORDER {
            match self.lookup(source, inputs).await? {
                Lookup::Found(hit) => {
                    tracing::debug!(?source, tenant_id = %hit.tenant_id, "Tenant resolved");
                    return self.load(hit, inputs.verified_agent).await;
                }
                Lookup::Ambiguous => {
                    tracing::warn!(?source, "Tenant resolution is ambiguous");
                    return Err(ApiError::TenantAmbiguous);
                }
                Lookup::NotFound => {}
            }
        }
        Err(ApiError::TenantNotFound)
    }

    /// Drop the cached resolution for a number whose assignment changed.
    pub async fn invalidate_number(&self, phone_number: &str) {
        self.cache.invalidate(&format!("to:{phone_number}")).await;
    }

    async fn lookup(&self, source: Source, inputs: &ResolveInputs<'_>) -> Result<Lookup, ApiError> {
        let key = match source {
            Source::VerifiedAgent => {
                return Ok(match inputs.verified_agent {
                    Some(agent) => Lookup::Found(Hit {
                        tenant_id: agent.tenant_id,
                        agent_id: Some(agent.id),
                    }),
                    None => Lookup::NotFound,
                });
            }
            Source::AgentId => inputs.agent_id.map(|id| format!("agent:{id}")),
            Source::ToNumber => inputs.to_number.map(|n| format!("to:{n}")),
            Source::CallId => inputs.call_id.map(|id| format!("call:{id}")),
        };
        let Some(key) = key else {
            return Ok(Lookup::NotFound);
        };
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(Lookup::Found(hit));
        }

        let found = match source {
            Source::AgentId => self.by_agent(inputs.agent_id).await?,
            Source::ToNumber => self.by_number(inputs.to_number).await?,
            Source::CallId => self.by_call(inputs.call_id).await?,
            Source::VerifiedAgent => Lookup::NotFound,
        };
        // Misses are not cached: a call record or assignment may appear any moment.
        if let Lookup::Found(hit) = found {
            self.cache.insert(key, hit).await;
        }
        Ok(found)
    }

    async fn by_agent(&self, external_id: Option<&str>) -> Result<Lookup, ApiError> {
        let Some(external_id) = external_id else {
            return Ok(Lookup::NotFound);
        };
        Ok(match self.store.agent_by_external_id(external_id).await? {
            Some(agent) => Lookup::Found(Hit {
                tenant_id: agent.tenant_id,
                agent_id: Some(agent.id),
            }),
            None => Lookup::NotFound,
        })
    }

    async fn by_number(&self, number: Option<&str>) -> Result<Lookup, ApiError> {
        let Some(number) = number else {
            return Ok(Lookup::NotFound);
        };
        let assignments = self.store.active_assignments(number).await?;
        let Some(first) = assignments.first() else {
            return Ok(Lookup::NotFound);
        };
        if assignments.iter().any(|a| a.tenant_id != first.tenant_id) {
            return Ok(Lookup::Ambiguous);
        }
        Ok(Lookup::Found(Hit {
            tenant_id: first.tenant_id,
            agent_id: first.agent_id,
        }))
    }

    async fn by_call(&self, call_id: Option<&str>) -> Result<Lookup, ApiError> {
        let Some(call_id) = call_id else {
            return Ok(Lookup::NotFound);
        };
        Ok(match self.store.call_record(call_id).await? {
            Some(record) => Lookup::Found(Hit {
                tenant_id: record.tenant_id,
                agent_id: record.agent_id,
            }),
            None => Lookup::NotFound,
        })
    }

    async fn load(&self, hit: Hit, verified: Option<&Agent>) -> Result<ResolvedTenant, ApiError> {
        let tenant = match self.store.tenant(hit.tenant_id).await? {
            Some(t) if t.status != TenantStatus::Suspended => t,
            Some(_) => {
                tracing::info!(tenant_id = %hit.tenant_id, "Tenant is suspended");
                return Err(ApiError::TenantNotFound);
            }
            None => return Err(ApiError::TenantNotFound),
        };
        let agent = match (verified, hit.agent_id) {
            (Some(agent), _) => Some(agent.clone()),
            (None, Some(id)) => self
                .store
                .agent(id)
                .await?
                .filter(|a| a.tenant_id == tenant.id),
            (None, None) => None,
        };
        crate::ingress::record_tenant(tenant.id);
        Ok(ResolvedTenant { tenant, agent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::{CallRecord, CallStatus, PhoneStore};
    use crate::testing::{agent, assignment, tenant};

    const NUMBER: &str = "+12025551234";

    fn setup() -> (Arc<MemoryStore>, TenantResolver, Tenant, Agent) {
        let store = Arc::new(MemoryStore::new());
        let t = tenant(1);
        let a = agent(&t, "agent_ext", "tok");
        store.insert_tenant(t.clone());
        store.insert_agent(a.clone());
        let resolver = TenantResolver::new(store.clone());
        (store, resolver, t, a)
    }

    #[tokio::test]
    async fn verified_agent_wins() {
        let (store, resolver, t, a) = setup();
        let other = tenant(2);
        store.insert_tenant(other.clone());
        store.insert_assignment(assignment(&other, NUMBER));

        let resolved = resolver
            .resolve(&ResolveInputs {
                verified_agent: Some(&a),
                to_number: Some(NUMBER),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resolved.tenant.id, t.id);
        assert_eq!(resolved.agent.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn falls_through_to_number_then_call() {
        let (store, resolver, t, _) = setup();
        store.insert_assignment(assignment(&t, NUMBER));
        let resolved = resolver
            .resolve(&ResolveInputs {
                agent_id: Some("unknown_agent"),
                to_number: Some(NUMBER),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resolved.tenant.id, t.id);

        let err = resolver
            .resolve(&ResolveInputs {
                call_id: Some("call_nobody"),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tenant/not-found");
    }

    #[tokio::test]
    async fn two_tenants_on_one_number_is_ambiguous() {
        let (store, resolver, t, _) = setup();
        let other = tenant(2);
        store.insert_tenant(other.clone());
        store.insert_assignment(assignment(&t, NUMBER));
        store.insert_assignment(assignment(&other, NUMBER));
        let err = resolver
            .resolve(&ResolveInputs {
                to_number: Some(NUMBER),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tenant/ambiguous");
    }

    #[tokio::test]
    async fn suspended_tenant_is_not_found() {
        let (store, resolver, mut t, _) = setup();
        t.status = TenantStatus::Suspended;
        store.insert_tenant(t);
        let err = resolver
            .resolve(&ResolveInputs {
                agent_id: Some("agent_ext"),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tenant/not-found");
    }

    #[tokio::test]
    async fn known_call_id_resolves() {
        let (store, resolver, t, a) = setup();
        store.insert_call(CallRecord {
            id: Uuid::new_v4(),
            tenant_id: t.id,
            agent_id: Some(a.id),
            call_id: "call_known".into(),
            direction: Some("inbound".into()),
            from_number: None,
            to_number: None,
            started_at: None,
            ended_at: None,
            status: CallStatus::InProgress,
            cost_cents: None,
            disconnection_reason: None,
            last_event: 1,
            raw_payload: serde_json::json!({}),
        });
        let resolved = resolver
            .resolve(&ResolveInputs {
                call_id: Some("call_known"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resolved.tenant.id, t.id);
        assert_eq!(resolved.agent.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn cached_until_invalidated() {
        let (store, resolver, t, _) = setup();
        store.insert_assignment(assignment(&t, NUMBER));
        let inputs = ResolveInputs {
            to_number: Some(NUMBER),
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&inputs).await.unwrap().tenant.id, t.id);

        store.release_assignment(t.id, NUMBER).await.unwrap();
        assert_eq!(resolver.resolve(&inputs).await.unwrap().tenant.id, t.id);

        resolver.invalidate_number(NUMBER).await;
        assert_eq!(
            resolver.resolve(&inputs).await.unwrap_err().kind(),
            "tenant/not-found"
        );
    }
}
