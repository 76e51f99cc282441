//! Request-level idempotency on top of the `idempotency_keys` table.
//!
//! The first caller for a key owns it until it stores a snapshot or drops
//! its guard. Concurrent duplicates wait and then replay the snapshot.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::{Claim, Snapshot, Store};
use crate::error::ApiError;

pub const KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// SHA-256 hex over the tenant, route and the request's semantic tuple.
pub fn key(tenant_id: Uuid, route: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(route.as_bytes());
    for part in parts {
        // Length-prefixed so ("ab","c") and ("a","bc") differ.
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub enum Acquired {
    Owner(ClaimGuard),
    Replay(Snapshot),
}

/// Claim `key`, waiting while another request holds it.
pub async fn acquire(
    store: &Arc<dyn Store>,
    key: &str,
    tenant_id: Option<Uuid>,
    route: &str,
) -> Result<Acquired, ApiError> {
    let mut waited = false;
    loop {
        match store.claim(key, tenant_id, route, KEY_TTL).await? {
            Claim::Acquired => {
                return Ok(Acquired::Owner(ClaimGuard {
                    store: store.clone(),
                    key: key.to_string(),
                    done: false,
                }))
            }
            Claim::Completed(snapshot) => {
                tracing::info!(route, waited, "Replaying stored response");
                return Ok(Acquired::Replay(snapshot));
            }
            Claim::InFlight => {
                waited = true;
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

/// Ownership of an unfinished key. Dropping it without `complete` releases
/// the key so a retry can run.
pub struct ClaimGuard {
    store: Arc<dyn Store>,
    key: String,
    done: bool,
}

impl ClaimGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn complete(mut self, snapshot: &Snapshot) -> Result<(), ApiError> {
        self.store.complete(&self.key, snapshot).await?;
        self.done = true;
        Ok(())
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.release(&key).await {
                    tracing::warn!("Failed to release idempotency key: {e}");
                }
            });
        }
    }
}
