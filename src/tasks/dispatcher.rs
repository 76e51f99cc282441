use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{TaskError, TaskQueue};
use crate::backoff::RetryPolicy;
use crate::config::WorkersConfig;
use crate::db::{Store, Task, TaskKind};

/// Per-delivery deadline.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Leased rows come due again after this if the process dies mid-delivery.
const LEASE: Duration = Duration::from_secs(90);
const PURGE_EVERY: Duration = Duration::from_secs(15 * 60);

enum Delivery {
    Done,
    Dead(String),
    Retry(String),
}

/// Single poller per process. Leases due outbox rows with SKIP LOCKED so
/// several processes can run side by side.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    config: WorkersConfig,
    policy: RetryPolicy,
    notify: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        queue: &TaskQueue,
        config: &WorkersConfig,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            store,
            client: reqwest::Client::builder()
                .timeout(DELIVERY_TIMEOUT)
                .build()?,
            config: config.clone(),
            policy: RetryPolicy::outbox(),
            notify: queue.waker(),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn worker_url(&self, kind: TaskKind) -> &str {
        match kind {
            TaskKind::SendEmail => &self.config.email_url,
            TaskKind::SendSms => &self.config.sms_url,
            TaskKind::PhoneNumbers => &self.config.phone_numbers_url,
        }
    }

    /// Lease and deliver one batch. Returns how many rows were leased.
    pub async fn run_once(&self) -> Result<usize, TaskError> {
        let leased = self.store.lease_due(self.config.batch, LEASE).await?;
        for task in &leased {
            let outcome = self.deliver(task).await;
            self.settle(task, outcome).await?;
        }
        Ok(leased.len())
    }

    async fn deliver(&self, task: &Task) -> Delivery {
        let url = self.worker_url(task.kind);
        if url.is_empty() {
            return Delivery::Retry(format!("no worker url configured for {}", task.kind));
        }

        let mut request = self
            .client
            .post(url)
            .bearer_auth(&self.config.token)
            .json(&task.payload);
        if let Some(key) = task.payload.get("idempotencyKey").and_then(Value::as_str) {
            request = request.header("Idempotency-Key", key);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => Delivery::Done,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                let detail = format!("{status}: {}", body.chars().take(300).collect::<String>());
                if status.is_client_error() && status.as_u16() != 429 {
                    Delivery::Dead(detail)
                } else {
                    Delivery::Retry(detail)
                }
            }
            Err(e) => Delivery::Retry(format!("transport: {e}")),
        }
    }

    async fn settle(&self, task: &Task, outcome: Delivery) -> Result<(), TaskError> {
        let attempts = task.attempts.max(0) as u32;
        match outcome {
            Delivery::Done => {
                self.store.mark_done(task.id).await?;
                tracing::info!(task_id = %task.id, kind = %task.kind, attempts, "Task delivered");
            }
            Delivery::Dead(error) => {
                self.store.mark_dead(task.id, &error).await?;
                tracing::error!(task_id = %task.id, kind = %task.kind, attempts, error = %error, "Task rejected by worker, dead-lettered");
            }
            Delivery::Retry(error) if self.policy.exhausted(attempts) => {
                self.store.mark_dead(task.id, &error).await?;
                tracing::error!(task_id = %task.id, kind = %task.kind, attempts, error = %error, "Task out of attempts, dead-lettered");
            }
            Delivery::Retry(error) => {
                let delay = self.policy.next_delay(attempts);
                let at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                self.store.schedule_retry(task.id, at, &error).await?;
                tracing::warn!(
                    task_id = %task.id,
                    kind = %task.kind,
                    attempts,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "Task delivery failed, will retry"
                );
            }
        }
        Ok(())
    }

    async fn purge(&self) {
        match self.store.purge_expired().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(purged = n, "Purged expired idempotency keys"),
            Err(e) => tracing::warn!("Idempotency purge failed: {e}"),
        }
    }

    /// Poll until `shutdown` fires. Wakes early on enqueue.
    pub async fn run(self, shutdown: CancellationToken) {
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(50));
        let mut last_purge: Option<Instant> = None;
        tracing::info!(poll_ms = interval.as_millis() as u64, "Task dispatcher started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if last_purge.map_or(true, |at| at.elapsed() >= PURGE_EVERY) {
                self.purge().await;
                last_purge = Some(Instant::now());
            }

            match self.run_once().await {
                // A full batch means there is probably more waiting.
                Ok(n) if n as i64 >= self.config.batch => continue,
                Ok(_) => {}
                Err(e) => tracing::error!("Task dispatch failed: {e}"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("Task dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::{NewTask, TaskState, TaskStore};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn immediate() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 6,
            base_ms: 0,
            factor: 2.0,
            jitter: 0.0,
            cap_ms: 0,
        }
    }

    async fn setup(server: &MockServer) -> (Arc<MemoryStore>, Dispatcher) {
        let store = Arc::new(MemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        let config = WorkersConfig {
            sms_url: format!("{}/send-sms", server.uri()),
            token: "worker-secret".into(),
            ..WorkersConfig::default()
        };
        let dispatcher = Dispatcher::new(store.clone(), &queue, &config)
            .unwrap()
            .with_policy(immediate());
        (store, dispatcher)
    }

    fn sms() -> NewTask {
        NewTask {
            kind: TaskKind::SendSms,
            payload: json!({ "to": "+12025550100", "body": "hi", "type": "sms", "idempotencyKey": "sms-1" }),
        }
    }

    #[tokio::test]
    async fn retries_until_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send-sms"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/send-sms"))
            .and(header("authorization", "Bearer worker-secret"))
            .and(header("idempotency-key", "sms-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (store, dispatcher) = setup(&server).await;
        let id = store.enqueue(&sms()).await.unwrap();

        for _ in 0..3 {
            assert_eq!(dispatcher.run_once().await.unwrap(), 1);
        }
        let task = store.task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Done);
        assert_eq!(task.attempts, 3);
        assert_eq!(dispatcher.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn client_error_dead_letters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad number"))
            .expect(1)
            .mount(&server)
            .await;

        let (store, dispatcher) = setup(&server).await;
        let id = store.enqueue(&sms()).await.unwrap();
        dispatcher.run_once().await.unwrap();

        let task = store.task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Dead);
        assert!(task.last_error.unwrap().contains("bad number"));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (store, dispatcher) = setup(&server).await;
        let id = store.enqueue(&sms()).await.unwrap();
        for _ in 0..6 {
            dispatcher.run_once().await.unwrap();
        }
        let task = store.task(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Dead);
        assert_eq!(task.attempts, 6);
        assert_eq!(dispatcher.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let server = MockServer::start().await;
        let (_, dispatcher) = setup(&server).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
