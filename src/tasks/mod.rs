//! Outbox for slow side effects. Rows are written before anything is sent;
//! the dispatcher delivers them to sidecar workers.

pub mod contracts;
pub mod dispatcher;

use std::sync::Arc;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::db::{DbError, Store};
use crate::error::ApiError;

pub use contracts::{EmailTask, PhoneAction, PhoneNumberTask, SmsTask, TaskContract};
pub use dispatcher::Dispatcher;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("task encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid task: {0}")]
    Invalid(String),
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Db(e) => ApiError::Database(e),
            TaskError::Invalid(reason) => ApiError::invalid_body(reason),
            TaskError::Encode(e) => ApiError::internal(format!("task encode: {e}")),
        }
    }
}

/// Enqueue side of the outbox. Cloned into `AppState`; the dispatcher shares
/// its `Notify` so an enqueue wakes the poller.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn Store>,
    notify: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn enqueue<T: TaskContract>(&self, task: T) -> Result<Uuid, TaskError> {
        let task = task.into_task()?;
        let id = self.store.enqueue(&task).await?;
        tracing::info!(task_id = %id, kind = %task.kind, "Task enqueued");
        self.notify();
        Ok(id)
    }

    /// Wake the dispatcher for rows written elsewhere (e.g. inside the
    /// analysis transaction).
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn waker(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
