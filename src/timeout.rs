//! Timeout messages and the timeout manager

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::executor::Executor;
use crate::stats::{TimeoutStats, TimeoutStatsSnapshot};
use crate::{now_millis, Message, SagaError, SagaId, TimeoutError};

/// Identifier of one requested timeout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeoutId(pub u64);

impl std::fmt::Display for TimeoutId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An expired timeout, delivered back to the saga that requested it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timeout {
    saga_id: SagaId,
    name: Option<Box<str>>,
    expired_at_millis: u64,
    data: Option<serde_json::Value>,
}

impl Timeout {
    pub fn new(
        saga_id: SagaId,
        name: Option<&str>,
        expired_at_millis: u64,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            saga_id,
            name: name.map(Into::into),
            expired_at_millis,
            data,
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn expired_at_millis(&self) -> u64 {
        self.expired_at_millis
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    /// Payload decoded into `T`
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.data.clone().map(serde_json::from_value).transpose()
    }
}

impl Message for Timeout {}

/// Called once for every fired timeout
pub type ExpiredCallback = Arc<dyn Fn(Timeout) -> Result<(), SagaError> + Send + Sync>;

/// Schedules deferred [`Timeout`] messages
pub trait TimeoutManager: Send + Sync + 'static {
    fn request_timeout(
        &self,
        saga_id: SagaId,
        name: Option<&str>,
        delay: Duration,
        data: Option<serde_json::Value>,
    ) -> Result<TimeoutId, TimeoutError>;

    /// Cancel every pending timeout of `saga_id`
    fn cancel_timeouts(&self, saga_id: SagaId);

    /// Cancel the pending timeouts of `saga_id` named `name`
    fn cancel_timeout(&self, saga_id: SagaId, name: &str);

    fn add_expired_callback(&self, callback: ExpiredCallback);
}

struct PendingTimeout {
    id: TimeoutId,
    name: Option<Box<str>>,
    task: JoinHandle<()>,
}

struct Shared {
    pending: Mutex<HashMap<SagaId, Vec<PendingTimeout>>>,
    callbacks: RwLock<Vec<ExpiredCallback>>,
    next_id: AtomicU64,
    stats: TimeoutStats,
}

impl Shared {
    /// Remove a pending timeout; `false` when it was cancelled meanwhile
    fn claim(&self, saga_id: SagaId, id: TimeoutId) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = pending.get_mut(&saga_id) else {
            return false;
        };
        let Some(position) = entries.iter().position(|p| p.id == id) else {
            return false;
        };
        entries.remove(position);
        if entries.is_empty() {
            pending.remove(&saga_id);
        }
        true
    }

    fn fire(&self, timeout: Timeout) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for callback in callbacks {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(timeout.clone())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::error!(
                    saga_id = %timeout.saga_id,
                    timeout = ?timeout.name,
                    error = %error,
                    "Timeout callback failed"
                ),
                Err(_) => tracing::error!(
                    saga_id = %timeout.saga_id,
                    timeout = ?timeout.name,
                    "Timeout callback panicked"
                ),
            }
        }
    }
}

/// Timeout manager backed by tokio timers.
///
/// Every requested timeout is a task sleeping on the runtime; expiry
/// callbacks run on the blocking pool so they may re-enter the synchronous
/// message pipeline.
pub struct TokioTimeoutManager {
    executor: Arc<Executor>,
    shared: Arc<Shared>,
}

impl TokioTimeoutManager {
    /// Use the running tokio runtime, or start a dedicated one
    pub fn new() -> std::io::Result<Self> {
        Ok(Self::with_executor(Arc::new(Executor::current_or_dedicated(
            "saga-timeouts",
        )?)))
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self::with_executor(Arc::new(Executor::from_handle(handle)))
    }

    pub(crate) fn with_executor(executor: Arc<Executor>) -> Self {
        Self {
            executor,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                callbacks: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                stats: TimeoutStats::new(),
            }),
        }
    }

    /// Number of timeouts still pending for `saga_id`
    pub fn pending(&self, saga_id: SagaId) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&saga_id)
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> TimeoutStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl TimeoutManager for TokioTimeoutManager {
    fn request_timeout(
        &self,
        saga_id: SagaId,
        name: Option<&str>,
        delay: Duration,
        data: Option<serde_json::Value>,
    ) -> Result<TimeoutId, TimeoutError> {
        let id = TimeoutId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let expired_at = now_millis().saturating_add(delay.as_millis() as u64);
        let timeout = Timeout::new(saga_id, name, expired_at, data);

        // Registered before the task can claim it
        let mut pending = self
            .shared
            .pending
            .lock()
            .map_err(|e| TimeoutError::Scheduling(e.to_string().into()))?;

        let shared = Arc::clone(&self.shared);
        let task = self.executor.handle().spawn(async move {
            tokio::time::sleep(delay).await;
            if !shared.claim(saga_id, id) {
                return;
            }
            shared.stats.fired.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(saga_id = %saga_id, timeout_id = %id, "Timeout expired");

            let firing = Arc::clone(&shared);
            if let Err(error) = tokio::task::spawn_blocking(move || firing.fire(timeout)).await {
                tracing::error!(saga_id = %saga_id, error = %error, "Timeout delivery aborted");
            }
        });

        pending.entry(saga_id).or_default().push(PendingTimeout {
            id,
            name: name.map(Into::into),
            task,
        });
        self.shared.stats.requested.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            saga_id = %saga_id,
            timeout_id = %id,
            timeout = ?name,
            delay_ms = delay.as_millis() as u64,
            "Timeout requested"
        );
        Ok(id)
    }

    fn cancel_timeouts(&self, saga_id: SagaId) {
        let removed = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&saga_id)
            .unwrap_or_default();

        if removed.is_empty() {
            return;
        }
        for entry in &removed {
            entry.task.abort();
        }
        self.shared
            .stats
            .cancelled
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        tracing::debug!(saga_id = %saga_id, count = removed.len(), "Timeouts cancelled");
    }

    fn cancel_timeout(&self, saga_id: SagaId, name: &str) {
        let mut pending = self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = pending.get_mut(&saga_id) else {
            return;
        };

        let mut cancelled = 0_u64;
        entries.retain(|entry| {
            if entry.name.as_deref() == Some(name) {
                entry.task.abort();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        if entries.is_empty() {
            pending.remove(&saga_id);
        }
        drop(pending);

        if cancelled > 0 {
            self.shared.stats.cancelled.fetch_add(cancelled, Ordering::Relaxed);
            tracing::debug!(saga_id = %saga_id, timeout = %name, count = cancelled, "Timeout cancelled");
        }
    }

    fn add_expired_callback(&self, callback: ExpiredCallback) {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

impl Drop for TokioTimeoutManager {
    fn drop(&mut self) {
        let pending = std::mem::take(
            &mut *self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for entry in pending.into_values().flatten() {
            entry.task.abort();
        }
    }
}
