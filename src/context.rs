//! Saga identity and per-message execution context

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream::Pipeline;
use crate::{Message, SagaError};

/// Unique identifier for a saga instance
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SagaId(pub Uuid);

impl SagaId {
    /// Generate a fresh random saga ID
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero ID carried by state that has not been started yet
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Get the raw UUID
    pub fn get(&self) -> Uuid {
        self.0
    }

    /// Whether this is the placeholder ID of an unstarted state
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::nil()
    }
}

impl std::fmt::Debug for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SagaId({})", self.0)
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SagaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Get current time in milliseconds since UNIX epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Key/value side channel travelling with a message.
///
/// Values are shared, so copying headers into a nested dispatch is cheap.
#[derive(Clone, Default)]
pub struct Headers {
    values: HashMap<Box<str>, Arc<dyn Any + Send + Sync>>,
}

impl Headers {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header value
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<Box<str>>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    /// Builder-style insert
    pub fn with<T: Any + Send + Sync>(mut self, key: impl Into<Box<str>>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    /// Typed lookup; `None` when absent or of a different type
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Whether a header with this key exists
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Remove a header
    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// Header keys, in no particular order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_ref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for Headers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// The saga instance a context is currently bound to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurrentSaga {
    pub saga_id: SagaId,
    pub saga_type: &'static str,
}

/// Frozen view of the context that triggered a nested dispatch
#[derive(Clone, Debug)]
pub struct ParentContext {
    message: Arc<dyn Message>,
    saga: Option<CurrentSaga>,
    headers: Headers,
    parent: Option<Arc<ParentContext>>,
}

impl ParentContext {
    pub fn message(&self) -> &dyn Message {
        &*self.message
    }

    pub fn saga(&self) -> Option<CurrentSaga> {
        self.saga
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn parent(&self) -> Option<&ParentContext> {
        self.parent.as_deref()
    }
}

/// Per-message execution context.
///
/// One context is created for every handled message and shared by all saga
/// handlers invoked for it. Nested dispatches get their own context that
/// points back at a snapshot of this one.
pub struct ExecutionContext {
    message: Arc<dyn Message>,
    saga: Option<CurrentSaga>,
    dispatching_stopped: bool,
    headers: Headers,
    parent: Option<Arc<ParentContext>>,
    pipeline: Weak<Pipeline>,
}

impl ExecutionContext {
    /// Create a context that is not attached to a running stream.
    ///
    /// Useful when driving saga handlers directly; `dispatch` on such a
    /// context fails with [`SagaError::StreamClosed`].
    pub fn new(message: Arc<dyn Message>, headers: Headers) -> Self {
        Self {
            message,
            saga: None,
            dispatching_stopped: false,
            headers,
            parent: None,
            pipeline: Weak::new(),
        }
    }

    pub(crate) fn attached(
        pipeline: &Arc<Pipeline>,
        message: Arc<dyn Message>,
        headers: Headers,
        parent: Option<Arc<ParentContext>>,
    ) -> Self {
        Self {
            message,
            saga: None,
            dispatching_stopped: false,
            headers,
            parent,
            pipeline: Arc::downgrade(pipeline),
        }
    }

    /// The message currently being dispatched
    pub fn message(&self) -> &dyn Message {
        &*self.message
    }

    pub(crate) fn message_arc(&self) -> &Arc<dyn Message> {
        &self.message
    }

    /// The saga instance whose handler is running, if any
    pub fn saga(&self) -> Option<CurrentSaga> {
        self.saga
    }

    pub fn saga_id(&self) -> Option<SagaId> {
        self.saga.map(|s| s.saga_id)
    }

    pub(crate) fn bind(&mut self, saga: CurrentSaga, message: Arc<dyn Message>) {
        self.saga = Some(saga);
        self.message = message;
    }

    /// Skip every saga type that has not yet run for the current message.
    ///
    /// The handler that calls this still runs to completion.
    pub fn stop_dispatching(&mut self) {
        self.dispatching_stopped = true;
    }

    pub fn dispatching_stopped(&self) -> bool {
        self.dispatching_stopped
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Typed header lookup
    pub fn header<T: Any>(&self, key: &str) -> Option<&T> {
        self.headers.get(key)
    }

    pub fn set_header<T: Any + Send + Sync>(&mut self, key: impl Into<Box<str>>, value: T) {
        self.headers.insert(key, value);
    }

    /// The context that dispatched this message, for nested dispatches
    pub fn parent(&self) -> Option<&ParentContext> {
        self.parent.as_deref()
    }

    /// Snapshot of this context used as the parent of a nested dispatch
    pub fn snapshot(&self) -> ParentContext {
        ParentContext {
            message: Arc::clone(&self.message),
            saga: self.saga,
            headers: self.headers.clone(),
            parent: self.parent.clone(),
        }
    }

    /// Run a message through the full pipeline before returning.
    ///
    /// The nested message gets a fresh context carrying a copy of this
    /// context's headers and a reference to it as parent.
    pub fn dispatch<M: Message>(&self, message: M) -> Result<(), SagaError> {
        let pipeline = self.pipeline.upgrade().ok_or(SagaError::StreamClosed)?;
        pipeline.handle(
            Arc::new(message),
            self.headers.clone(),
            Some(Arc::new(self.snapshot())),
        )
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("message", &self.message.message_kind())
            .field("saga", &self.saga)
            .field("dispatching_stopped", &self.dispatching_stopped)
            .field("headers", &self.headers)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
