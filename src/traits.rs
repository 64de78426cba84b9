//! Core traits for sagas

use std::any::{Any, TypeId};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{
    HandlerTable, KeyReaders, SagaError, SagaId, SagaState, TimeoutError, TimeoutId,
    TimeoutManager,
};

/// Runtime parts every saga carries: its state, the finished flag and,
/// when requested, the timeout manager.
pub struct SagaCore<D> {
    pub(crate) state: SagaState<D>,
    pub(crate) finished: bool,
    pub(crate) timeouts: Option<Arc<dyn TimeoutManager>>,
}

impl<D: Default> SagaCore<D> {
    pub fn new() -> Self {
        Self {
            state: SagaState::default(),
            finished: false,
            timeouts: None,
        }
    }
}

impl<D: Default> Default for SagaCore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for SagaCore<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaCore")
            .field("state", &self.state)
            .field("finished", &self.finished)
            .field("has_timeouts", &self.timeouts.is_some())
            .finish()
    }
}

/// A long-lived workflow that reacts to a sequence of related messages.
///
/// A fresh instance is requested from the host provider for every message;
/// anything that must survive between messages lives in `Self::Data`.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Default)]
/// struct ShippingSaga { core: SagaCore<Shipping> }
///
/// impl Saga for ShippingSaga {
///     type Data = Shipping;
///
///     fn saga_type_name() -> &'static str { "shipping" }
///
///     fn describe_handlers(handlers: &mut HandlerTable<Self>) {
///         handlers
///             .starts_with(Self::on_order_placed)
///             .handles(Self::on_parcel_delivered);
///     }
///
///     fn key_readers(&self, readers: &mut KeyReaders) {
///         readers.read(|m: &ParcelDelivered| Some(m.order_id));
///     }
///
///     fn core(&self) -> &SagaCore<Shipping> { &self.core }
///     fn core_mut(&mut self) -> &mut SagaCore<Shipping> { &mut self.core }
/// }
/// ```
pub trait Saga: Send + 'static {
    /// Durable payload of this saga
    type Data: Default + Serialize + DeserializeOwned + Send + 'static;

    /// Name stored with every state of this saga type.
    ///
    /// Persisted states are found again by this name, so it must stay the
    /// same across builds and renames of the Rust type.
    fn saga_type_name() -> &'static str
    where
        Self: Sized;

    /// Register the messages this saga starts on or continues with
    fn describe_handlers(handlers: &mut HandlerTable<Self>)
    where
        Self: Sized;

    /// Declare how continuation messages map to instance keys.
    ///
    /// Called once per saga type on a throwaway instance.
    fn key_readers(&self, _readers: &mut KeyReaders) {}

    fn core(&self) -> &SagaCore<Self::Data>;

    fn core_mut(&mut self) -> &mut SagaCore<Self::Data>;

    /// Payload for a saga that is being started
    fn create_new_state(&self) -> Self::Data {
        Self::Data::default()
    }

    /// Whether the timeout manager should be injected before handlers run
    fn needs_timeouts(&self) -> bool {
        false
    }

    // === Provided ===

    fn state(&self) -> &SagaState<Self::Data> {
        &self.core().state
    }

    fn state_mut(&mut self) -> &mut SagaState<Self::Data> {
        &mut self.core_mut().state
    }

    fn saga_id(&self) -> SagaId {
        self.core().state.id()
    }

    fn is_finished(&self) -> bool {
        self.core().finished
    }

    /// Mark the saga complete; its state is removed after the handler returns
    fn set_finished(&mut self) {
        self.core_mut().finished = true;
    }

    /// Ask for a [`crate::Timeout`] message to be delivered to this saga after `delay`
    fn request_timeout(
        &self,
        name: &str,
        delay: Duration,
        data: Option<serde_json::Value>,
    ) -> Result<TimeoutId, SagaError> {
        let manager = self.core().timeouts.as_ref().ok_or(TimeoutError::Unavailable)?;
        Ok(manager.request_timeout(self.saga_id(), Some(name), delay, data)?)
    }

    /// Cancel every pending timeout of this saga
    fn cancel_timeouts(&self) -> Result<(), SagaError> {
        let manager = self.core().timeouts.as_ref().ok_or(TimeoutError::Unavailable)?;
        manager.cancel_timeouts(self.saga_id());
        Ok(())
    }
}

/// Type-erased view of a saga instance used by the pipeline
pub trait AnySaga: Send {
    fn type_name(&self) -> &'static str;

    fn saga_type_id(&self) -> TypeId;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn current_id(&self) -> SagaId;

    /// Attach a fresh state carrying `id` and the saga type name
    fn start_state(&mut self, id: SagaId);

    /// Attach a previously stored state as-is
    fn attach_state(&mut self, state: SagaState) -> Result<(), SagaError>;

    fn snapshot_state(&self) -> Result<SagaState, SagaError>;

    fn finished(&self) -> bool;

    fn wants_timeouts(&self) -> bool;

    fn inject_timeouts(&mut self, manager: Arc<dyn TimeoutManager>);

    fn declare_key_readers(&self) -> KeyReaders;
}

impl<S: Saga> AnySaga for S {
    fn type_name(&self) -> &'static str {
        S::saga_type_name()
    }

    fn saga_type_id(&self) -> TypeId {
        TypeId::of::<S>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn current_id(&self) -> SagaId {
        self.saga_id()
    }

    fn start_state(&mut self, id: SagaId) {
        let data = self.create_new_state();
        let core = self.core_mut();
        core.state = SagaState::new(id, S::saga_type_name(), data);
        core.finished = false;
    }

    fn attach_state(&mut self, state: SagaState) -> Result<(), SagaError> {
        let state = state.into_typed::<S::Data>()?;
        let core = self.core_mut();
        core.state = state;
        core.finished = false;
        Ok(())
    }

    fn snapshot_state(&self) -> Result<SagaState, SagaError> {
        self.state().to_stored()
    }

    fn finished(&self) -> bool {
        self.is_finished()
    }

    fn wants_timeouts(&self) -> bool {
        self.needs_timeouts()
    }

    fn inject_timeouts(&mut self, manager: Arc<dyn TimeoutManager>) {
        self.core_mut().timeouts = Some(manager);
    }

    fn declare_key_readers(&self) -> KeyReaders {
        let mut readers = KeyReaders::new();
        self.key_readers(&mut readers);
        readers
    }
}

impl std::fmt::Debug for dyn AnySaga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnySaga")
            .field("type", &self.type_name())
            .field("id", &self.current_id())
            .field("finished", &self.finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecutionContext, HandlerResult};
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        hits: u32,
    }

    #[derive(Default)]
    struct CounterSaga {
        core: SagaCore<Counter>,
    }

    impl CounterSaga {
        fn on_start(&mut self, _msg: &String, _ctx: &mut ExecutionContext) -> HandlerResult {
            self.state_mut().data.hits += 1;
            Ok(())
        }
    }

    impl Saga for CounterSaga {
        type Data = Counter;

        fn saga_type_name() -> &'static str {
            "counter"
        }

        fn describe_handlers(handlers: &mut HandlerTable<Self>) {
            handlers.starts_with(Self::on_start);
        }

        fn core(&self) -> &SagaCore<Counter> {
            &self.core
        }

        fn core_mut(&mut self) -> &mut SagaCore<Counter> {
            &mut self.core
        }
    }

    #[test]
    fn start_state_sets_identity() {
        let mut saga: Box<dyn AnySaga> = Box::new(CounterSaga::default());
        let id = SagaId::new_random();
        saga.start_state(id);

        let snapshot = saga.snapshot_state().unwrap();
        assert_eq!(snapshot.id(), id);
        assert_eq!(snapshot.saga_type(), "counter");
        assert_eq!(snapshot.data, serde_json::json!({ "hits": 0 }));
    }

    #[test]
    fn declared_name_is_used_everywhere() {
        let saga: Box<dyn AnySaga> = Box::new(CounterSaga::default());
        assert_eq!(saga.type_name(), "counter");
        assert_eq!(crate::SagaType::of::<CounterSaga>().name(), "counter");
    }

    #[test]
    fn attach_keeps_existing_id() {
        let id = SagaId::new_random();
        let stored = SagaState::new(id, "counter", serde_json::json!({ "hits": 3 }));

        let mut saga: Box<dyn AnySaga> = Box::new(CounterSaga::default());
        saga.attach_state(stored).unwrap();

        let typed = saga.as_any().downcast_ref::<CounterSaga>().unwrap();
        assert_eq!(typed.saga_id(), id);
        assert_eq!(typed.state().data.hits, 3);
    }

    #[test]
    fn timeouts_unavailable_without_injection() {
        let saga = CounterSaga::default();
        let err = saga
            .request_timeout("reminder", Duration::from_secs(1), None)
            .unwrap_err();
        assert!(matches!(err, SagaError::Timeout(TimeoutError::Unavailable)));
    }
}
