//! Saga providers and the instance factory

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::LazyCache;
use crate::{
    AnySaga, BoxError, HandlerCatalog, Saga, SagaError, SagaId, SagaState, SagaType,
    TimeoutManager,
};

/// Produces raw saga instances of one saga type
pub trait SagaProvider: Send + Sync + 'static {
    fn provide(&self) -> Result<Box<dyn AnySaga>, BoxError>;
}

impl<F> SagaProvider for F
where
    F: Fn() -> Result<Box<dyn AnySaga>, BoxError> + Send + Sync + 'static,
{
    fn provide(&self) -> Result<Box<dyn AnySaga>, BoxError> {
        self()
    }
}

/// Host integration point: hands out a provider per saga type
pub trait ProviderFactory: Send + Sync + 'static {
    fn create_provider(&self, saga_type: &SagaType) -> Option<Arc<dyn SagaProvider>>;
}

/// Provider factory backed by explicitly registered constructors
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<TypeId, Arc<dyn SagaProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct `S` with `make` for every message
    pub fn register<S, F>(&mut self, make: F) -> &mut Self
    where
        S: Saga,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.register_fallible::<S, _>(move || Ok(make()))
    }

    /// Like `register`, for constructors that can fail
    pub fn register_fallible<S, F>(&mut self, make: F) -> &mut Self
    where
        S: Saga,
        F: Fn() -> Result<S, BoxError> + Send + Sync + 'static,
    {
        let provider = move || -> Result<Box<dyn AnySaga>, BoxError> {
            Ok(Box::new(make()?) as Box<dyn AnySaga>)
        };
        self.providers.insert(TypeId::of::<S>(), Arc::new(provider));
        self
    }

    pub fn contains<S: Saga>(&self) -> bool {
        self.providers.contains_key(&TypeId::of::<S>())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl ProviderFactory for ProviderRegistry {
    fn create_provider(&self, saga_type: &SagaType) -> Option<Arc<dyn SagaProvider>> {
        self.providers.get(&saga_type.saga_type_id()).cloned()
    }
}

/// A materialized saga instance ready for handler invocation
pub struct SagaInstance {
    saga_type: Arc<SagaType>,
    saga: Box<dyn AnySaga>,
    created_new: bool,
}

impl SagaInstance {
    pub fn saga_type(&self) -> &Arc<SagaType> {
        &self.saga_type
    }

    pub fn saga(&self) -> &dyn AnySaga {
        &*self.saga
    }

    pub fn saga_mut(&mut self) -> &mut dyn AnySaga {
        &mut *self.saga
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga.current_id()
    }

    /// Whether the instance got a fresh state for this message
    pub fn created_new(&self) -> bool {
        self.created_new
    }
}

impl std::fmt::Debug for SagaInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaInstance")
            .field("saga_type", &self.saga_type.name())
            .field("saga_id", &self.saga_id())
            .field("created_new", &self.created_new)
            .finish()
    }
}

/// Creates and rehydrates saga instances.
///
/// Instances are never reused: every call asks the provider for a new one.
pub struct InstanceFactory {
    providers: Arc<dyn ProviderFactory>,
    timeouts: Arc<dyn TimeoutManager>,
    catalog: Arc<HandlerCatalog>,
    resolved: LazyCache<TypeId, Option<Arc<dyn SagaProvider>>>,
}

impl InstanceFactory {
    pub fn new(
        providers: Arc<dyn ProviderFactory>,
        timeouts: Arc<dyn TimeoutManager>,
        catalog: Arc<HandlerCatalog>,
    ) -> Self {
        Self {
            providers,
            timeouts,
            catalog,
            resolved: LazyCache::new(),
        }
    }

    /// New instance with a fresh id; `None` when the provider failed, which
    /// is logged and leaves other saga types unaffected.
    pub fn create_new(&self, saga_type: &Arc<SagaType>) -> Option<SagaInstance> {
        let mut saga = match self.instantiate(saga_type) {
            Ok(saga) => saga,
            Err(error) => {
                tracing::error!(
                    saga_type = %saga_type.name(),
                    error = %error,
                    "Failed to create saga instance, saga type skipped"
                );
                return None;
            }
        };
        saga.start_state(SagaId::new_random());

        Some(SagaInstance {
            saga_type: Arc::clone(saga_type),
            saga,
            created_new: true,
        })
    }

    /// Instance bound to an existing state; failures propagate
    pub fn continue_existing(
        &self,
        saga_type: &Arc<SagaType>,
        state: SagaState,
    ) -> Result<SagaInstance, SagaError> {
        let mut saga = self.instantiate(saga_type)?;
        saga.attach_state(state)?;

        Ok(SagaInstance {
            saga_type: Arc::clone(saga_type),
            saga,
            created_new: false,
        })
    }

    /// Like `continue_existing`, resolving the saga type from the state's name
    pub fn continue_from_state(&self, state: SagaState) -> Result<SagaInstance, SagaError> {
        let saga_type = self
            .catalog
            .by_name(state.saga_type())
            .cloned()
            .ok_or_else(|| SagaError::UnknownSagaType(state.saga_type().into()))?;
        self.continue_existing(&saga_type, state)
    }

    /// Raw instance from the provider, with timeouts injected on request
    pub(crate) fn instantiate(&self, saga_type: &SagaType) -> Result<Box<dyn AnySaga>, SagaError> {
        let provider = self
            .resolved
            .get_or_insert_with(saga_type.saga_type_id(), || {
                self.providers.create_provider(saga_type)
            })
            .ok_or_else(|| SagaError::ProviderMissing(saga_type.name().into()))?;

        let mut saga = provider.provide().map_err(|source| SagaError::Provider {
            saga_type: saga_type.name().into(),
            source,
        })?;

        if saga.saga_type_id() != saga_type.saga_type_id() {
            return Err(SagaError::ProviderMismatch {
                expected: saga_type.name().into(),
                actual: saga.type_name().into(),
            });
        }
        if saga.wants_timeouts() {
            saga.inject_timeouts(Arc::clone(&self.timeouts));
        }
        Ok(saga)
    }
}
