//! Message stream facade and its builder

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::coordinator::ModuleCoordinator;
use crate::executor::Executor;
use crate::stats::{StreamStats, StreamStatsSnapshot};
use crate::task::ExecutionTask;
use crate::{
    ConfigError, ExecutionContext, ExecutionOrder, HandlerCatalog, Headers, InMemoryStateStorage,
    InstanceFactory, Message, Organizer, ParentContext, ProviderFactory, ProviderRegistry, Saga,
    SagaError, SagaLifetimeInterceptor, SagaModule, SagaProvider, SagaScanner, SagaType,
    StateStorage, StaticScanner, Timeout, TimeoutManager, TokioTimeoutManager,
};

/// Everything needed to run a message, shared by the stream, nested
/// dispatches and timeout callbacks.
pub(crate) struct Pipeline {
    pub(crate) organizer: Organizer,
    pub(crate) factory: Arc<InstanceFactory>,
    pub(crate) storage: Arc<dyn StateStorage>,
    pub(crate) timeouts: Arc<dyn TimeoutManager>,
    pub(crate) modules: ModuleCoordinator,
    pub(crate) interceptors: Vec<Arc<dyn SagaLifetimeInterceptor>>,
    pub(crate) stats: StreamStats,
}

impl Pipeline {
    pub(crate) fn handle(
        self: &Arc<Self>,
        message: Arc<dyn Message>,
        headers: Headers,
        parent: Option<Arc<ParentContext>>,
    ) -> Result<(), SagaError> {
        StreamStats::bump(&self.stats.messages_received);
        let mut context = ExecutionContext::attached(self, message, headers, parent);
        ExecutionTask::new(self).run(&mut context)
    }
}

/// Entry point for handing messages to sagas.
///
/// `handle` runs the whole pipeline on the calling thread and may be called
/// concurrently. `add` runs it on the stream's runtime instead.
///
/// # Example
///
/// ```rust,ignore
/// let stream = MessageStream::builder()
///     .with_saga(OrderSaga::default)
///     .build()?;
///
/// stream.handle(OrderPlaced { order_id: 7 })?;
/// ```
pub struct MessageStream {
    pipeline: Arc<Pipeline>,
    executor: Arc<Executor>,
}

impl MessageStream {
    pub fn builder() -> MessageStreamBuilder {
        MessageStreamBuilder::new()
    }

    /// Route `message` to every matching saga before returning
    pub fn handle<M: Message>(&self, message: M) -> Result<(), SagaError> {
        self.handle_with_headers(message, Headers::new())
    }

    pub fn handle_with_headers<M: Message>(
        &self,
        message: M,
        headers: Headers,
    ) -> Result<(), SagaError> {
        self.pipeline.handle(Arc::new(message), headers, None)
    }

    /// Like `handle`, for an already erased message
    pub fn handle_message(
        &self,
        message: Arc<dyn Message>,
        headers: Headers,
    ) -> Result<(), SagaError> {
        self.pipeline.handle(message, headers, None)
    }

    /// Handle `message` on the stream's runtime
    pub fn add<M: Message>(&self, message: M) -> JoinHandle<Result<(), SagaError>> {
        self.add_with_headers(message, Headers::new())
    }

    pub fn add_with_headers<M: Message>(
        &self,
        message: M,
        headers: Headers,
    ) -> JoinHandle<Result<(), SagaError>> {
        let pipeline = Arc::clone(&self.pipeline);
        self.executor
            .handle()
            .spawn_blocking(move || pipeline.handle(Arc::new(message), headers, None))
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.pipeline.stats.snapshot()
    }

    pub fn state_storage(&self) -> &Arc<dyn StateStorage> {
        &self.pipeline.storage
    }

    pub fn timeout_manager(&self) -> &Arc<dyn TimeoutManager> {
        &self.pipeline.timeouts
    }

    pub fn catalog(&self) -> &Arc<HandlerCatalog> {
        self.pipeline.organizer.catalog()
    }
}

/// Explicit provider factory first, registered constructors second
struct LayeredProviders {
    primary: Arc<dyn ProviderFactory>,
    registry: ProviderRegistry,
}

impl ProviderFactory for LayeredProviders {
    fn create_provider(&self, saga_type: &SagaType) -> Option<Arc<dyn SagaProvider>> {
        self.primary
            .create_provider(saga_type)
            .or_else(|| self.registry.create_provider(saga_type))
    }
}

/// Builder for [`MessageStream`]
#[derive(Default)]
pub struct MessageStreamBuilder {
    registered: StaticScanner,
    registry: ProviderRegistry,
    scanner: Option<Arc<dyn SagaScanner>>,
    storage: Option<Arc<dyn StateStorage>>,
    timeouts: Option<Arc<dyn TimeoutManager>>,
    providers: Option<Arc<dyn ProviderFactory>>,
    order: ExecutionOrder,
    modules: Vec<Arc<dyn SagaModule>>,
    interceptors: Vec<Arc<dyn SagaLifetimeInterceptor>>,
    executor: Option<Handle>,
}

impl MessageStreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route to saga `S`, built by `make` for every message
    pub fn with_saga<S, F>(mut self, make: F) -> Self
    where
        S: Saga,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.registered.add::<S>();
        self.registry.register(make);
        self
    }

    /// Replace the saga types registered with `with_saga` as routing source
    pub fn with_scanner(mut self, scanner: impl SagaScanner) -> Self {
        self.scanner = Some(Arc::new(scanner));
        self
    }

    pub fn with_state_storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_timeout_manager(mut self, timeouts: Arc<dyn TimeoutManager>) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Host provider factory, consulted before `with_saga` constructors
    pub fn with_provider_factory(mut self, providers: Arc<dyn ProviderFactory>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_execution_order(mut self, order: ExecutionOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_module(mut self, module: impl SagaModule) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    pub fn with_interceptor(mut self, interceptor: impl SagaLifetimeInterceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Runtime for `add` and the default timeout manager
    pub fn with_executor(mut self, handle: Handle) -> Self {
        self.executor = Some(handle);
        self
    }

    pub fn build(self) -> Result<MessageStream, ConfigError> {
        let providers: Arc<dyn ProviderFactory> = match self.providers {
            Some(primary) if self.registry.is_empty() => primary,
            Some(primary) => Arc::new(LayeredProviders {
                primary,
                registry: self.registry,
            }),
            None if !self.registry.is_empty() => Arc::new(self.registry),
            None => return Err(ConfigError::MissingProviderFactory),
        };

        let executor = Arc::new(match self.executor {
            Some(handle) => Executor::from_handle(handle),
            None => Executor::current_or_dedicated("saga-stream")?,
        });

        let saga_types = match &self.scanner {
            Some(scanner) => scanner.scan_for_sagas(),
            None => self.registered.scan_for_sagas(),
        };
        let catalog = Arc::new(HandlerCatalog::build(saga_types));

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStateStorage::new()));
        let timeouts = self.timeouts.unwrap_or_else(|| {
            Arc::new(TokioTimeoutManager::with_executor(Arc::clone(&executor)))
        });

        let factory = Arc::new(InstanceFactory::new(
            providers,
            Arc::clone(&timeouts),
            Arc::clone(&catalog),
        ));
        let organizer = Organizer::new(Arc::clone(&catalog), Arc::clone(&factory), self.order);

        let pipeline = Arc::new(Pipeline {
            organizer,
            factory,
            storage,
            timeouts,
            modules: ModuleCoordinator::new(self.modules),
            interceptors: self.interceptors,
            stats: StreamStats::new(),
        });

        let weak = Arc::downgrade(&pipeline);
        pipeline
            .timeouts
            .add_expired_callback(Arc::new(move |timeout: Timeout| -> Result<(), SagaError> {
                let pipeline = weak.upgrade().ok_or(SagaError::StreamClosed)?;
                pipeline.handle(Arc::new(timeout), Headers::new(), None)
            }));

        tracing::debug!(saga_types = catalog.len(), "Message stream built");
        Ok(MessageStream { pipeline, executor })
    }
}
