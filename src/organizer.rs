//! Message to saga routing

use std::any::TypeId;
use std::sync::Arc;

use crate::cache::LazyCache;
use crate::{
    type_domain, HandlerCatalog, HandlerDescriptor, InstanceFactory, InstanceKey, KeyExtractor,
    Message, MessageKind, Saga, SagaError, SagaId, SagaType, StateStorage, Timeout,
};

/// Saga types that must run before all others, in the given order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionOrder {
    saga_types: Vec<TypeId>,
}

impl ExecutionOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first<S: Saga>() -> Self {
        Self::new().then::<S>()
    }

    pub fn then<S: Saga>(mut self) -> Self {
        let id = TypeId::of::<S>();
        if !self.saga_types.contains(&id) {
            self.saga_types.push(id);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.saga_types.is_empty()
    }

    fn position(&self, id: TypeId) -> Option<usize> {
        self.saga_types.iter().position(|t| *t == id)
    }
}

/// How one saga type takes part in handling a message
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    /// Create a new instance
    StartNew { saga_type: Arc<SagaType> },
    /// Continue every stored instance of `saga_type` carrying `key`
    ContinueWithKey {
        saga_type: Arc<SagaType>,
        key: InstanceKey,
    },
    /// Continue the instance with this id, found by a timeout
    ContinueWithId {
        saga_type: Arc<SagaType>,
        saga_id: SagaId,
    },
}

impl Route {
    pub fn saga_type(&self) -> &Arc<SagaType> {
        match self {
            Self::StartNew { saga_type }
            | Self::ContinueWithKey { saga_type, .. }
            | Self::ContinueWithId { saga_type, .. } => saga_type,
        }
    }

    pub fn starts_new(&self) -> bool {
        matches!(self, Self::StartNew { .. })
    }
}

#[derive(Clone)]
struct Candidate {
    saga_type: Arc<SagaType>,
    starts: bool,
}

/// Resolves which saga types handle a message and in which order.
///
/// Everything derived from a concrete message type alone (its type domain,
/// the matching saga types, the handler per saga type) is cached.
pub struct Organizer {
    catalog: Arc<HandlerCatalog>,
    keys: KeyExtractor,
    order: ExecutionOrder,
    domains: LazyCache<TypeId, Arc<[MessageKind]>>,
    candidates: LazyCache<TypeId, Arc<[Candidate]>>,
    handlers: LazyCache<(TypeId, TypeId), Option<HandlerDescriptor>>,
}

impl Organizer {
    pub fn new(
        catalog: Arc<HandlerCatalog>,
        factory: Arc<InstanceFactory>,
        order: ExecutionOrder,
    ) -> Self {
        Self {
            catalog,
            keys: KeyExtractor::new(factory),
            order,
            domains: LazyCache::new(),
            candidates: LazyCache::new(),
            handlers: LazyCache::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<HandlerCatalog> {
        &self.catalog
    }

    /// Routes for `message`, in invocation order.
    ///
    /// Continuation sagas whose key reader yields nothing are left out. A
    /// timeout's owner is looked up in `storage` so it can take its place in
    /// the preferred order.
    pub fn resolve(
        &self,
        message: &dyn Message,
        storage: &dyn StateStorage,
    ) -> Result<Vec<Route>, SagaError> {
        let domain = self.domain_of(message);
        let candidates = self.candidates_for(message, &domain);

        if let Some(timeout) = message.downcast_ref::<Timeout>() {
            return self.resolve_timeout(timeout, &candidates, storage);
        }

        let mut routes = Vec::with_capacity(candidates.len());
        for candidate in candidates.iter() {
            let saga_type = Arc::clone(&candidate.saga_type);
            if candidate.starts {
                routes.push(Route::StartNew { saga_type });
                continue;
            }
            match self.keys.key(&saga_type, message, &domain)? {
                Some(key) => routes.push(Route::ContinueWithKey { saga_type, key }),
                None => tracing::debug!(
                    saga_type = %saga_type.name(),
                    message = %message.message_kind(),
                    "No instance key for continuation, saga type skipped"
                ),
            }
        }
        Ok(routes)
    }

    /// Every saga starting on timeouts, plus the saga that requested it
    fn resolve_timeout(
        &self,
        timeout: &Timeout,
        candidates: &[Candidate],
        storage: &dyn StateStorage,
    ) -> Result<Vec<Route>, SagaError> {
        let mut routes: Vec<Route> = candidates
            .iter()
            .filter(|c| c.starts)
            .map(|c| Route::StartNew {
                saga_type: Arc::clone(&c.saga_type),
            })
            .collect();

        let saga_id = timeout.saga_id();
        let Some(state) = storage.load(saga_id)? else {
            tracing::debug!(saga_id = %saga_id, "Timeout owner no longer stored");
            return Ok(routes);
        };
        let saga_type = self
            .catalog
            .by_name(state.saga_type())
            .cloned()
            .ok_or_else(|| SagaError::UnknownSagaType(state.saga_type().into()))?;
        routes.push(Route::ContinueWithId { saga_type, saga_id });

        Ok(self.ordered(routes, |r| (r.saga_type().saga_type_id(), r.starts_new())))
    }

    /// Handler `saga_type` registered for the most specific kind of `message`
    pub fn handler(&self, saga_type: &SagaType, message: &dyn Message) -> Option<HandlerDescriptor> {
        let key = (saga_type.saga_type_id(), message.message_kind().id());
        if let Some(hit) = self.handlers.get(&key) {
            return hit;
        }
        let domain = self.domain_of(message);
        self.handlers
            .get_or_insert_with(key, || saga_type.handler_for_domain(&domain).cloned())
    }

    /// Whether any saga type reacts to `message`
    pub fn is_handled(&self, message: &dyn Message) -> bool {
        let domain = self.domain_of(message);
        !self.candidates_for(message, &domain).is_empty()
    }

    fn domain_of(&self, message: &dyn Message) -> Arc<[MessageKind]> {
        self.domains
            .get_or_insert_with(message.message_kind().id(), || type_domain(message).into())
    }

    fn candidates_for(&self, message: &dyn Message, domain: &[MessageKind]) -> Arc<[Candidate]> {
        self.candidates
            .get_or_insert_with(message.message_kind().id(), || {
                let matched: Vec<Candidate> = self
                    .catalog
                    .saga_types()
                    .iter()
                    .filter_map(|saga_type| {
                        saga_type.handler_for_domain(domain).map(|handler| Candidate {
                            saga_type: Arc::clone(saga_type),
                            starts: handler.starts_saga(),
                        })
                    })
                    .collect();
                self.ordered(matched, |c| (c.saga_type.saga_type_id(), c.starts))
                    .into()
            })
    }

    /// Preferred types first, then starting sagas, then the rest; discovery
    /// order within each group.
    fn ordered<T>(&self, entries: Vec<T>, identity: impl Fn(&T) -> (TypeId, bool)) -> Vec<T> {
        if self.order.is_empty() {
            return entries;
        }

        let mut preferred: Vec<Vec<T>> = self.order.saga_types.iter().map(|_| Vec::new()).collect();
        let mut starts = Vec::new();
        let mut rest = Vec::new();
        for entry in entries {
            let (id, starts_new) = identity(&entry);
            match self.order.position(id) {
                Some(slot) => preferred[slot].push(entry),
                None if starts_new => starts.push(entry),
                None => rest.push(entry),
            }
        }

        preferred.into_iter().flatten().chain(starts).chain(rest).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ExecutionContext, ExpiredCallback, HandlerResult, HandlerTable, InMemoryStateStorage,
        KeyReaders, MessageInterface, ProviderRegistry, SagaCore, SagaState, TimeoutError,
        TimeoutId, TimeoutManager,
    };
    use std::time::Duration;

    struct NoTimeouts;

    impl TimeoutManager for NoTimeouts {
        fn request_timeout(
            &self,
            _saga_id: SagaId,
            _name: Option<&str>,
            _delay: Duration,
            _data: Option<serde_json::Value>,
        ) -> Result<TimeoutId, TimeoutError> {
            Err(TimeoutError::Unavailable)
        }
        fn cancel_timeouts(&self, _saga_id: SagaId) {}
        fn cancel_timeout(&self, _saga_id: SagaId, _name: &str) {}
        fn add_expired_callback(&self, _callback: ExpiredCallback) {}
    }

    struct Notice;
    impl MessageInterface for Notice {}

    #[derive(Debug)]
    struct Ping(i32);
    impl Message for Ping {
        fn supertypes(&self) -> Vec<MessageKind> {
            vec![MessageKind::interface::<Notice>()]
        }
    }

    macro_rules! starter {
        ($name:ident) => {
            #[derive(Default)]
            struct $name {
                core: SagaCore<()>,
            }

            impl Saga for $name {
                type Data = ();

                fn saga_type_name() -> &'static str {
                    stringify!($name)
                }

                fn describe_handlers(handlers: &mut HandlerTable<Self>) {
                    handlers.starts_with(|_: &mut Self, _: &Ping, _: &mut ExecutionContext| Ok(()));
                }

                fn core(&self) -> &SagaCore<()> {
                    &self.core
                }

                fn core_mut(&mut self) -> &mut SagaCore<()> {
                    &mut self.core
                }
            }
        };
    }

    starter!(A);
    starter!(B);
    starter!(C);

    #[derive(Default)]
    struct Follower {
        core: SagaCore<()>,
    }

    impl Follower {
        fn on_notice(&mut self, _msg: &dyn Message, _ctx: &mut ExecutionContext) -> HandlerResult {
            Ok(())
        }

        fn on_timeout(&mut self, _msg: &Timeout, _ctx: &mut ExecutionContext) -> HandlerResult {
            Ok(())
        }
    }

    impl Saga for Follower {
        type Data = ();

        fn saga_type_name() -> &'static str {
            "Follower"
        }

        fn describe_handlers(handlers: &mut HandlerTable<Self>) {
            handlers
                .handles_kind(MessageKind::interface::<Notice>(), Self::on_notice)
                .handles(Self::on_timeout);
        }

        fn key_readers(&self, readers: &mut KeyReaders) {
            readers.read(|m: &Ping| (m.0 > 0).then_some(m.0));
        }

        fn core(&self) -> &SagaCore<()> {
            &self.core
        }

        fn core_mut(&mut self) -> &mut SagaCore<()> {
            &mut self.core
        }
    }

    #[derive(Default)]
    struct Alarm {
        core: SagaCore<()>,
    }

    impl Saga for Alarm {
        type Data = ();

        fn saga_type_name() -> &'static str {
            "Alarm"
        }

        fn describe_handlers(handlers: &mut HandlerTable<Self>) {
            handlers.starts_with(|_: &mut Self, _: &Timeout, _: &mut ExecutionContext| Ok(()));
        }

        fn core(&self) -> &SagaCore<()> {
            &self.core
        }

        fn core_mut(&mut self) -> &mut SagaCore<()> {
            &mut self.core
        }
    }

    fn catalog() -> Arc<HandlerCatalog> {
        Arc::new(HandlerCatalog::build([
            SagaType::of::<Follower>(),
            SagaType::of::<A>(),
            SagaType::of::<B>(),
            SagaType::of::<C>(),
            SagaType::of::<Alarm>(),
        ]))
    }

    fn with_registry(order: ExecutionOrder, registry: ProviderRegistry) -> Organizer {
        let catalog = catalog();
        let factory = Arc::new(InstanceFactory::new(
            Arc::new(registry),
            Arc::new(NoTimeouts),
            Arc::clone(&catalog),
        ));
        Organizer::new(catalog, factory, order)
    }

    fn organizer(order: ExecutionOrder) -> Organizer {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Follower::default)
            .register(A::default)
            .register(B::default)
            .register(C::default)
            .register(Alarm::default);
        with_registry(order, registry)
    }

    fn names(routes: &[Route]) -> Vec<&'static str> {
        routes.iter().map(|r| r.saga_type().name()).collect()
    }

    fn resolve(organizer: &Organizer, message: &dyn Message) -> Vec<Route> {
        organizer.resolve(message, &InMemoryStateStorage::new()).unwrap()
    }

    fn follower_waiting_for_timeout() -> (InMemoryStateStorage, Timeout) {
        let storage = InMemoryStateStorage::new();
        let saga_id = SagaId::new_random();
        storage
            .save(&SagaState::new(saga_id, "Follower", serde_json::Value::Null))
            .unwrap();
        (storage, Timeout::new(saga_id, Some("t"), 0, None))
    }

    #[test]
    fn discovery_order_without_preference() {
        let routes = resolve(&organizer(ExecutionOrder::new()), &Ping(5));
        assert_eq!(names(&routes), vec!["Follower", "A", "B", "C"]);
    }

    #[test]
    fn preferred_then_starts_then_rest() {
        let order = ExecutionOrder::first::<C>().then::<B>();
        let routes = resolve(&organizer(order), &Ping(5));
        assert_eq!(names(&routes), vec!["C", "B", "A", "Follower"]);
    }

    #[test]
    fn continuation_via_interface_carries_key() {
        let routes = resolve(&organizer(ExecutionOrder::new()), &Ping(5));
        assert_eq!(
            routes[0],
            Route::ContinueWithKey {
                saga_type: Arc::new(SagaType::of::<Follower>()),
                key: InstanceKey::Int(5),
            }
        );
    }

    #[test]
    fn missing_key_drops_continuation() {
        let routes = resolve(&organizer(ExecutionOrder::new()), &Ping(-1));
        assert_eq!(names(&routes), vec!["A", "B", "C"]);
        assert!(routes.iter().all(Route::starts_new));
    }

    #[test]
    fn key_reader_provider_failure_is_an_error() {
        let mut registry = ProviderRegistry::new();
        registry
            .register_fallible::<Follower, _>(|| Err("deployment mismatch".into()))
            .register(A::default);
        let organizer = with_registry(ExecutionOrder::new(), registry);

        let err = organizer
            .resolve(&Ping(5), &InMemoryStateStorage::new())
            .unwrap_err();
        assert!(matches!(err, SagaError::Provider { ref saga_type, .. } if &**saga_type == "Follower"));
    }

    #[test]
    fn timeout_starts_and_continues_by_id() {
        let (storage, timeout) = follower_waiting_for_timeout();
        let routes = organizer(ExecutionOrder::new())
            .resolve(&timeout, &storage)
            .unwrap();

        assert_eq!(names(&routes), vec!["Alarm", "Follower"]);
        assert!(routes[0].starts_new());
        assert!(matches!(
            &routes[1],
            Route::ContinueWithId { saga_id, .. } if *saga_id == timeout.saga_id()
        ));
    }

    #[test]
    fn timeout_owner_follows_preferred_order() {
        let (storage, timeout) = follower_waiting_for_timeout();
        let routes = organizer(ExecutionOrder::first::<Follower>())
            .resolve(&timeout, &storage)
            .unwrap();

        assert_eq!(names(&routes), vec!["Follower", "Alarm"]);
    }

    #[test]
    fn timeout_of_vanished_saga_only_starts() {
        let timeout = Timeout::new(SagaId::new_random(), None, 0, None);
        let routes = resolve(&organizer(ExecutionOrder::new()), &timeout);
        assert_eq!(names(&routes), vec!["Alarm"]);
    }

    #[test]
    fn timeout_owner_of_unknown_type() {
        let storage = InMemoryStateStorage::new();
        let saga_id = SagaId::new_random();
        storage
            .save(&SagaState::new(saga_id, "retired", serde_json::Value::Null))
            .unwrap();

        let err = organizer(ExecutionOrder::new())
            .resolve(&Timeout::new(saga_id, None, 0, None), &storage)
            .unwrap_err();
        assert!(matches!(err, SagaError::UnknownSagaType(_)));
    }

    #[test]
    fn unrouted_message() {
        let organizer = organizer(ExecutionOrder::new());
        assert!(resolve(&organizer, &"nobody listens").is_empty());
        assert!(!organizer.is_handled(&"nobody listens"));
    }

    #[test]
    fn handler_lookup_prefers_specific_kind() {
        let organizer = organizer(ExecutionOrder::new());
        let follower = SagaType::of::<Follower>();
        let handler = organizer.handler(&follower, &Ping(1)).unwrap();
        assert!(handler.kind().is::<Notice>());
        assert!(!handler.starts_saga());
        assert!(organizer.handler(&follower, &true).is_none());
    }
}
