//! Handler registration and the handler catalog

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{
    AnySaga, BoxError, ExecutionContext, HandlerResult, Message, MessageKind, Saga, SagaError,
    SagaType,
};

/// Erased handler entry point
pub type InvokeFn =
    dyn Fn(&mut dyn AnySaga, &dyn Message, &mut ExecutionContext) -> HandlerResult + Send + Sync;

/// How a handler is reached
#[derive(Clone)]
pub enum HandlerTarget {
    /// A handler taking one concrete message type
    Typed(Arc<InvokeFn>),
    /// A handler registered for an interface, receiving the message as `&dyn Message`
    Dynamic(Arc<InvokeFn>),
}

impl HandlerTarget {
    fn label(&self) -> &'static str {
        match self {
            Self::Typed(_) => "typed",
            Self::Dynamic(_) => "dynamic",
        }
    }
}

/// One (message kind, starting flag, invocation target) entry
#[derive(Clone)]
pub struct HandlerDescriptor {
    kind: MessageKind,
    starts: bool,
    target: HandlerTarget,
}

impl HandlerDescriptor {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Whether this handler creates a new saga instance
    pub fn starts_saga(&self) -> bool {
        self.starts
    }

    pub fn target(&self) -> &HandlerTarget {
        &self.target
    }

    pub fn invoke(
        &self,
        saga: &mut dyn AnySaga,
        message: &dyn Message,
        context: &mut ExecutionContext,
    ) -> HandlerResult {
        match &self.target {
            HandlerTarget::Typed(invoke) | HandlerTarget::Dynamic(invoke) => {
                invoke(saga, message, context)
            }
        }
    }
}

impl PartialEq for HandlerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.starts == other.starts
            && self.target.label() == other.target.label()
    }
}

impl Eq for HandlerDescriptor {}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("kind", &self.kind)
            .field("starts", &self.starts)
            .field("target", &self.target.label())
            .finish()
    }
}

/// Handler self-description filled in by [`Saga::describe_handlers`]
pub struct HandlerTable<S> {
    entries: Vec<HandlerDescriptor>,
    _saga: PhantomData<fn(S)>,
}

impl<S: Saga> HandlerTable<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            _saga: PhantomData,
        }
    }

    /// Start a new saga instance when `M` arrives
    pub fn starts_with<M, F>(&mut self, handler: F) -> &mut Self
    where
        M: Message,
        F: Fn(&mut S, &M, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(MessageKind::of::<M>(), true, HandlerTarget::Typed(typed::<S, M, F>(handler)))
    }

    /// Continue an existing saga instance when `M` arrives
    pub fn handles<M, F>(&mut self, handler: F) -> &mut Self
    where
        M: Message,
        F: Fn(&mut S, &M, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(MessageKind::of::<M>(), false, HandlerTarget::Typed(typed::<S, M, F>(handler)))
    }

    /// Start a new saga instance for any message routed under `kind`
    pub fn starts_with_kind<F>(&mut self, kind: MessageKind, handler: F) -> &mut Self
    where
        F: Fn(&mut S, &dyn Message, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(kind, true, HandlerTarget::Dynamic(dynamic::<S, F>(handler)))
    }

    /// Continue an existing saga instance for any message routed under `kind`
    pub fn handles_kind<F>(&mut self, kind: MessageKind, handler: F) -> &mut Self
    where
        F: Fn(&mut S, &dyn Message, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(kind, false, HandlerTarget::Dynamic(dynamic::<S, F>(handler)))
    }

    fn register(&mut self, kind: MessageKind, starts: bool, target: HandlerTarget) -> &mut Self {
        if self.entries.iter().any(|e| e.kind == kind) {
            tracing::warn!(
                saga_type = %S::saga_type_name(),
                message = %kind,
                "Duplicate handler registration skipped"
            );
            return self;
        }
        self.entries.push(HandlerDescriptor { kind, starts, target });
        self
    }

    pub(crate) fn into_entries(self) -> Vec<HandlerDescriptor> {
        self.entries
    }
}

fn downcast_saga<S: Saga>(saga: &mut dyn AnySaga) -> Result<&mut S, BoxError> {
    let actual = saga.type_name();
    saga.as_any_mut().downcast_mut::<S>().ok_or_else(|| {
        Box::new(SagaError::ProviderMismatch {
            expected: S::saga_type_name().into(),
            actual: actual.into(),
        }) as BoxError
    })
}

fn typed<S, M, F>(handler: F) -> Arc<InvokeFn>
where
    S: Saga,
    M: Message,
    F: Fn(&mut S, &M, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(
        move |saga: &mut dyn AnySaga,
              message: &dyn Message,
              context: &mut ExecutionContext|
              -> HandlerResult {
            let saga = downcast_saga::<S>(saga)?;
            let message = message.downcast_ref::<M>().ok_or_else(|| {
                Box::new(SagaError::MessageMismatch {
                    expected: std::any::type_name::<M>(),
                    actual: message.message_kind().name(),
                }) as BoxError
            })?;
            handler(saga, message, context)
        },
    )
}

fn dynamic<S, F>(handler: F) -> Arc<InvokeFn>
where
    S: Saga,
    F: Fn(&mut S, &dyn Message, &mut ExecutionContext) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(
        move |saga: &mut dyn AnySaga,
              message: &dyn Message,
              context: &mut ExecutionContext|
              -> HandlerResult {
            let saga = downcast_saga::<S>(saga)?;
            handler(saga, message, context)
        },
    )
}

/// Every known saga type with its handlers, indexed by saga type and by
/// message kind.
///
/// Built once at startup; routing only ever reads it.
#[derive(Default)]
pub struct HandlerCatalog {
    saga_types: Vec<Arc<SagaType>>,
    by_kind: HashMap<TypeId, Vec<usize>>,
    by_name: HashMap<&'static str, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl HandlerCatalog {
    /// Build from scanned saga types.
    ///
    /// Saga types without handlers are dropped, repeated saga types keep
    /// their first occurrence.
    pub fn build(saga_types: impl IntoIterator<Item = SagaType>) -> Self {
        let mut catalog = Self::default();

        for saga_type in saga_types {
            if saga_type.handlers().is_empty() {
                tracing::debug!(saga_type = %saga_type.name(), "Saga type has no handlers, skipped");
                continue;
            }
            if catalog.by_type.contains_key(&saga_type.saga_type_id()) {
                tracing::debug!(saga_type = %saga_type.name(), "Saga type listed twice, skipped");
                continue;
            }
            if catalog.by_name.contains_key(saga_type.name()) {
                tracing::warn!(
                    saga_type = %saga_type.name(),
                    "Two saga types share a name, later one skipped"
                );
                continue;
            }

            let index = catalog.saga_types.len();
            for handler in saga_type.handlers() {
                catalog.by_kind.entry(handler.kind().id()).or_default().push(index);
            }
            catalog.by_name.insert(saga_type.name(), index);
            catalog.by_type.insert(saga_type.saga_type_id(), index);
            catalog.saga_types.push(Arc::new(saga_type));
        }

        tracing::debug!(saga_types = catalog.saga_types.len(), "Handler catalog built");
        catalog
    }

    /// All saga types in discovery order
    pub fn saga_types(&self) -> &[Arc<SagaType>] {
        &self.saga_types
    }

    /// Saga types with a handler registered for exactly `kind`, in discovery order
    pub fn sagas_handling(&self, kind: &MessageKind) -> impl Iterator<Item = &Arc<SagaType>> {
        self.by_kind
            .get(&kind.id())
            .into_iter()
            .flatten()
            .map(|&i| &self.saga_types[i])
    }

    pub fn handles(&self, kind: &MessageKind) -> bool {
        self.by_kind.contains_key(&kind.id())
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<SagaType>> {
        self.by_name.get(name).map(|&i| &self.saga_types[i])
    }

    pub fn by_type_id(&self, id: TypeId) -> Option<&Arc<SagaType>> {
        self.by_type.get(&id).map(|&i| &self.saga_types[i])
    }

    pub fn len(&self) -> usize {
        self.saga_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saga_types.is_empty()
    }
}

impl PartialEq for HandlerCatalog {
    fn eq(&self, other: &Self) -> bool {
        self.saga_types.len() == other.saga_types.len()
            && self
                .saga_types
                .iter()
                .zip(&other.saga_types)
                .all(|(a, b)| **a == **b)
    }
}

impl std::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.saga_types.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Headers, MessageInterface, SagaCore};

    struct Greeting;
    impl MessageInterface for Greeting {}

    #[derive(Default)]
    struct Echo {
        core: SagaCore<Vec<String>>,
    }

    impl Echo {
        fn on_text(&mut self, msg: &String, _ctx: &mut ExecutionContext) -> HandlerResult {
            self.state_mut().data.push(msg.clone());
            Ok(())
        }

        fn on_number(&mut self, msg: &i32, _ctx: &mut ExecutionContext) -> HandlerResult {
            self.state_mut().data.push(msg.to_string());
            Ok(())
        }
    }

    impl Saga for Echo {
        type Data = Vec<String>;

        fn saga_type_name() -> &'static str {
            "echo"
        }

        fn describe_handlers(handlers: &mut HandlerTable<Self>) {
            handlers
                .starts_with(Self::on_text)
                .handles(Self::on_number)
                // Second String registration loses to the first.
                .handles(|_saga: &mut Self, _msg: &String, _ctx: &mut ExecutionContext| Ok(()))
                .handles_kind(MessageKind::interface::<Greeting>(), |saga, msg, _ctx| {
                    saga.state_mut().data.push(format!("{msg:?}"));
                    Ok(())
                });
        }

        fn core(&self) -> &SagaCore<Vec<String>> {
            &self.core
        }

        fn core_mut(&mut self) -> &mut SagaCore<Vec<String>> {
            &mut self.core
        }
    }

    #[derive(Default)]
    struct Silent {
        core: SagaCore<()>,
    }

    impl Saga for Silent {
        type Data = ();

        fn saga_type_name() -> &'static str {
            "silent"
        }

        fn describe_handlers(_handlers: &mut HandlerTable<Self>) {}

        fn core(&self) -> &SagaCore<()> {
            &self.core
        }

        fn core_mut(&mut self) -> &mut SagaCore<()> {
            &mut self.core
        }
    }

    #[test]
    fn duplicates_keep_first_registration() {
        let saga_type = SagaType::of::<Echo>();
        let kinds: Vec<_> = saga_type
            .handlers()
            .iter()
            .map(|h| (h.kind(), h.starts_saga()))
            .collect();

        assert_eq!(
            kinds,
            vec![
                (MessageKind::of::<String>(), true),
                (MessageKind::of::<i32>(), false),
                (MessageKind::interface::<Greeting>(), false),
            ]
        );
    }

    #[test]
    fn catalog_drops_sagas_without_handlers() {
        let catalog = HandlerCatalog::build([SagaType::of::<Silent>(), SagaType::of::<Echo>()]);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.by_name("echo").is_some());
        assert_eq!(catalog.sagas_handling(&MessageKind::of::<i32>()).count(), 1);
        assert!(!catalog.handles(&MessageKind::of::<u64>()));
    }

    #[test]
    fn catalog_is_deterministic() {
        let first = HandlerCatalog::build([SagaType::of::<Echo>(), SagaType::of::<Silent>()]);
        let second = HandlerCatalog::build([SagaType::of::<Echo>(), SagaType::of::<Silent>()]);
        assert_eq!(first, second);
    }

    #[test]
    fn typed_handler_rejects_other_messages() {
        let saga_type = SagaType::of::<Echo>();
        let handler = &saga_type.handlers()[0];
        let mut saga: Box<dyn AnySaga> = Box::new(Echo::default());
        let message: Arc<dyn Message> = Arc::new(5_u8);
        let mut ctx = ExecutionContext::new(Arc::clone(&message), Headers::new());

        let err = handler.invoke(&mut *saga, &*message, &mut ctx).unwrap_err();
        assert!(err.to_string().contains("cannot accept"));
    }
}
