//! Messages, message kinds and the type domain used for routing

use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::sync::Arc;

/// Identity of a message type or message interface
#[derive(Clone, Copy)]
pub struct MessageKind {
    id: TypeId,
    name: &'static str,
    parents: fn() -> Vec<MessageKind>,
}

fn no_parents() -> Vec<MessageKind> {
    Vec::new()
}

impl MessageKind {
    /// Kind of a concrete type
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            parents: no_parents,
        }
    }

    /// Kind of a message interface, remembering the interfaces it extends
    pub fn interface<T: MessageInterface>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            parents: T::extends,
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Interfaces this kind directly extends
    pub fn parents(&self) -> Vec<MessageKind> {
        (self.parents)()
    }

    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for MessageKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageKind {}

impl std::hash::Hash for MessageKind {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// A routing-only type that messages can name as a supertype.
///
/// Interfaces are usually zero-sized markers. A saga that registers a
/// handler for an interface receives every message that declares it,
/// directly or through another interface.
///
/// ```rust,ignore
/// struct PaymentEvent;
/// impl MessageInterface for PaymentEvent {
///     fn extends() -> Vec<MessageKind> {
///         vec![MessageKind::interface::<AuditedEvent>()]
///     }
/// }
/// ```
pub trait MessageInterface: 'static {
    fn extends() -> Vec<MessageKind> {
        Vec::new()
    }
}

/// Upcast helper so `dyn Message` can reach `dyn Any`
pub trait AsAny: Any {
    fn as_dyn_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_dyn_any(&self) -> &dyn Any {
        self
    }
}

/// Any value that can be handed to a message stream.
///
/// Messages are routed by their concrete type plus every supertype they
/// declare. The declared supertypes must not depend on the value: routing
/// results are cached per concrete type.
pub trait Message: AsAny + Send + Sync + std::fmt::Debug {
    /// Kind of the concrete message type
    fn message_kind(&self) -> MessageKind {
        MessageKind::of::<Self>()
    }

    /// Direct supertypes, most specific first
    fn supertypes(&self) -> Vec<MessageKind> {
        Vec::new()
    }
}

impl<'a> dyn Message + 'a {
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_dyn_any().downcast_ref::<T>()
    }

    pub fn is<T: Message>(&self) -> bool {
        self.as_dyn_any().is::<T>()
    }
}

macro_rules! plain_messages {
    ($($ty:ty),* $(,)?) => {
        $(impl Message for $ty {})*
    };
}

plain_messages!(
    String,
    &'static str,
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    usize,
    isize,
);

/// Every kind a message is routed under: the concrete type first, then the
/// declared supertypes breadth-first, each kind once.
pub fn type_domain(message: &dyn Message) -> Vec<MessageKind> {
    let mut domain = vec![message.message_kind()];
    let mut seen: HashSet<TypeId> = domain.iter().map(MessageKind::id).collect();
    let mut cursor = 0;
    let mut pending = message.supertypes();

    loop {
        for kind in pending.drain(..) {
            if seen.insert(kind.id()) {
                domain.push(kind);
            }
        }
        cursor += 1;
        match domain.get(cursor) {
            Some(kind) => pending = kind.parents(),
            None => break,
        }
    }

    domain
}

/// Sentinel dispatched when no saga type reacts to a message.
///
/// Register a handler for it to observe unrouted messages.
#[derive(Clone, Debug)]
pub struct NoSagaFound {
    message: Arc<dyn Message>,
}

impl NoSagaFound {
    pub fn new(message: Arc<dyn Message>) -> Self {
        Self { message }
    }

    /// The message nobody handled
    pub fn message(&self) -> &dyn Message {
        &*self.message
    }
}

impl Message for NoSagaFound {}
