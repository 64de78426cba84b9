//! Erased saga type descriptor

use std::any::TypeId;

use crate::{HandlerDescriptor, HandlerTable, MessageKind, Saga};

/// A declared saga type together with its handler self-description
#[derive(Clone)]
pub struct SagaType {
    name: &'static str,
    type_id: TypeId,
    handlers: Vec<HandlerDescriptor>,
}

impl SagaType {
    /// Describe saga type `S` by asking it for its handlers
    pub fn of<S: Saga>() -> Self {
        let mut table = HandlerTable::<S>::new();
        S::describe_handlers(&mut table);
        Self {
            name: S::saga_type_name(),
            type_id: TypeId::of::<S>(),
            handlers: table.into_entries(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn saga_type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is<S: Saga>(&self) -> bool {
        self.type_id == TypeId::of::<S>()
    }

    /// Handlers in registration order
    pub fn handlers(&self) -> &[HandlerDescriptor] {
        &self.handlers
    }

    /// Whether any handler of this saga starts a new instance
    pub fn starts_new(&self) -> bool {
        self.handlers.iter().any(HandlerDescriptor::starts_saga)
    }

    pub fn handler_for(&self, kind: &MessageKind) -> Option<&HandlerDescriptor> {
        self.handlers.iter().find(|h| h.kind() == *kind)
    }

    /// Handler for the most specific kind of `domain` this saga registered
    pub fn handler_for_domain(&self, domain: &[MessageKind]) -> Option<&HandlerDescriptor> {
        domain.iter().find_map(|kind| self.handler_for(kind))
    }
}

impl PartialEq for SagaType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.name == other.name && self.handlers == other.handlers
    }
}

impl Eq for SagaType {}

impl std::fmt::Debug for SagaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaType")
            .field("name", &self.name)
            .field("handlers", &self.handlers)
            .finish()
    }
}
