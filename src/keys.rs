//! Correlation key readers and extraction

use std::any::TypeId;
use std::sync::Arc;

use crate::cache::LazyCache;
use crate::{InstanceFactory, InstanceKey, Message, MessageKind, SagaError, SagaType};

type ReadFn = dyn Fn(&dyn Message) -> Option<InstanceKey> + Send + Sync;

/// Reads an instance key from one message kind
#[derive(Clone)]
pub struct KeyReader {
    kind: MessageKind,
    read: Arc<ReadFn>,
}

impl KeyReader {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn read(&self, message: &dyn Message) -> Option<InstanceKey> {
        (self.read)(message)
    }
}

impl std::fmt::Debug for KeyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyReader").field("kind", &self.kind).finish()
    }
}

/// Key readers declared by one saga type, see [`crate::Saga::key_readers`]
#[derive(Clone, Debug, Default)]
pub struct KeyReaders {
    readers: Vec<KeyReader>,
}

impl KeyReaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the key of `M` messages
    pub fn read<M, K, F>(&mut self, read: F) -> &mut Self
    where
        M: Message,
        K: Into<InstanceKey>,
        F: Fn(&M) -> Option<K> + Send + Sync + 'static,
    {
        self.push(
            MessageKind::of::<M>(),
            Arc::new(move |message: &dyn Message| -> Option<InstanceKey> {
                message.downcast_ref::<M>().and_then(&read).map(Into::into)
            }),
        )
    }

    /// Read the key of any message routed under `kind`
    pub fn read_kind<F>(&mut self, kind: MessageKind, read: F) -> &mut Self
    where
        F: Fn(&dyn Message) -> Option<InstanceKey> + Send + Sync + 'static,
    {
        self.push(kind, Arc::new(read))
    }

    fn push(&mut self, kind: MessageKind, read: Arc<ReadFn>) -> &mut Self {
        if self.readers.iter().any(|r| r.kind == kind) {
            tracing::warn!(message = %kind, "Duplicate key reader skipped");
            return self;
        }
        self.readers.push(KeyReader { kind, read });
        self
    }

    /// First reader matching `domain`, most specific kind first
    pub fn reader_for(&self, domain: &[MessageKind]) -> Option<&KeyReader> {
        domain
            .iter()
            .find_map(|kind| self.readers.iter().find(|r| r.kind == *kind))
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }
}

/// Finds the instance key a saga type reads from a message.
///
/// Readers are declared on a throwaway instance once per saga type; the
/// reader picked for a concrete message type is cached as well.
pub struct KeyExtractor {
    factory: Arc<InstanceFactory>,
    declared: LazyCache<TypeId, Arc<KeyReaders>>,
    resolved: LazyCache<(TypeId, TypeId), Option<KeyReader>>,
}

impl KeyExtractor {
    pub fn new(factory: Arc<InstanceFactory>) -> Self {
        Self {
            factory,
            declared: LazyCache::new(),
            resolved: LazyCache::new(),
        }
    }

    /// Key of `message` for `saga_type`, `None` when the saga has no reader
    /// for it or the reader yields nothing.
    ///
    /// Fails when the readers cannot be declared because the provider failed.
    pub fn key(
        &self,
        saga_type: &SagaType,
        message: &dyn Message,
        domain: &[MessageKind],
    ) -> Result<Option<InstanceKey>, SagaError> {
        let cache_key = (saga_type.saga_type_id(), message.message_kind().id());
        let reader = match self.resolved.get(&cache_key) {
            Some(reader) => reader,
            None => {
                let readers = self.readers_of(saga_type)?;
                self.resolved
                    .get_or_insert_with(cache_key, || readers.reader_for(domain).cloned())
            }
        };
        Ok(reader.and_then(|r| r.read(message)))
    }

    fn readers_of(&self, saga_type: &SagaType) -> Result<Arc<KeyReaders>, SagaError> {
        self.declared
            .get_or_try_insert_with(saga_type.saga_type_id(), || {
                let saga = self.factory.instantiate(saga_type)?;
                Ok(Arc::new(saga.declare_key_readers()))
            })
    }
}
