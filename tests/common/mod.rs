#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use saga_orchestrator::{
    InMemoryStateStorage, InstanceKey, SagaId, SagaState, StateStorage, StorageError,
};

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::default()
}

pub fn record(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory storage counting every write
#[derive(Default)]
pub struct CountingStorage {
    inner: InMemoryStateStorage,
    pub saves: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl CountingStorage {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> usize {
        self.inner.len()
    }
}

impl StateStorage for CountingStorage {
    fn save(&self, state: &SagaState) -> Result<(), StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(state)
    }

    fn load(&self, saga_id: SagaId) -> Result<Option<SagaState>, StorageError> {
        self.inner.load(saga_id)
    }

    fn load_by_key(
        &self,
        saga_type: &str,
        key: &InstanceKey,
    ) -> Result<Vec<SagaState>, StorageError> {
        self.inner.load_by_key(saga_type, key)
    }

    fn delete(&self, saga_id: SagaId) -> Result<(), StorageError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(saga_id)
    }
}
