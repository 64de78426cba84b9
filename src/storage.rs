//! Saga state storage trait

use std::collections::HashMap;
use std::sync::RwLock;

use crate::{InstanceKey, SagaId, SagaState, StorageError};

/// State storage trait.
///
/// The store is the only place saga state survives between messages.
/// Implementations must be safe for concurrent use; operations on the same
/// saga id from concurrent messages are only as atomic as the store makes
/// them.
pub trait StateStorage: Send + Sync + 'static {
    /// Insert or replace the state with `state.id()`
    fn save(&self, state: &SagaState) -> Result<(), StorageError>;

    fn load(&self, saga_id: SagaId) -> Result<Option<SagaState>, StorageError>;

    /// Every state of `saga_type` carrying `key`
    fn load_by_key(
        &self,
        saga_type: &str,
        key: &InstanceKey,
    ) -> Result<Vec<SagaState>, StorageError>;

    fn delete(&self, saga_id: SagaId) -> Result<(), StorageError>;
}

#[derive(Default)]
struct Tables {
    states: HashMap<SagaId, SagaState>,
    keys: HashMap<(Box<str>, InstanceKey), Vec<SagaId>>,
}

impl Tables {
    fn unindex(&mut self, state: &SagaState) {
        for key in state.instance_keys() {
            let index_key = (Box::<str>::from(state.saga_type()), key.clone());
            if let Some(ids) = self.keys.get_mut(&index_key) {
                ids.retain(|id| *id != state.id());
                if ids.is_empty() {
                    self.keys.remove(&index_key);
                }
            }
        }
    }
}

/// In-memory state storage.
///
/// States and the key index sit behind one lock, so each call is atomic on
/// its own; nothing spans several calls.
pub struct InMemoryStateStorage {
    data: RwLock<Tables>,
}

impl InMemoryStateStorage {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Tables::default()),
        }
    }

    /// Number of stored states
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.states.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStateStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStorage for InMemoryStateStorage {
    fn save(&self, state: &SagaState) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StorageError::Backend(e.to_string().into()))?;

        if let Some(previous) = data.states.remove(&state.id()) {
            data.unindex(&previous);
        }
        for key in state.instance_keys() {
            data.keys
                .entry((state.saga_type().into(), key.clone()))
                .or_default()
                .push(state.id());
        }
        data.states.insert(state.id(), state.clone());
        Ok(())
    }

    fn load(&self, saga_id: SagaId) -> Result<Option<SagaState>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|e| StorageError::Backend(e.to_string().into()))?;
        Ok(data.states.get(&saga_id).cloned())
    }

    fn load_by_key(
        &self,
        saga_type: &str,
        key: &InstanceKey,
    ) -> Result<Vec<SagaState>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|e| StorageError::Backend(e.to_string().into()))?;
        let Some(ids) = data.keys.get(&(Box::<str>::from(saga_type), key.clone())) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| data.states.get(id))
            .cloned()
            .collect())
    }

    fn delete(&self, saga_id: SagaId) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StorageError::Backend(e.to_string().into()))?;
        if let Some(previous) = data.states.remove(&saga_id) {
            data.unindex(&previous);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_with_key(saga_type: &str, key: i32) -> SagaState {
        let mut state = SagaState::new(SagaId::new_random(), saga_type, json!({ "step": 1 }));
        state.add_instance_key(key);
        state
    }

    #[test]
    fn save_and_load() {
        let storage = InMemoryStateStorage::new();
        let state = state_with_key("X", 42);

        storage.save(&state).unwrap();

        assert_eq!(storage.load(state.id()).unwrap(), Some(state.clone()));
        assert_eq!(storage.load_by_key("X", &InstanceKey::from(42)).unwrap(), vec![state]);
        assert!(storage.load_by_key("Y", &InstanceKey::from(42)).unwrap().is_empty());
    }

    #[test]
    fn resave_reindexes_keys() {
        let storage = InMemoryStateStorage::new();
        let mut state = state_with_key("X", 1);
        storage.save(&state).unwrap();

        state.remove_instance_key(&InstanceKey::from(1));
        state.add_instance_key(2);
        state.data = json!({ "step": 2 });
        storage.save(&state).unwrap();

        assert!(storage.load_by_key("X", &InstanceKey::from(1)).unwrap().is_empty());
        let found = storage.load_by_key("X", &InstanceKey::from(2)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].data, json!({ "step": 2 }));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn shared_key_returns_every_match() {
        let storage = InMemoryStateStorage::new();
        storage.save(&state_with_key("X", 7)).unwrap();
        storage.save(&state_with_key("X", 7)).unwrap();

        assert_eq!(storage.load_by_key("X", &InstanceKey::from(7)).unwrap().len(), 2);
    }

    #[test]
    fn delete_removes_state_and_index() {
        let storage = InMemoryStateStorage::new();
        let state = state_with_key("X", 42);
        storage.save(&state).unwrap();

        storage.delete(state.id()).unwrap();
        storage.delete(state.id()).unwrap();

        assert_eq!(storage.load(state.id()).unwrap(), None);
        assert!(storage.load_by_key("X", &InstanceKey::from(42)).unwrap().is_empty());
        assert!(storage.is_empty());
    }
}
