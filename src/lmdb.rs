//! LMDB-backed state storage

use std::path::Path;

use heed::types::{Bytes, Str, Unit};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{InstanceKey, SagaId, SagaState, StateStorage, StorageError};

const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024;
const DIGEST_LEN: usize = 32;

fn backend(e: heed::Error) -> StorageError {
    StorageError::Backend(e.to_string().into())
}

fn serialization(e: serde_json::Error) -> StorageError {
    StorageError::Serialization(e.to_string().into())
}

/// State storage persisted in an LMDB environment.
///
/// States live in one database keyed by saga id. A second database holds
/// one entry per (saga type, instance key, saga id), made of a SHA-256 digest
/// of the saga type and key followed by the saga id bytes. It is updated in
/// the same write transaction as the state it indexes.
pub struct LmdbStateStorage {
    env: Env,
    states: Database<Str, Bytes>,
    keys: Database<Bytes, Unit>,
}

impl LmdbStateStorage {
    /// Open or create the environment in directory `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_map_size(path, DEFAULT_MAP_SIZE)
    }

    pub fn open_with_map_size(
        path: impl AsRef<Path>,
        map_size: usize,
    ) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path.as_ref())
            .map_err(|e| StorageError::Backend(e.to_string().into()))?;

        // SAFETY: the environment is opened once per path by this process
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(path.as_ref())
                .map_err(backend)?
        };

        let mut wtxn = env.write_txn().map_err(backend)?;
        let states = env
            .create_database(&mut wtxn, Some("saga_states"))
            .map_err(backend)?;
        let keys = env
            .create_database(&mut wtxn, Some("saga_keys"))
            .map_err(backend)?;
        wtxn.commit().map_err(backend)?;

        Ok(Self { env, states, keys })
    }

    fn unindex(&self, wtxn: &mut RwTxn<'_>, saga_id: SagaId) -> Result<(), StorageError> {
        let Some(bytes) = self.states.get(wtxn, &saga_id.to_string()).map_err(backend)? else {
            return Ok(());
        };
        let previous: SagaState = serde_json::from_slice(bytes).map_err(serialization)?;
        for key in previous.instance_keys() {
            let entry = index_entry(previous.saga_type(), key, saga_id)?;
            self.keys.delete(wtxn, &entry).map_err(backend)?;
        }
        Ok(())
    }
}

/// Fixed-width digest of (saga type, instance key); LMDB keys are capped at
/// 511 bytes while instance keys are not.
fn key_digest(saga_type: &str, key: &InstanceKey) -> Result<[u8; DIGEST_LEN], StorageError> {
    let key = serde_json::to_vec(key).map_err(serialization)?;
    let mut hasher = Sha256::new();
    hasher.update(saga_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(&key);

    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(hasher.finalize().as_slice());
    Ok(digest)
}

fn index_entry(saga_type: &str, key: &InstanceKey, saga_id: SagaId) -> Result<Vec<u8>, StorageError> {
    let mut entry = Vec::with_capacity(DIGEST_LEN + 16);
    entry.extend_from_slice(&key_digest(saga_type, key)?);
    entry.extend_from_slice(saga_id.get().as_bytes());
    Ok(entry)
}

impl StateStorage for LmdbStateStorage {
    fn save(&self, state: &SagaState) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(state).map_err(serialization)?;

        let mut wtxn = self.env.write_txn().map_err(backend)?;
        self.unindex(&mut wtxn, state.id())?;
        for key in state.instance_keys() {
            let entry = index_entry(state.saga_type(), key, state.id())?;
            self.keys.put(&mut wtxn, &entry, &()).map_err(backend)?;
        }
        self.states
            .put(&mut wtxn, &state.id().to_string(), &bytes)
            .map_err(backend)?;
        wtxn.commit().map_err(backend)
    }

    fn load(&self, saga_id: SagaId) -> Result<Option<SagaState>, StorageError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        self.states
            .get(&rtxn, &saga_id.to_string())
            .map_err(backend)?
            .map(|bytes| serde_json::from_slice(bytes).map_err(serialization))
            .transpose()
    }

    fn load_by_key(
        &self,
        saga_type: &str,
        key: &InstanceKey,
    ) -> Result<Vec<SagaState>, StorageError> {
        let prefix = key_digest(saga_type, key)?;
        let rtxn = self.env.read_txn().map_err(backend)?;

        let mut found = Vec::new();
        for entry in self.keys.prefix_iter(&rtxn, &prefix).map_err(backend)? {
            let (entry, ()) = entry.map_err(backend)?;
            let saga_id = Uuid::from_slice(&entry[DIGEST_LEN..])
                .map_err(|e| StorageError::Serialization(e.to_string().into()))?;
            let Some(bytes) = self.states.get(&rtxn, &saga_id.to_string()).map_err(backend)? else {
                continue;
            };
            let state: SagaState = serde_json::from_slice(bytes).map_err(serialization)?;
            // digest collision guard
            if state.saga_type() == saga_type && state.has_instance_key(key) {
                found.push(state);
            }
        }
        Ok(found)
    }

    fn delete(&self, saga_id: SagaId) -> Result<(), StorageError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        self.unindex(&mut wtxn, saga_id)?;
        self.states
            .delete(&mut wtxn, &saga_id.to_string())
            .map_err(backend)?;
        wtxn.commit().map_err(backend)
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
    fn roundtrip_through_lmdb() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LmdbStateStorage::open(dir.path()).unwrap();
        let state = state_with_key("X", 42);

        storage.save(&state).unwrap();

        assert_eq!(storage.load(state.id()).unwrap(), Some(state.clone()));
        assert_eq!(storage.load_by_key("X", &InstanceKey::from(42)).unwrap(), vec![state.clone()]);
        assert!(storage.load_by_key("X", &InstanceKey::from(4)).unwrap().is_empty());

        storage.delete(state.id()).unwrap();
        assert_eq!(storage.load(state.id()).unwrap(), None);
        assert!(storage.load_by_key("X", &InstanceKey::from(42)).unwrap().is_empty());
    }

    #[test]
    fn resave_moves_index() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LmdbStateStorage::open(dir.path()).unwrap();
        let mut state = state_with_key("X", 1);
        storage.save(&state).unwrap();

        state.remove_instance_key(&InstanceKey::from(1));
        state.add_instance_key("order-1");
        storage.save(&state).unwrap();

        assert!(storage.load_by_key("X", &InstanceKey::from(1)).unwrap().is_empty());
        assert_eq!(storage.load_by_key("X", &InstanceKey::from("order-1")).unwrap().len(), 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_key("X", 9);
        {
            let storage = LmdbStateStorage::open(dir.path()).unwrap();
            storage.save(&state).unwrap();
        }

        let storage = LmdbStateStorage::open(dir.path()).unwrap();
        assert_eq!(storage.load(state.id()).unwrap(), Some(state));
    }

    #[test]
    fn long_keys_fit_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LmdbStateStorage::open(dir.path()).unwrap();
        let long_text = InstanceKey::from("k".repeat(480));
        let long_bytes = InstanceKey::from(vec![7_u8; 600]);
        let saga_type = "t".repeat(400);

        let mut state = SagaState::new(SagaId::new_random(), saga_type.as_str(), json!(null));
        state.add_instance_key(long_text.clone());
        state.add_instance_key(long_bytes.clone());
        storage.save(&state).unwrap();

        assert_eq!(storage.load_by_key(&saga_type, &long_text).unwrap(), vec![state.clone()]);
        assert_eq!(storage.load_by_key(&saga_type, &long_bytes).unwrap().len(), 1);
        assert!(storage.load_by_key("other", &long_text).unwrap().is_empty());

        storage.delete(state.id()).unwrap();
        assert!(storage.load_by_key(&saga_type, &long_text).unwrap().is_empty());
    }
}
