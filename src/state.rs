//! Durable saga state and correlation keys

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{SagaError, SagaId};

/// Correlation value used to find a saga instance again.
///
/// Keys are compared structurally, so `InstanceKey::from(42_i32)` and
/// `InstanceKey::from(42_i64)` are the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InstanceKey {
    Text(Box<str>),
    Int(i64),
    Uuid(Uuid),
    Bytes(Vec<u8>),
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Bytes(b) => write!(f, "{b:02x?}"),
        }
    }
}

macro_rules! int_keys {
    ($($ty:ty),*) => {
        $(impl From<$ty> for InstanceKey {
            fn from(value: $ty) -> Self {
                Self::Int(i64::from(value))
            }
        })*
    };
}

int_keys!(i8, i16, i32, i64, u8, u16, u32);

// Values beyond `i64::MAX` fall back to their decimal text
macro_rules! wide_int_keys {
    ($($ty:ty),*) => {
        $(impl From<$ty> for InstanceKey {
            fn from(value: $ty) -> Self {
                i64::try_from(value)
                    .map_or_else(|_| Self::Text(value.to_string().into()), Self::Int)
            }
        })*
    };
}

wide_int_keys!(u64, usize, isize);

impl From<String> for InstanceKey {
    fn from(value: String) -> Self {
        Self::Text(value.into_boxed_str())
    }
}

impl From<&str> for InstanceKey {
    fn from(value: &str) -> Self {
        Self::Text(value.into())
    }
}

impl From<Box<str>> for InstanceKey {
    fn from(value: Box<str>) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for InstanceKey {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<SagaId> for InstanceKey {
    fn from(value: SagaId) -> Self {
        Self::Uuid(value.0)
    }
}

impl From<Vec<u8>> for InstanceKey {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// State of one saga instance.
///
/// `D` is the saga's own payload. Storage works on the erased form
/// `SagaState<serde_json::Value>`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SagaState<D = serde_json::Value> {
    id: SagaId,
    saga_type: Box<str>,
    instance_keys: Vec<InstanceKey>,
    /// Saga-defined payload
    pub data: D,
}

impl<D: Default> Default for SagaState<D> {
    fn default() -> Self {
        Self {
            id: SagaId::nil(),
            saga_type: "".into(),
            instance_keys: Vec::new(),
            data: D::default(),
        }
    }
}

impl<D> SagaState<D> {
    pub fn new(id: SagaId, saga_type: impl Into<Box<str>>, data: D) -> Self {
        Self {
            id,
            saga_type: saga_type.into(),
            instance_keys: Vec::new(),
            data,
        }
    }

    /// Rebuild state with its keys, e.g. when reading from a store
    pub fn with_keys(mut self, keys: impl IntoIterator<Item = InstanceKey>) -> Self {
        for key in keys {
            self.add_instance_key(key);
        }
        self
    }

    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn instance_keys(&self) -> &[InstanceKey] {
        &self.instance_keys
    }

    /// Make this saga findable by `key`; duplicates are ignored
    pub fn add_instance_key(&mut self, key: impl Into<InstanceKey>) {
        let key = key.into();
        if !self.instance_keys.contains(&key) {
            self.instance_keys.push(key);
        }
    }

    pub fn remove_instance_key(&mut self, key: &InstanceKey) -> bool {
        let before = self.instance_keys.len();
        self.instance_keys.retain(|k| k != key);
        before != self.instance_keys.len()
    }

    pub fn has_instance_key(&self, key: &InstanceKey) -> bool {
        self.instance_keys.contains(key)
    }
}

impl<D: Serialize> SagaState<D> {
    /// Convert into the storage form
    pub fn to_stored(&self) -> Result<SagaState, SagaError> {
        let data = serde_json::to_value(&self.data).map_err(|source| SagaError::State {
            saga_type: self.saga_type.clone(),
            source,
        })?;
        Ok(SagaState {
            id: self.id,
            saga_type: self.saga_type.clone(),
            instance_keys: self.instance_keys.clone(),
            data,
        })
    }
}

impl SagaState {
    /// Convert the storage form back into a typed state
    pub fn into_typed<D: DeserializeOwned>(self) -> Result<SagaState<D>, SagaError> {
        let data = serde_json::from_value(self.data).map_err(|source| SagaError::State {
            saga_type: self.saga_type.clone(),
            source,
        })?;
        Ok(SagaState {
            id: self.id,
            saga_type: self.saga_type,
            instance_keys: self.instance_keys,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Order {
        amount: u32,
    }

    #[test]
    fn integer_keys_compare_structurally() {
        assert_eq!(InstanceKey::from(42_i32), InstanceKey::from(42_i64));
        assert_eq!(InstanceKey::from(42_u8), InstanceKey::Int(42));
        assert_ne!(InstanceKey::from("42"), InstanceKey::from(42));
    }

    #[test]
    fn wide_integer_keys() {
        assert_eq!(InstanceKey::from(42_u64), InstanceKey::from(42_i32));
        assert_eq!(InstanceKey::from(7_usize), InstanceKey::Int(7));
        assert_eq!(InstanceKey::from(-3_isize), InstanceKey::Int(-3));
        assert_eq!(
            InstanceKey::from(u64::MAX),
            InstanceKey::Text("18446744073709551615".into())
        );
    }

    #[test]
    fn keys_are_deduplicated() {
        let mut state = SagaState::new(SagaId::new_random(), "X", Order::default());
        state.add_instance_key(42);
        state.add_instance_key(42_i64);
        state.add_instance_key("order-1");
        assert_eq!(state.instance_keys().len(), 2);

        assert!(state.remove_instance_key(&InstanceKey::Int(42)));
        assert!(!state.has_instance_key(&InstanceKey::Int(42)));
    }

    #[test]
    fn stored_form_keeps_identity() {
        let id = SagaId::new_random();
        let mut state = SagaState::new(id, "X", Order { amount: 7 });
        state.add_instance_key(42);

        let stored = state.to_stored().unwrap();
        assert_eq!(stored.id(), id);
        assert_eq!(stored.data, serde_json::json!({ "amount": 7 }));

        let typed: SagaState<Order> = stored.into_typed().unwrap();
        assert_eq!(typed, state);
    }

    #[test]
    fn mismatched_payload_is_a_state_error() {
        let stored = SagaState::new(SagaId::new_random(), "X", serde_json::json!("nope"));
        let err = stored.into_typed::<Order>().unwrap_err();
        assert!(matches!(err, SagaError::State { .. }));
    }
}
