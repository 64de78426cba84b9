//! Saga type discovery

use crate::{Saga, SagaType};

/// Supplies the saga types a stream routes to; called once at build time
pub trait SagaScanner: Send + Sync + 'static {
    fn scan_for_sagas(&self) -> Vec<SagaType>;
}

/// Scanner over an explicit list of saga types
#[derive(Clone, Default)]
pub struct StaticScanner {
    describe: Vec<fn() -> SagaType>,
}

impl StaticScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<S: Saga>(mut self) -> Self {
        self.add::<S>();
        self
    }

    pub fn add<S: Saga>(&mut self) -> &mut Self {
        self.describe.push(SagaType::of::<S>);
        self
    }

    pub fn len(&self) -> usize {
        self.describe.len()
    }

    pub fn is_empty(&self) -> bool {
        self.describe.is_empty()
    }
}

impl SagaScanner for StaticScanner {
    fn scan_for_sagas(&self) -> Vec<SagaType> {
        self.describe.iter().map(|describe| describe()).collect()
    }
}

impl<F> SagaScanner for F
where
    F: Fn() -> Vec<SagaType> + Send + Sync + 'static,
{
    fn scan_for_sagas(&self) -> Vec<SagaType> {
        self()
    }
}
