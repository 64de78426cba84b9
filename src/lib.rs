//! In-process saga orchestration
//!
//! Routes incoming messages to long-lived, stateful workflows ("sagas").
//! For every message the stream finds the saga types that react to it,
//! starts new instances or loads existing ones by instance key, runs the
//! matching handler and stores or deletes the resulting state. Timeouts
//! requested by sagas come back through the same pipeline as messages.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Embed a SagaCore with your payload
//! #[derive(Default)]
//! struct OrderSaga { core: SagaCore<Order> }
//!
//! // 2. Describe handlers and key readers
//! impl Saga for OrderSaga {
//!     type Data = Order;
//!     fn saga_type_name() -> &'static str { "order" }
//!     fn describe_handlers(handlers: &mut HandlerTable<Self>) {
//!         handlers.starts_with(Self::on_placed).handles(Self::on_paid);
//!     }
//!     fn key_readers(&self, readers: &mut KeyReaders) {
//!         readers.read(|m: &OrderPaid| Some(m.order_id));
//!     }
//!     /* core / core_mut */
//! }
//!
//! // 3. Build a stream and hand it messages
//! let stream = MessageStream::builder().with_saga(OrderSaga::default).build()?;
//! stream.handle(OrderPlaced { order_id: 7 })?;
//! ```

// === Core Types ===
mod context;
mod errors;
mod message;
mod state;

// === Traits ===
mod traits;

// === Handlers & Routing ===
mod cache;
mod handlers;
mod keys;
mod organizer;
mod saga_type;
mod scanner;

// === Execution ===
mod coordinator;
mod executor;
mod factory;
mod stream;
mod task;

// === Storage ===
#[cfg(feature = "lmdb")]
mod lmdb;
mod storage;

// === Timeouts ===
mod timeout;

// === Observability ===
mod interceptor;
mod stats;

// === Re-exports ===

// Types
pub use context::{now_millis, CurrentSaga, ExecutionContext, Headers, ParentContext, SagaId};
pub use message::{type_domain, AsAny, Message, MessageInterface, MessageKind, NoSagaFound};
pub use state::{InstanceKey, SagaState};

// Errors
pub use errors::{BoxError, ConfigError, HandlerResult, SagaError, StorageError, TimeoutError};

// Traits
pub use traits::{AnySaga, Saga, SagaCore};

// Handlers & Routing
pub use handlers::{HandlerCatalog, HandlerDescriptor, HandlerTable, HandlerTarget, InvokeFn};
pub use keys::{KeyExtractor, KeyReader, KeyReaders};
pub use organizer::{ExecutionOrder, Organizer, Route};
pub use saga_type::SagaType;
pub use scanner::{SagaScanner, StaticScanner};

// Execution
pub use factory::{InstanceFactory, ProviderFactory, ProviderRegistry, SagaInstance, SagaProvider};
pub use stream::{MessageStream, MessageStreamBuilder};

// Storage
#[cfg(feature = "lmdb")]
pub use lmdb::LmdbStateStorage;
pub use storage::{InMemoryStateStorage, StateStorage};

// Timeouts
pub use timeout::{ExpiredCallback, Timeout, TimeoutId, TimeoutManager, TokioTimeoutManager};

// Observability
pub use interceptor::{NoOpInterceptor, SagaLifetimeInterceptor, SagaModule, TracingInterceptor};
pub use stats::{StreamStats, StreamStatsSnapshot, TimeoutStats, TimeoutStatsSnapshot};
