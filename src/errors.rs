//! Error types for routing, saga execution, storage and timeouts

use crate::SagaId;

/// Boxed error returned by saga handlers, providers and modules
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of a saga handler invocation
pub type HandlerResult = Result<(), BoxError>;

/// Error returned from handling a message
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    /// A saga handler returned an error
    #[error("handler of saga {saga_type} ({saga_id}) failed: {source}")]
    Handler {
        saga_type: Box<str>,
        saga_id: SagaId,
        #[source]
        source: BoxError,
    },

    /// The host provider failed to produce a saga instance
    #[error("provider for saga type {saga_type} failed: {source}")]
    Provider {
        saga_type: Box<str>,
        #[source]
        source: BoxError,
    },

    /// The provider factory has nothing for this saga type
    #[error("no provider available for saga type {0}")]
    ProviderMissing(Box<str>),

    /// The provider produced an instance of another saga type
    #[error("provider for saga type {expected} returned an instance of {actual}")]
    ProviderMismatch { expected: Box<str>, actual: Box<str> },

    /// Stored state names a saga type the catalog does not know
    #[error("unknown saga type {0}")]
    UnknownSagaType(Box<str>),

    /// Saga data could not be converted to or from its stored form
    #[error("state of saga type {saga_type} could not be converted: {source}")]
    State {
        saga_type: Box<str>,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// A module's start, error or finish hook failed
    #[error("module {module} failed: {source}")]
    Module {
        module: Box<str>,
        #[source]
        source: BoxError,
    },

    /// A handler was invoked with a message it was not registered for
    #[error("handler for {expected} cannot accept message of type {actual}")]
    MessageMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// The message stream behind a context is gone
    #[error("message stream has been closed")]
    StreamClosed,

    /// More than one error occurred while handling a single message
    #[error("{} errors occurred while handling message: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<SagaError>),
}

impl SagaError {
    /// Fold collected errors into one result.
    ///
    /// A single error is returned as-is; only two or more are wrapped into
    /// [`SagaError::Aggregate`].
    pub fn from_errors(mut errors: Vec<SagaError>) -> Result<(), SagaError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SagaError::Aggregate(errors)),
        }
    }

    /// Downcast the error a saga handler returned
    pub fn handler_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Handler { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// All errors contained in this one, flattened
    pub fn errors(&self) -> Vec<&SagaError> {
        match self {
            Self::Aggregate(inner) => inner.iter().flat_map(|e| e.errors()).collect(),
            other => vec![other],
        }
    }
}

fn join_errors(errors: &[SagaError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// State storage error
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Backend(Box<str>),
    #[error("serialization error: {0}")]
    Serialization(Box<str>),
}

/// Timeout scheduling error
#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    /// The saga did not ask for a timeout manager
    #[error("no timeout manager injected into saga")]
    Unavailable,
    #[error("timeout could not be scheduled: {0}")]
    Scheduling(Box<str>),
}

/// Error building a message stream
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no saga provider factory configured")]
    MissingProviderFactory,
    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    fn handler_failure() -> SagaError {
        SagaError::Handler {
            saga_type: "X".into(),
            saga_id: SagaId::new_random(),
            source: Box::new(Boom),
        }
    }

    #[test]
    fn single_error_is_not_wrapped() {
        let err = SagaError::from_errors(vec![handler_failure()]).unwrap_err();
        assert!(err.handler_error::<Boom>().is_some());
    }

    #[test]
    fn several_errors_are_aggregated() {
        let err = SagaError::from_errors(vec![handler_failure(), SagaError::StreamClosed])
            .unwrap_err();
        match &err {
            SagaError::Aggregate(inner) => assert_eq!(inner.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
        assert_eq!(err.errors().len(), 2);
        assert!(err.to_string().starts_with("2 errors"));
    }

    #[test]
    fn no_errors_is_ok() {
        assert!(SagaError::from_errors(Vec::new()).is_ok());
    }
}
