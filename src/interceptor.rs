//! Cross-cutting modules and saga lifetime interceptors

use crate::{AnySaga, BoxError, ExecutionContext, SagaError};

/// Hooks spanning every saga invoked for one message.
///
/// `on_start` runs before any handler. When it succeeded, `on_error` sees
/// any error raised while handling the message. `on_finished` always runs
/// for a module whose start was attempted.
pub trait SagaModule: Send + Sync + 'static {
    /// Name used in error reports
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_start(&self, _context: &mut ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_error(&self, _context: &ExecutionContext, _error: &SagaError) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_finished(&self, _context: &ExecutionContext) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Lifecycle notifications for individual saga instances
pub trait SagaLifetimeInterceptor: Send + Sync + 'static {
    /// Before the starting handler of a new instance runs
    fn on_starting(&self, _saga: &dyn AnySaga, _context: &ExecutionContext) {}

    fn on_handler_executing(&self, _saga: &dyn AnySaga, _context: &ExecutionContext) {}

    fn on_handler_executed(&self, _saga: &dyn AnySaga, _context: &ExecutionContext) {}

    /// Once, after the handler that finished the saga
    fn on_finished(&self, _saga: &dyn AnySaga, _context: &ExecutionContext) {}
}

/// No-op interceptor
pub struct NoOpInterceptor;

impl SagaLifetimeInterceptor for NoOpInterceptor {}

/// Tracing-based interceptor
pub struct TracingInterceptor;

impl SagaLifetimeInterceptor for TracingInterceptor {
    fn on_starting(&self, saga: &dyn AnySaga, context: &ExecutionContext) {
        tracing::info!(
            saga_id = %saga.current_id(),
            saga_type = %saga.type_name(),
            message = %context.message().message_kind(),
            "Saga starting"
        );
    }

    fn on_handler_executing(&self, saga: &dyn AnySaga, context: &ExecutionContext) {
        tracing::info!(
            saga_id = %saga.current_id(),
            message = %context.message().message_kind(),
            "Handler executing"
        );
    }

    fn on_handler_executed(&self, saga: &dyn AnySaga, context: &ExecutionContext) {
        tracing::info!(
            saga_id = %saga.current_id(),
            message = %context.message().message_kind(),
            finished = saga.finished(),
            "Handler executed"
        );
    }

    fn on_finished(&self, saga: &dyn AnySaga, _context: &ExecutionContext) {
        tracing::info!(
            saga_id = %saga.current_id(),
            saga_type = %saga.type_name(),
            "Saga finished"
        );
    }
}
