//! Execution of one message against its resolved sagas

use std::sync::Arc;

use crate::stats::StreamStats;
use crate::stream::Pipeline;
use crate::{
    CurrentSaga, ExecutionContext, Message, NoSagaFound, Route, SagaError, SagaInstance,
};

/// The unit of work for one handled message
pub(crate) struct ExecutionTask<'a> {
    pipeline: &'a Pipeline,
}

impl<'a> ExecutionTask<'a> {
    pub(crate) fn new(pipeline: &'a Pipeline) -> Self {
        Self { pipeline }
    }

    /// Run modules around the saga dispatch of the context's message
    pub(crate) fn run(&self, context: &mut ExecutionContext) -> Result<(), SagaError> {
        self.pipeline
            .modules
            .run(context, |context| self.dispatch(context))
    }

    fn dispatch(&self, context: &mut ExecutionContext) -> Result<(), SagaError> {
        let message = Arc::clone(context.message_arc());
        let routes = self.pipeline.organizer.resolve(&*message, &*self.pipeline.storage)?;
        if !routes.is_empty() {
            return self.execute(context, &message, routes);
        }

        StreamStats::bump(&self.pipeline.stats.messages_unhandled);
        let sentinel: Arc<dyn Message> = Arc::new(NoSagaFound::new(Arc::clone(&message)));
        let routes = self.pipeline.organizer.resolve(&*sentinel, &*self.pipeline.storage)?;
        if routes.is_empty() {
            tracing::warn!(message = %message.message_kind(), "No saga found for message");
            return Ok(());
        }

        tracing::debug!(message = %message.message_kind(), "No saga found, dispatching sentinel");
        self.execute(context, &sentinel, routes)
    }

    fn execute(
        &self,
        context: &mut ExecutionContext,
        message: &Arc<dyn Message>,
        routes: Vec<Route>,
    ) -> Result<(), SagaError> {
        for route in routes {
            for instance in self.materialize(&route)? {
                self.invoke(instance, message, context)?;
                if context.dispatching_stopped() {
                    tracing::debug!(
                        message = %message.message_kind(),
                        "Dispatching stopped, remaining sagas skipped"
                    );
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn materialize(&self, route: &Route) -> Result<Vec<SagaInstance>, SagaError> {
        let factory = &self.pipeline.factory;
        let storage = &self.pipeline.storage;

        match route {
            Route::StartNew { saga_type } => Ok(factory.create_new(saga_type).into_iter().collect()),
            Route::ContinueWithKey { saga_type, key } => {
                let states = storage.load_by_key(saga_type.name(), key)?;
                if states.is_empty() {
                    tracing::debug!(
                        saga_type = %saga_type.name(),
                        key = %key,
                        "No stored saga for instance key"
                    );
                }
                states
                    .into_iter()
                    .map(|state| factory.continue_existing(saga_type, state))
                    .collect()
            }
            Route::ContinueWithId { saga_type, saga_id } => match storage.load(*saga_id)? {
                Some(state) => Ok(vec![factory.continue_existing(saga_type, state)?]),
                None => {
                    tracing::debug!(saga_id = %saga_id, "No stored saga for id");
                    Ok(Vec::new())
                }
            },
        }
    }

    fn invoke(
        &self,
        mut instance: SagaInstance,
        message: &Arc<dyn Message>,
        context: &mut ExecutionContext,
    ) -> Result<(), SagaError> {
        let saga_type = Arc::clone(instance.saga_type());
        let Some(handler) = self.pipeline.organizer.handler(&saga_type, &**message) else {
            tracing::debug!(
                saga_type = %saga_type.name(),
                message = %message.message_kind(),
                "Saga has no handler for message"
            );
            return Ok(());
        };

        let saga_id = instance.saga_id();
        context.bind(
            CurrentSaga {
                saga_id,
                saga_type: saga_type.name(),
            },
            Arc::clone(message),
        );

        let interceptors = &self.pipeline.interceptors;
        if instance.created_new() {
            for interceptor in interceptors {
                interceptor.on_starting(instance.saga(), context);
            }
        }
        for interceptor in interceptors {
            interceptor.on_handler_executing(instance.saga(), context);
        }

        if let Err(source) = handler.invoke(instance.saga_mut(), &**message, context) {
            StreamStats::bump(&self.pipeline.stats.handler_failures);
            return Err(SagaError::Handler {
                saga_type: saga_type.name().into(),
                saga_id,
                source,
            });
        }

        for interceptor in interceptors {
            interceptor.on_handler_executed(instance.saga(), context);
        }
        self.persist(&instance, context)
    }

    fn persist(&self, instance: &SagaInstance, context: &ExecutionContext) -> Result<(), SagaError> {
        let pipeline = self.pipeline;
        let saga = instance.saga();
        let saga_id = instance.saga_id();

        if instance.created_new() {
            StreamStats::bump(&pipeline.stats.sagas_started);
        } else {
            StreamStats::bump(&pipeline.stats.sagas_continued);
        }

        if !saga.finished() {
            pipeline.storage.save(&saga.snapshot_state()?)?;
            tracing::debug!(
                saga_id = %saga_id,
                saga_type = %saga.type_name(),
                started = instance.created_new(),
                "Saga state saved"
            );
            return Ok(());
        }

        for interceptor in &pipeline.interceptors {
            interceptor.on_finished(saga, context);
        }
        StreamStats::bump(&pipeline.stats.sagas_finished);

        // Started and finished within one message: never stored
        if !instance.created_new() {
            pipeline.storage.delete(saga_id)?;
        }
        pipeline.timeouts.cancel_timeouts(saga_id);
        tracing::debug!(saga_id = %saga_id, saga_type = %saga.type_name(), "Saga finished");
        Ok(())
    }
}
