//! Module start/error/finish coordination around one message

use std::sync::Arc;

use crate::{BoxError, ExecutionContext, SagaError, SagaModule};

fn module_error(module: &dyn SagaModule, source: BoxError) -> SagaError {
    SagaError::Module {
        module: module.name().into(),
        source,
    }
}

/// Runs the registered modules around a message's saga handlers
#[derive(Clone, Default)]
pub(crate) struct ModuleCoordinator {
    modules: Vec<Arc<dyn SagaModule>>,
}

impl ModuleCoordinator {
    pub(crate) fn new(modules: Vec<Arc<dyn SagaModule>>) -> Self {
        Self { modules }
    }

    /// Start modules in order, run `body`, then notify in reverse order.
    ///
    /// The first error stays first in the result; a single error is
    /// returned unwrapped.
    pub(crate) fn run<F>(&self, context: &mut ExecutionContext, body: F) -> Result<(), SagaError>
    where
        F: FnOnce(&mut ExecutionContext) -> Result<(), SagaError>,
    {
        let mut errors = Vec::new();
        let mut started = 0;
        let mut attempted = 0;

        for module in &self.modules {
            attempted += 1;
            if let Err(source) = module.on_start(context) {
                errors.push(module_error(module.as_ref(), source));
                break;
            }
            started += 1;
        }

        if errors.is_empty() {
            if let Err(error) = body(context) {
                errors.push(error);
            }
        }

        let mut secondary = Vec::new();
        if let Some(primary) = errors.first() {
            for module in self.modules[..started].iter().rev() {
                if let Err(source) = module.on_error(context, primary) {
                    secondary.push(module_error(module.as_ref(), source));
                }
            }
        }
        for module in self.modules[..attempted].iter().rev() {
            if let Err(source) = module.on_finished(context) {
                secondary.push(module_error(module.as_ref(), source));
            }
        }

        errors.extend(secondary);
        SagaError::from_errors(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Headers;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        log: Log,
        fail_start: bool,
        fail_finish: bool,
    }

    impl Recording {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                fail_start: false,
                fail_finish: false,
            }
        }

        fn record(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{}:{event}", self.name));
        }
    }

    impl SagaModule for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn on_start(&self, _context: &mut ExecutionContext) -> Result<(), BoxError> {
            self.record("start");
            if self.fail_start {
                return Err("start failed".into());
            }
            Ok(())
        }

        fn on_error(&self, _context: &ExecutionContext, _error: &SagaError) -> Result<(), BoxError> {
            self.record("error");
            Ok(())
        }

        fn on_finished(&self, _context: &ExecutionContext) -> Result<(), BoxError> {
            self.record("finish");
            if self.fail_finish {
                return Err("finish failed".into());
            }
            Ok(())
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new(Arc::new(1_i32), Headers::new())
    }

    #[test]
    fn success_starts_and_finishes_symmetrically() {
        let log = Log::default();
        let coordinator = ModuleCoordinator::new(vec![
            Arc::new(Recording::new("a", &log)),
            Arc::new(Recording::new("b", &log)),
        ]);

        coordinator.run(&mut context(), |_| Ok(())).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:start", "b:start", "b:finish", "a:finish"]
        );
    }

    #[test]
    fn body_error_reaches_every_module_and_stays_unwrapped() {
        let log = Log::default();
        let coordinator = ModuleCoordinator::new(vec![
            Arc::new(Recording::new("a", &log)),
            Arc::new(Recording::new("b", &log)),
        ]);

        let err = coordinator
            .run(&mut context(), |_| Err(SagaError::StreamClosed))
            .unwrap_err();

        assert!(matches!(err, SagaError::StreamClosed));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:start", "b:start", "b:error", "a:error", "b:finish", "a:finish"]
        );
    }

    #[test]
    fn failed_start_skips_body_but_finishes() {
        let log = Log::default();
        let mut failing = Recording::new("b", &log);
        failing.fail_start = true;
        let coordinator = ModuleCoordinator::new(vec![
            Arc::new(Recording::new("a", &log)),
            Arc::new(failing),
            Arc::new(Recording::new("c", &log)),
        ]);

        let mut ran = false;
        let err = coordinator
            .run(&mut context(), |_| {
                ran = true;
                Ok(())
            })
            .unwrap_err();

        assert!(!ran);
        assert!(matches!(err, SagaError::Module { ref module, .. } if &**module == "b"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:start", "b:start", "a:error", "b:finish", "a:finish"]
        );
    }

    #[test]
    fn secondary_errors_are_aggregated() {
        let log = Log::default();
        let mut failing = Recording::new("a", &log);
        failing.fail_finish = true;
        let coordinator = ModuleCoordinator::new(vec![Arc::new(failing)]);

        let err = coordinator
            .run(&mut context(), |_| Err(SagaError::StreamClosed))
            .unwrap_err();

        let SagaError::Aggregate(errors) = err else {
            panic!("expected an aggregate error");
        };
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], SagaError::StreamClosed));
        assert!(matches!(errors[1], SagaError::Module { .. }));
    }
}
