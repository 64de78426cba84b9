//! Tokio runtime used for timeouts and asynchronous submission

use tokio::runtime::{Builder, Handle, Runtime};

/// A runtime handle, optionally backed by a runtime this crate owns.
///
/// The owned runtime exists only when no tokio runtime was running at
/// build time.
pub(crate) struct Executor {
    handle: Handle,
    owned: Option<Runtime>,
}

impl Executor {
    pub(crate) fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            owned: None,
        }
    }

    /// Use the ambient runtime, or start a single-worker one
    pub(crate) fn current_or_dedicated(thread_name: &str) -> std::io::Result<Self> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(Self::from_handle(handle));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(thread_name)
            .enable_time()
            .build()?;
        tracing::debug!(thread_name, "Started dedicated runtime");

        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Some(runtime),
        })
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}
