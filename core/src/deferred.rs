use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

/// Request-scoped registry of background work that must finish before the
/// scope that spawned it ends.
///
/// Callers hand work to [`DeferredTasks::wait_until`] and return immediately;
/// whoever owns the scope calls [`DeferredTasks::settle`] before tearing it
/// down, so scheduled writes are never dropped on a fast shutdown.
#[derive(Clone, Default)]
pub struct DeferredTasks {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DeferredTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub fn pending(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Awaits every registered task, including ones registered while
    /// settling. Returns how many tasks were awaited.
    pub async fn settle(&self) -> usize {
        let mut settled = 0;
        loop {
            let batch: Vec<JoinHandle<()>> = {
                let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *handles)
            };
            if batch.is_empty() {
                return settled;
            }
            for handle in batch {
                if let Err(err) = handle.await {
                    tracing::error!(error = %err, "deferred task failed to complete");
                }
                settled += 1;
            }
        }
    }
}
