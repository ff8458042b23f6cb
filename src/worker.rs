//! Runs blocking model calls off the request path.
//!
//! Calls go to tokio's blocking pool behind a semaphore, so at most
//! `max_concurrent_inferences` run at once, and each caller waits no longer
//! than the configured deadline. A timed-out call keeps its permit until the
//! blocking job really returns; its result is dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{EditError, Result};

#[derive(Debug, Clone)]
pub struct InferenceRunner {
    permits: Arc<Semaphore>,
    deadline: Duration,
}

impl InferenceRunner {
    pub fn new(max_concurrent: usize, deadline: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            deadline,
        }
    }

    /// Run `job` on the blocking pool and wait for it within the deadline.
    ///
    /// The deadline covers queueing for a permit as well as the call itself.
    pub async fn run<T, F>(&self, label: &'static str, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let started = Instant::now();

        let work = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|e| EditError::Internal(e.to_string()))?;
            debug!("{}: acquired inference slot", label);
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job()
            })
            .await
            .map_err(|e| EditError::Internal(format!("{} worker panicked: {}", label, e)))?
            .map_err(EditError::Backend)
        };

        match tokio::time::timeout(self.deadline, work).await {
            Ok(result) => {
                debug!("{}: finished in {:?}", label, started.elapsed());
                result
            }
            Err(_) => {
                warn!("{}: exceeded deadline of {:?}", label, self.deadline);
                Err(EditError::Timeout(self.deadline))
            }
        }
    }
}
