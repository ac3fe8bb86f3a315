//! Dispatches claimed jobs to handlers registered by job type.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::QueueError;
use crate::models::Job;
use crate::queue::JobQueue;

const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub type JobHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct PollingLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct JobProcessor {
    queue: JobQueue,
    handlers: Arc<HashMap<String, JobHandler>>,
    stale_timeout: Duration,
    polling: Mutex<Option<PollingLoop>>,
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut job_types = self.handlers.keys().collect::<Vec<_>>();
        job_types.sort();

        f.debug_struct("JobProcessor")
            .field("queue", &self.queue)
            .field("job_types", &job_types)
            .field("stale_timeout", &self.stale_timeout)
            .field("running", &self.is_running())
            .finish()
    }
}

impl JobProcessor {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            handlers: Arc::new(HashMap::new()),
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            polling: Mutex::new(None),
        }
    }

    /// Registers `handler` for jobs of `job_type`, replacing any previous one.
    ///
    /// Handlers must be registered before [`JobProcessor::start`].
    pub fn register<F, Fut>(mut self, job_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job| handler(job).boxed());
        Arc::make_mut(&mut self.handlers).insert(job_type.into(), handler);
        self
    }

    pub fn with_stale_timeout(mut self, stale_timeout: Duration) -> Self {
        self.stale_timeout = stale_timeout;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// The registered job types, usable as the queue's enqueue allow-list.
    pub fn known_types(&self) -> Vec<String> {
        let mut job_types = self.handlers.keys().cloned().collect::<Vec<_>>();
        job_types.sort();
        job_types
    }

    /// Recovers stale claims, then processes at most one job.
    pub async fn tick(&self) -> Result<bool, QueueError> {
        tick(&self.queue, &self.handlers, self.stale_timeout).await
    }

    /// Starts polling every `poll_interval`. Does nothing if already polling.
    pub fn start(&self, poll_interval: Duration) {
        let mut polling = self.lock_polling();

        if polling.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            log::debug!("Job processor is already running.");
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let queue = self.queue.clone();
        let handlers = self.handlers.clone();
        let stale_timeout = self.stale_timeout;

        let handle = tokio::spawn(async move {
            log::info!("Job processor started, polling every {:?}.", poll_interval);

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let processed = match tick(&queue, &handlers, stale_timeout).await {
                    Ok(processed) => processed,
                    Err(e) => {
                        log::error!("Job processor tick failed. {}", e);
                        false
                    }
                };

                // Drain the queue before going back to sleep.
                if processed {
                    continue;
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }

            log::info!("Job processor stopped.");
        });

        *polling = Some(PollingLoop { shutdown, handle });
    }

    /// Signals the polling loop to stop after its current job.
    pub fn stop(&self) {
        if let Some(polling) = self.lock_polling().take() {
            let _ = polling.shutdown.send(true);
        }
    }

    /// Stops polling and waits for the in-flight job to finish.
    pub async fn shutdown(&self) {
        let polling = self.lock_polling().take();

        if let Some(polling) = polling {
            let _ = polling.shutdown.send(true);

            if let Err(e) = polling.handle.await {
                log::error!("Job processor task ended abnormally. {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_polling()
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    fn lock_polling(&self) -> std::sync::MutexGuard<'_, Option<PollingLoop>> {
        self.polling
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for JobProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn tick(
    queue: &JobQueue,
    handlers: &HashMap<String, JobHandler>,
    stale_timeout: Duration,
) -> Result<bool, QueueError> {
    queue.recover_stale(stale_timeout)?;

    queue
        .process_next(|job| {
            let handler = handlers.get(&job.job_type).cloned();

            async move {
                match handler {
                    Some(handler) => handler(job).await,
                    None => Err(anyhow::anyhow!("Unknown job type: {}", job.job_type)),
                }
            }
        })
        .await
}
