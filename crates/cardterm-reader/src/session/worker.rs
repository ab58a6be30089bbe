//! Dedicated single-threaded executor for session work.
//!
//! Tap callbacks arrive on whatever thread the antenna driver uses. They
//! only enqueue a job here; the job itself runs on a named OS thread that
//! drives a current-thread tokio runtime. Queued jobs run one after the
//! other. A panicking job is logged and the worker carries on.

use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::thread;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct SessionWorker {
    name: String,
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    handle: Handle,
}

impl SessionWorker {
    /// Start the worker thread.
    ///
    /// # Errors
    /// Fails if the runtime or the thread cannot be created.
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Job>();

        let thread_name = name.clone();
        thread::Builder::new().name(name.clone()).spawn(move || {
            info!(worker = %thread_name, "Session worker started");
            runtime.block_on(async {
                while let Some(job) = jobs_rx.recv().await {
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!(worker = %thread_name, "Session job panicked");
                    }
                }
            });
            info!(worker = %thread_name, "Session worker stopped");
        })?;

        Ok(Self {
            name,
            jobs: Mutex::new(Some(jobs_tx)),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job behind the ones already submitted.
    ///
    /// Returns `false` once the worker is shut down.
    pub fn submit(&self, job: impl Future<Output = ()> + Send + 'static) -> bool {
        match self.jobs.lock().as_ref() {
            Some(jobs) => jobs.send(Box::pin(job)).is_ok(),
            None => false,
        }
    }

    /// Run a task concurrently with the job queue, e.g. a timer.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(task)
    }

    /// Stop accepting jobs. The thread exits after the queue drains and
    /// drops any task still spawned on it.
    pub fn shutdown(&self) {
        if self.jobs.lock().take().is_some() {
            info!(worker = %self.name, "Session worker shutting down");
        }
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SessionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWorker")
            .field("name", &self.name)
            .field("running", &self.jobs.lock().is_some())
            .finish()
    }
}
