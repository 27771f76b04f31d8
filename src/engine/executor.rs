use std::future::Future;
use std::sync::Arc;

use futures::channel::oneshot;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::core::ArcStr;
use crate::error::EngineError;

/// A concurrency domain onto which task bodies are spawned.
///
/// Executors are cheap handles around a rayon thread pool. Tasks sharing a
/// single-worker executor never run their bodies concurrently, which is how
/// callers serialize, for example, every task that mutates one repository
/// checkout. The engine itself enforces no mutual exclusion.
///
/// Each executor also owns a single driver thread that polls the completion
/// futures of its tasks. Bodies never run on the driver, it only waits on
/// upstream barriers and hands bodies over to the pool.
#[derive(Clone)]
pub struct Executor {
    name: ArcStr,
    pool: Arc<ThreadPool>,
    driver: futures::executor::ThreadPool,
}

impl Executor {
    /// Creates an executor backed by a pool of `threads` workers. Zero lets
    /// rayon pick the worker count.
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self, EngineError> {
        let name: String = name.into();
        let prefix = name.clone();

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|err| EngineError::Executor(name.clone(), err))?;

        let driver = futures::executor::ThreadPool::builder()
            .pool_size(1)
            .name_prefix(format!("{name}-driver-"))
            .create()
            .map_err(|err| EngineError::Driver(name.clone(), err))?;

        Ok(Self {
            name: name.into(),
            pool: Arc::new(pool),
            driver,
        })
    }

    /// Creates a single-worker executor.
    pub fn serial(name: impl Into<String>) -> Result<Self, EngineError> {
        Self::new(name, 1)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `job` on this executor. The receiver resolves with the job's
    /// result, or is canceled if the job never reports back.
    pub(crate) fn spawn<F, R>(&self, job: F) -> oneshot::Receiver<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        self.pool.spawn(move || {
            // The receiver is gone when every dependent gave up on this task.
            let _ = sender.send(job());
        });

        receiver
    }

    /// Polls `future` to completion on the driver thread, whether or not
    /// anybody observes it.
    pub(crate) fn drive<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.driver.spawn_ok(future);
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name)
            .field("threads", &self.threads())
            .finish()
    }
}
