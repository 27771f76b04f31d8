use std::sync::Arc;

use thiserror::Error;

use crate::core::ArcStr;
use crate::engine::Report;

/// Misuse of a port, or a failure observed while resolving its value.
///
/// Port errors travel through shared futures, so they are cheap to clone.
#[derive(Debug, Error, Clone)]
pub enum PortError {
    #[error("Port '{task}.{port}' is already finalized")]
    AlreadyFinalized { task: ArcStr, port: ArcStr },

    #[error("Port '{task}.{port}' was read before a value was assigned")]
    Unassigned { task: ArcStr, port: ArcStr },

    #[error("Port '{task}.{port}' has not been computed by its task")]
    NotComputed { task: ArcStr, port: ArcStr },

    #[error("Port '{task}.{port}' is static and cannot be written by the task body")]
    Static { task: ArcStr, port: ArcStr },

    #[error("Port '{task}.{port}' is computed and can only be written by the task body")]
    Computed { task: ArcStr, port: ArcStr },

    #[error("Port '{task}.{port}' belongs to a task that is still being configured")]
    Detached { task: ArcStr, port: ArcStr },

    #[error(transparent)]
    Upstream(#[from] TaskFailure),
}

/// The failure of a single task, shared by every dependent that observes it.
#[derive(Debug, Error, Clone)]
#[error("Task '{task}':\n{cause}")]
pub struct TaskFailure {
    task: ArcStr,
    cause: Arc<anyhow::Error>,
}

impl TaskFailure {
    pub fn new(task: impl Into<ArcStr>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            task: task.into(),
            cause: Arc::new(cause.into()),
        }
    }

    /// Name of the task in which the failure originated.
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Couldn't read digest file '{0}'.\n{1}")]
    Read(camino::Utf8PathBuf, std::io::Error),

    #[error("Couldn't write digest file '{0}'.\n{1}")]
    Write(camino::Utf8PathBuf, std::io::Error),

    #[error("Couldn't hash file '{0}'.\n{1}")]
    Hash(camino::Utf8PathBuf, std::io::Error),

    #[error("Cache location '{0}' has no file name")]
    Location(camino::Utf8PathBuf),

    #[error(transparent)]
    Port(#[from] PortError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to build executor '{0}'.\n{1}")]
    Executor(String, rayon::ThreadPoolBuildError),

    #[error("Failed to start the driver of executor '{0}'.\n{1}")]
    Driver(String, std::io::Error),

    #[error("Unknown serial executor '{0}'")]
    UnknownExecutor(String),

    #[error("Task '{0}' is already frozen")]
    Frozen(String),

    #[error("Cycle detected in task graph at task '{0}'")]
    Cycle(String),

    #[error("Configuration of task '{0}' failed.\n{1}")]
    Configure(String, anyhow::Error),

    #[error("{0}")]
    Failed(TaskFailure, Box<Report>),
}

#[cfg(feature = "logging")]
#[derive(Debug, Error)]
#[error("Couldn't install the logging subscriber.\n{0}")]
pub struct LoggingError(#[from] pub(crate) tracing_subscriber::util::TryInitError);
