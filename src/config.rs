use std::collections::HashMap;
use std::time::Instant;

use serde::Deserialize;

use crate::engine::{Executor, Report, Task};
use crate::error::EngineError;

/// Settings for the executors owned by an [`Engine`].
///
/// Deserializable, so a pipeline can keep it next to the rest of its
/// configuration. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads of the shared pool, `0` lets rayon decide.
    pub threads: usize,
    /// Prefix for the shared pool's thread names.
    pub thread_prefix: String,
    /// Names of single-worker executors, one per family of tasks that must
    /// not run concurrently.
    pub serial: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            thread_prefix: "taskport".to_string(),
            serial: Vec::new(),
        }
    }
}

/// Owns the executors of a process and runs task graphs to completion.
///
/// There is no global pool. Whatever creates the engine decides its thread
/// counts and its lifetime, and hands its executors to task factories.
///
/// # Example
///
/// ```rust,no_run
/// use taskport::{Engine, EngineConfig, Task};
///
/// let engine = Engine::new(&EngineConfig {
///     serial: vec!["git".into()],
///     ..Default::default()
/// })?;
///
/// let (commit, ()) = Task::create("commit", engine.serial("git")?, |t| {
///     t.execute(|_| Ok(()));
///     Ok(())
/// })?;
///
/// let report = engine.run(&[commit])?;
/// println!("{report}");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Engine {
    executor: Executor,
    serial: HashMap<String, Executor>,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let executor = Executor::new(&config.thread_prefix, config.threads)?;

        let serial = config
            .serial
            .iter()
            .map(|name| Ok((name.clone(), Executor::serial(name)?)))
            .collect::<Result<HashMap<_, _>, EngineError>>()?;

        tracing::debug!(
            threads = executor.threads(),
            serial = ?config.serial,
            "engine ready"
        );

        Ok(Self { executor, serial })
    }

    /// The shared general-purpose executor.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// A named single-worker executor declared in the configuration.
    pub fn serial(&self, name: &str) -> Result<&Executor, EngineError> {
        self.serial
            .get(name)
            .ok_or_else(|| EngineError::UnknownExecutor(name.to_string()))
    }

    /// Runs every task reachable from `roots` until all of them settled.
    pub fn run(&self, roots: &[Task]) -> Result<Report, EngineError> {
        let s = Instant::now();
        let result = crate::engine::runner::run(roots);

        match &result {
            Ok(report) => tracing::info!(
                "Finished {} tasks {}",
                report.tasks.len(),
                crate::utils::as_overhead(s)
            ),
            Err(err) => tracing::error!("Pipeline failed {}\n{err}", crate::utils::as_overhead(s)),
        }

        result
    }
}
