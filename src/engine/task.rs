use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use camino::Utf8PathBuf;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, Shared, try_join_all};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{ArcStr, TaskId, lock};
use crate::engine::cache::{Cache, Digest};
use crate::engine::executor::Executor;
use crate::engine::graph;
use crate::engine::input::{InputKind, InputPort};
use crate::engine::output::{OutputKind, OutputPort};
use crate::engine::port::{Slot, Value, Wired};
use crate::engine::runner::{Status, TaskExecution};
use crate::error::{EngineError, PortError, TaskFailure};

/// How a completed task reached completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The body ran.
    Executed,
    /// The cache digest matched and the body was skipped.
    UpToDate,
}

/// The memoized completion handle of a task.
pub type Completion = Shared<BoxFuture<'static, Result<Outcome, TaskFailure>>>;

type Body = Box<dyn FnOnce(&TaskContext<'_>) -> anyhow::Result<()> + Send>;

/// Identity and lifecycle flags shared by a task and every port it declares.
///
/// Holds no reference to the task itself, ports point back at their task
/// through [`OutputPort`] only.
pub(crate) struct Owner {
    pub(crate) id: TaskId,
    pub(crate) name: ArcStr,
    frozen: AtomicBool,
    settled: AtomicBool,
}

impl Owner {
    pub(crate) fn new(name: ArcStr) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            name,
            frozen: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        })
    }

    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub(crate) fn settle(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

/// The context passed to every task body.
pub struct TaskContext<'a> {
    name: &'a str,
    executor: &'a Executor,
    /// Tracing span assigned to this task.
    pub(crate) span: &'a tracing::Span,
}

impl TaskContext<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn executor(&self) -> &Executor {
        self.executor
    }

    /// Updates the progress message shown for this task.
    pub fn progress(&self, message: impl AsRef<str>) {
        self.span.pb_set_message(message.as_ref());
    }
}

/// The configuration phase of a task.
///
/// Handed to the callback of [`Task::create`]. Ports are declared here, the
/// body is attached here, and once the callback returns the builder is turned
/// into an immutable [`Task`].
pub struct TaskBuilder {
    owner: Arc<Owner>,
    executor: Executor,
    task: Arc<OnceLock<Task>>,
    inputs: Vec<Arc<dyn Wired>>,
    outputs: Vec<Arc<dyn Wired>>,
    computed: Vec<Arc<dyn Wired>>,
    composites: Vec<Task>,
    cache: Option<Cache>,
    body: Option<Body>,
}

impl TaskBuilder {
    fn new(owner: Arc<Owner>, executor: Executor) -> Self {
        Self {
            owner,
            executor,
            task: Arc::new(OnceLock::new()),
            inputs: Vec::new(),
            outputs: Vec::new(),
            computed: Vec::new(),
            composites: Vec::new(),
            cache: None,
            body: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.owner.name
    }

    fn slot<T: Value>(&self, name: &str, default: Option<T>) -> Arc<Slot<T>> {
        Arc::new(Slot::new(self.owner.clone(), name.into(), default))
    }

    fn declare_input<T: Value>(&mut self, name: &str, default: Option<T>, kind: InputKind) -> InputPort<T> {
        let slot = self.slot(name, default);
        self.inputs.push(slot.clone());
        InputPort::new(slot, kind)
    }

    fn declare_output<T: Value>(&mut self, name: &str, default: Option<T>, kind: OutputKind) -> OutputPort<T> {
        let slot = self.slot(name, default);
        self.outputs.push(slot.clone());
        if kind == OutputKind::Computed {
            self.computed.push(slot.clone());
        }
        OutputPort::new(slot, self.task.clone(), kind)
    }

    pub fn input<T: Value>(&mut self, name: &str) -> InputPort<T> {
        self.declare_input(name, None, InputKind::Scalar)
    }

    /// Declares an input that reads as `default` until something is assigned.
    pub fn input_or<T: Value>(&mut self, name: &str, default: T) -> InputPort<T> {
        self.declare_input(name, Some(default), InputKind::Scalar)
    }

    pub fn optional_input<T: Value>(&mut self, name: &str) -> InputPort<Option<T>> {
        self.declare_input(name, Some(None), InputKind::Optional)
    }

    pub fn collection_input<T: Value>(&mut self, name: &str) -> InputPort<Vec<T>> {
        self.declare_input(name, None, InputKind::Collection)
    }

    /// Declares a static output.
    pub fn output<T: Value>(&mut self, name: &str) -> OutputPort<T> {
        self.declare_output(name, None, OutputKind::Static)
    }

    /// Declares a static output that reads as `default` until something is
    /// assigned.
    pub fn output_or<T: Value>(&mut self, name: &str, default: T) -> OutputPort<T> {
        self.declare_output(name, Some(default), OutputKind::Static)
    }

    /// Declares an output written by the body.
    pub fn computed_output<T: Value>(&mut self, name: &str) -> OutputPort<T> {
        self.declare_output(name, None, OutputKind::Computed)
    }

    /// Runs the body on `executor` instead of the one given to the factory.
    pub fn executor(&mut self, executor: &Executor) -> &mut Self {
        self.executor = executor.clone();
        self
    }

    /// Enables caching. The digest is stored beside the value of `location`,
    /// under its file name followed by `suffix` and `.digest`.
    ///
    /// `configure` runs on the executor right before the body, so it may read
    /// any port of this task. The cache is checked before the body runs, so
    /// `location` has to be a static output.
    pub fn with_caching<F>(
        &mut self,
        location: &OutputPort<Utf8PathBuf>,
        suffix: &str,
        configure: F,
    ) -> Result<&mut Self, PortError>
    where
        F: FnOnce(&mut Digest) -> anyhow::Result<()> + Send + 'static,
    {
        if location.kind() == OutputKind::Computed {
            return Err(PortError::Computed {
                task: location.slot.owner.name.clone(),
                port: location.slot.name.clone(),
            });
        }

        self.cache = Some(Cache::new(location.clone(), suffix, configure));
        Ok(self)
    }

    /// Folds `task` into this task's dependencies. This task completes only
    /// after `task` does, and fails if `task` fails.
    pub fn composite(&mut self, task: &Task) -> &mut Self {
        self.composites.push(task.clone());
        self
    }

    /// Attaches the body.
    pub fn execute<F>(&mut self, body: F) -> &mut Self
    where
        F: FnOnce(&TaskContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.body = Some(Box::new(body));
        self
    }

    fn finish(self) -> Task {
        let inner = Arc::new(TaskInner {
            owner: self.owner,
            executor: self.executor,
            inputs: self.inputs,
            outputs: self.outputs,
            composites: Mutex::new(self.composites),
            job: Mutex::new(Some(Job {
                body: self.body,
                cache: self.cache,
                computed: self.computed,
            })),
            execution: Arc::new(OnceLock::new()),
            completion: OnceLock::new(),
        });

        let task = Task { inner };
        // Only ever set here, the builder is consumed.
        let _ = self.task.set(task.clone());
        task
    }
}

pub(crate) struct TaskInner {
    owner: Arc<Owner>,
    executor: Executor,
    inputs: Vec<Arc<dyn Wired>>,
    outputs: Vec<Arc<dyn Wired>>,
    composites: Mutex<Vec<Task>>,
    job: Mutex<Option<Job>>,
    execution: Arc<OnceLock<TaskExecution>>,
    completion: OnceLock<Completion>,
}

/// A typed, cacheable unit of work.
///
/// A task's dependencies are never declared directly. They are whatever
/// tasks its ports are wired to, plus its composite sub-tasks. Nothing runs
/// until a completion handle is requested, at which point the reachable graph
/// is frozen and scheduled.
///
/// # Example
///
/// ```rust,no_run
/// use taskport::{Executor, Port, Task};
///
/// let pool = Executor::new("pool", 4)?;
///
/// let (_fetch, version) = Task::create("fetch", &pool, |t| {
///     let version = t.computed_output::<String>("version");
///     let out = version.clone();
///     t.execute(move |_| Ok(out.put("1.21".into())?));
///     Ok(version)
/// })?;
///
/// let (report, ()) = Task::create("report", &pool, |t| {
///     let latest = t.input::<String>("version");
///     latest.set_from(&version)?;
///     t.execute(move |_| {
///         println!("latest: {}", latest.get()?);
///         Ok(())
///     });
///     Ok(())
/// })?;
///
/// report.run()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Clone)]
pub struct Task {
    pub(crate) inner: Arc<TaskInner>,
}

impl Task {
    /// Creates a task. `configure` declares ports and the body, and may return
    /// anything the caller needs afterwards, usually the ports themselves.
    pub fn create<R, F>(name: impl Into<String>, executor: &Executor, configure: F) -> Result<(Task, R), EngineError>
    where
        F: FnOnce(&mut TaskBuilder) -> anyhow::Result<R>,
    {
        let name: String = name.into();
        let mut builder = TaskBuilder::new(Owner::new(name.as_str().into()), executor.clone());

        let extra = configure(&mut builder).map_err(|err| EngineError::Configure(name, err))?;

        Ok((builder.finish(), extra))
    }

    pub fn id(&self) -> TaskId {
        self.inner.owner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.owner.name
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inner.inputs.iter().map(|port| port.name())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.inner.outputs.iter().map(|port| port.name())
    }

    /// Whether the dependency graph of this task has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.inner.owner.is_frozen()
    }

    /// Record of the body run, or the cache skip, once it happened.
    pub fn execution(&self) -> Option<TaskExecution> {
        self.inner.execution.get().cloned()
    }

    /// Folds `task` into this task's dependencies, see
    /// [`TaskBuilder::composite`]. Fails once this task is frozen.
    pub fn declare_composite(&self, task: &Task) -> Result<(), EngineError> {
        let mut composites = lock(&self.inner.composites);

        if self.is_frozen() {
            return Err(EngineError::Frozen(self.name().to_string()));
        }

        composites.push(task.clone());
        Ok(())
    }

    /// Every task this one currently depends on, through its ports and its
    /// composite sub-tasks, in first-seen order.
    pub fn dependencies(&self) -> Vec<Task> {
        let mut seen = HashSet::new();
        let mut dependencies = Vec::new();

        let ports = self.inner.inputs.iter().chain(&self.inner.outputs);
        let wired = ports.flat_map(|port| port.dependencies());
        let composites = lock(&self.inner.composites).clone();

        for task in wired.chain(composites) {
            if seen.insert(task.id()) {
                dependencies.push(task);
            }
        }

        dependencies
    }

    /// The memoized completion handle.
    ///
    /// The first request freezes every task reachable from this one and
    /// schedules them. Scheduled tasks make progress on their executors
    /// whether or not the handle is awaited.
    pub fn completion(&self) -> Completion {
        if let Some(completion) = self.inner.completion.get() {
            return completion.clone();
        }

        match graph::plan(self) {
            Ok(order) => {
                for task in &order {
                    task.schedule();
                }
                self.schedule()
            }
            Err(err) => {
                let completion = self.inner.completion.get_or_init(|| {
                    tracing::error!(task = %self.name(), "{err}");
                    let failure = TaskFailure::new(self.name(), err);
                    future::ready(Err(failure)).boxed().shared()
                });

                completion.clone()
            }
        }
    }

    /// Blocks the calling thread until this task has completed.
    pub fn run(&self) -> Result<Outcome, TaskFailure> {
        futures::executor::block_on(self.completion())
    }

    pub(crate) fn freeze(&self) {
        self.inner.owner.freeze();
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.inner.completion.get().is_some()
    }

    fn schedule(&self) -> Completion {
        self.inner
            .completion
            .get_or_init(|| self.build_completion())
            .clone()
    }

    /// Spawns the task onto its executor's driver right away. The returned
    /// handle only observes the outcome.
    fn build_completion(&self) -> Completion {
        let barrier = try_join_all(self.dependencies().iter().map(Task::completion));

        let job = lock(&self.inner.job).take();
        let owner = self.inner.owner.clone();
        let executor = self.inner.executor.clone();
        let execution = self.inner.execution.clone();
        let name = owner.name.clone();
        let driver = executor.clone();

        let run = async move {
            if let Err(failure) = barrier.await {
                tracing::debug!(task = %owner.name, upstream = failure.task(), "not running, upstream failed");
                owner.settle();
                return Err(failure);
            }

            let job = job.unwrap_or_default();
            let name = owner.name.clone();
            let worker = executor.clone();

            let result = worker.spawn(move || job.run(&owner, &executor, &execution)).await;

            result.unwrap_or_else(|_| {
                Err(TaskFailure::new(
                    name,
                    anyhow::anyhow!("Executor dropped the task before it finished"),
                ))
            })
        };

        let (sender, receiver) = oneshot::channel();
        driver.drive(async move {
            // Nobody may be listening, the task still runs to the end.
            let _ = sender.send(run.await);
        });

        receiver
            .map(move |result| {
                result.unwrap_or_else(|_| {
                    Err(TaskFailure::new(
                        name,
                        anyhow::anyhow!("Driver dropped the task before it finished"),
                    ))
                })
            })
            .boxed()
            .shared()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("executor", &self.executor().name())
            .field("inputs", &self.input_names().collect::<Vec<_>>())
            .field("outputs", &self.output_names().collect::<Vec<_>>())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

#[derive(Default)]
struct Job {
    body: Option<Body>,
    cache: Option<Cache>,
    /// Computed outputs the body has to write.
    computed: Vec<Arc<dyn Wired>>,
}

impl Job {
    fn run(
        self,
        owner: &Owner,
        executor: &Executor,
        execution: &OnceLock<TaskExecution>,
    ) -> Result<Outcome, TaskFailure> {
        let span = tracing::info_span!("task", name = %owner.name);
        span.pb_set_style(&crate::utils::STYLE_TASK);
        span.pb_set_message(&format!("Running {}", owner.name));
        let _enter = span.enter();

        let start = Instant::now();
        let result = self.execute(owner, executor, &span);
        let duration = start.elapsed();
        owner.settle();

        let status = match &result {
            Ok(Outcome::Executed) => Status::Executed,
            Ok(Outcome::UpToDate) => Status::UpToDate,
            Err(_) => Status::Failed,
        };

        let _ = execution.set(TaskExecution {
            start,
            duration,
            status,
        });

        match &result {
            Ok(outcome) => tracing::debug!(?outcome, ?duration, "task finished"),
            Err(failure) => tracing::error!("{failure}"),
        }

        result
    }

    fn execute(self, owner: &Owner, executor: &Executor, span: &tracing::Span) -> Result<Outcome, TaskFailure> {
        let fail = |err: anyhow::Error| TaskFailure::new(owner.name.clone(), err);

        let digest = match self.cache {
            Some(cache) => Some(cache.prepare().map_err(fail)?),
            None => None,
        };

        if let Some(digest) = &digest
            && digest.is_up_to_date().map_err(|err| fail(err.into()))?
        {
            tracing::debug!(digest = %digest.location(), "up to date, skipping");
            return Ok(Outcome::UpToDate);
        }

        if let Some(body) = self.body {
            let context = TaskContext {
                name: &owner.name,
                executor,
                span,
            };

            // The body only touches its own ports and captured state, a panic
            // leaves nothing shared half-written.
            match catch_unwind(AssertUnwindSafe(|| body(&context))) {
                Ok(result) => result.map_err(fail)?,
                Err(panic) => return Err(fail(panic_message(panic))),
            }
        }

        let missing: Vec<&str> = self
            .computed
            .iter()
            .filter(|port| !port.is_written())
            .map(|port| port.name())
            .collect();

        if !missing.is_empty() {
            let missing = missing.join(", ");
            return Err(fail(anyhow::anyhow!("Body finished without writing: {missing}")));
        }

        if let Some(digest) = digest {
            digest.persist().map_err(|err| fail(err.into()))?;
        }

        Ok(Outcome::Executed)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    };

    anyhow::anyhow!(msg)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::engine::port::Port;

    fn pool() -> Executor {
        Executor::new("test", 4).unwrap()
    }

    /// A task with a computed output that sleeps for `delay` and then
    /// publishes `value`.
    fn producer(pool: &Executor, name: &str, value: &str, delay: u64) -> (Task, OutputPort<String>) {
        let value = value.to_string();

        Task::create(name, pool, |t| {
            let out = t.computed_output::<String>("out");
            let port = out.clone();
            t.execute(move |_| {
                std::thread::sleep(Duration::from_millis(delay));
                Ok(port.put(value)?)
            });
            Ok(out)
        })
        .unwrap()
    }

    #[test]
    fn test_body_runs_at_most_once() {
        let pool = pool();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let (task, ()) = Task::create("once", &pool, |t| {
            t.execute(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        })
        .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let task = task.clone();
                std::thread::spawn(move || task.run())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), Outcome::Executed);
        }

        assert_eq!(task.run().unwrap(), Outcome::Executed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upstream_finishes_before_downstream_starts() {
        let pool = pool();
        let log = Arc::new(Mutex::new(Vec::new()));

        let entries = log.clone();
        let (_t1, out) = Task::create("t1", &pool, |t| {
            let out = t.computed_output::<u32>("out");
            let port = out.clone();
            t.execute(move |_| {
                std::thread::sleep(Duration::from_millis(50));
                port.put(1)?;
                lock(&entries).push("t1 end");
                Ok(())
            });
            Ok(out)
        })
        .unwrap();

        let entries = log.clone();
        let (t2, ()) = Task::create("t2", &pool, |t| {
            let input = t.input::<u32>("in");
            input.set_from(&out)?;
            t.execute(move |_| {
                lock(&entries).push("t2 start");
                assert_eq!(input.get()?, 1);
                Ok(())
            });
            Ok(())
        })
        .unwrap();

        t2.run().unwrap();
        assert_eq!(*lock(&log), vec!["t1 end", "t2 start"]);
    }

    #[test]
    fn test_ports_finalize() {
        let pool = pool();

        let (task, (input, output)) = Task::create("ports", &pool, |t| {
            Ok((t.input::<String>("in"), t.output::<String>("out")))
        })
        .unwrap();

        input.set("a".into()).unwrap();
        assert!(matches!(
            input.set("b".into()),
            Err(PortError::AlreadyFinalized { .. })
        ));

        let _ = task.completion();
        assert!(task.is_frozen());

        assert!(matches!(
            output.set("late".into()),
            Err(PortError::AlreadyFinalized { .. })
        ));

        let (other, ()) = Task::create("other", &pool, |_| Ok(())).unwrap();
        assert!(matches!(
            task.declare_composite(&other),
            Err(EngineError::Frozen(_))
        ));
    }

    #[test]
    fn test_output_shapes() {
        let pool = pool();

        let (_task, (fixed, computed)) = Task::create("shapes", &pool, |t| {
            Ok((t.output::<u32>("fixed"), t.computed_output::<u32>("computed")))
        })
        .unwrap();

        assert!(matches!(computed.set(1), Err(PortError::Computed { .. })));
        assert!(matches!(fixed.put(1), Err(PortError::Static { .. })));
        assert!(matches!(fixed.get(), Err(PortError::Unassigned { .. })));

        fixed.set(5).unwrap();
        assert_eq!(fixed.get().unwrap(), 5);
        assert!(matches!(computed.get(), Err(PortError::NotComputed { .. })));
    }

    #[test]
    fn test_computed_output_written_once() {
        let pool = pool();

        let (task, computed) = Task::create("once", &pool, |t| {
            let computed = t.computed_output::<u32>("computed");
            let port = computed.clone();
            t.execute(move |_| {
                port.put(1)?;
                assert!(matches!(port.put(2), Err(PortError::AlreadyFinalized { .. })));
                Ok(())
            });
            Ok(computed)
        })
        .unwrap();

        task.run().unwrap();
        assert_eq!(computed.wait().unwrap(), 1);

        // settled tasks reject writes from outside
        assert!(matches!(computed.put(3), Err(PortError::AlreadyFinalized { .. })));
        assert_eq!(computed.get().unwrap(), 1);
    }

    #[test]
    fn test_unwritten_computed_output_fails_producer() {
        let pool = pool();

        let (_up, out) = Task::create("up", &pool, |t| {
            let out = t.computed_output::<u32>("out");
            t.execute(|_| Ok(()));
            Ok(out)
        })
        .unwrap();

        let (down, ()) = Task::create("down", &pool, |t| {
            let input = t.input::<u32>("in");
            input.set_from(&out)?;
            t.execute(move |_| Ok(input.get().map(drop)?));
            Ok(())
        })
        .unwrap();

        let failure = down.run().unwrap_err();
        assert_eq!(failure.task(), "up");
        assert!(failure.cause().to_string().contains("out"));
        assert!(matches!(out.wait(), Err(PortError::Upstream(_))));
        assert!(matches!(out.put(1), Err(PortError::AlreadyFinalized { .. })));
    }

    #[test]
    fn test_output_outlives_task_handle() {
        let pool = pool();
        let (_, out) = producer(&pool, "up", "kept", 0);

        let (down, input) = Task::create("down", &pool, |t| {
            let input = t.input::<String>("in");
            input.set_from(&out)?;
            Ok(input)
        })
        .unwrap();

        assert_eq!(down.dependencies().len(), 1);
        down.run().unwrap();
        assert_eq!(input.get().unwrap(), "kept");
    }

    /// Polls `flag` for up to five seconds.
    fn eventually(flag: &AtomicBool) -> bool {
        for _ in 0..500 {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn flagging(pool: &Executor, name: &str, flag: &Arc<AtomicBool>, delay: u64) -> Task {
        let flag = flag.clone();
        let (task, ()) = Task::create(name, pool, |t| {
            t.execute(move |_| {
                std::thread::sleep(Duration::from_millis(delay));
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        })
        .unwrap();

        task
    }

    #[test]
    fn test_requesting_completion_schedules_body() {
        let pool = pool();
        let ran = Arc::new(AtomicBool::new(false));
        let task = flagging(&pool, "eager", &ran, 0);

        let _handle = task.completion();
        assert!(eventually(&ran));
        assert_eq!(task.run().unwrap(), Outcome::Executed);
    }

    #[test]
    fn test_independent_branch_survives_failure() {
        let pool = pool();

        let (f, ()) = Task::create("f", &pool, |t| {
            t.execute(|_| anyhow::bail!("broken download"));
            Ok(())
        })
        .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let i = flagging(&pool, "i", &Arc::new(AtomicBool::new(false)), 100);
        let h = flagging(&pool, "h", &ran, 0);
        h.declare_composite(&i).unwrap();

        let (root, ()) = Task::create("root", &pool, |t| {
            t.composite(&f).composite(&h);
            Ok(())
        })
        .unwrap();

        assert_eq!(root.run().unwrap_err().task(), "f");
        assert!(eventually(&ran));
        assert_eq!(h.run().unwrap(), Outcome::Executed);
    }

    #[test]
    fn test_caching_requires_static_location() {
        let pool = pool();

        let err = Task::create("cached", &pool, |t| {
            let location = t.computed_output::<Utf8PathBuf>("location");
            t.with_caching(&location, "", |_| Ok(()))?;
            Ok(())
        })
        .unwrap_err();

        assert!(matches!(err, EngineError::Configure(name, _) if name == "cached"));
    }

    #[test]
    fn test_optional_input_defaults_to_none() {
        let pool = pool();
        let (up, out) = producer(&pool, "up", "value", 0);

        let (task, (empty, wired)) = Task::create("optional", &pool, |t| {
            let empty = t.optional_input::<String>("empty");
            let wired = t.optional_input::<String>("wired");
            wired.set_from_some(&out)?;
            Ok((empty, wired))
        })
        .unwrap();

        assert_eq!(task.dependencies().len(), 1);
        assert_eq!(task.dependencies()[0].id(), up.id());

        task.run().unwrap();
        assert_eq!(empty.get().unwrap(), None);
        assert_eq!(wired.get().unwrap(), Some("value".to_string()));
    }

    #[test]
    fn test_collection_preserves_order() {
        let pool = pool();

        let (_c, c) = producer(&pool, "c", "valueC", 80);
        let (_d, d) = producer(&pool, "d", "valueD", 40);
        let (_e, e) = producer(&pool, "e", "valueE", 0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let (b, ()) = Task::create("b", &pool, |t| {
            let values = t.collection_input::<String>("values");
            values.set_from_outputs(&[c.clone(), d.clone(), e.clone()])?;
            t.execute(move |_| {
                *lock(&sink) = values.get()?;
                Ok(())
            });
            Ok(())
        })
        .unwrap();

        assert_eq!(b.dependencies().len(), 3);

        b.run().unwrap();
        assert_eq!(*lock(&seen), vec!["valueC", "valueD", "valueE"]);
    }

    #[test]
    fn test_composite_failure_fails_parent() {
        let pool = pool();
        let ran = Arc::new(AtomicBool::new(false));

        let (sub, ()) = Task::create("sub", &pool, |t| {
            t.execute(|_| anyhow::bail!("sub-task broke"));
            Ok(())
        })
        .unwrap();

        let flag = ran.clone();
        let (parent, ()) = Task::create("parent", &pool, |t| {
            t.execute(move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        })
        .unwrap();

        parent.declare_composite(&sub).unwrap();

        let failure = parent.run().unwrap_err();
        assert_eq!(failure.task(), "sub");
        assert!(failure.to_string().contains("sub-task broke"));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dependency_failure_propagates() {
        let pool = pool();
        let ran = Arc::new(AtomicBool::new(false));

        let (_f, out) = Task::create("f", &pool, |t| {
            let out = t.computed_output::<u32>("out");
            t.execute(|_| anyhow::bail!("download failed"));
            Ok(out)
        })
        .unwrap();

        let flag = ran.clone();
        let (g, ()) = Task::create("g", &pool, |t| {
            let input = t.input::<u32>("in");
            input.set_from(&out)?;
            t.execute(move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        })
        .unwrap();

        let failure = g.run().unwrap_err();
        assert_eq!(failure.task(), "f");
        assert!(!ran.load(Ordering::SeqCst));
        assert!(g.execution().is_none());

        // the failure is memoized as well
        assert_eq!(g.run().unwrap_err().task(), "f");
    }

    #[test]
    fn test_panic_becomes_failure() {
        let pool = pool();

        let (task, ()) = Task::create("panics", &pool, |t| {
            t.execute(|_| panic!("unexpected layout"));
            Ok(())
        })
        .unwrap();

        let failure = task.run().unwrap_err();
        assert!(failure.cause().to_string().contains("unexpected layout"));
        assert_eq!(task.execution().map(|e| e.status), Some(Status::Failed));
    }

    #[test]
    fn test_configure_error_is_reported() {
        let pool = pool();
        let err = Task::create("broken", &pool, |_| -> anyhow::Result<()> {
            anyhow::bail!("bad wiring")
        })
        .unwrap_err();

        assert!(matches!(err, EngineError::Configure(name, _) if name == "broken"));
    }

    #[test]
    fn test_serial_executor_never_overlaps() {
        let pool = pool();
        let git = Executor::serial("git").unwrap();

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task> = (0..4)
            .map(|i| {
                let active = active.clone();
                let peak = peak.clone();

                let (task, ()) = Task::create(format!("commit-{i}"), &pool, |t| {
                    t.executor(&git).execute(move |_| {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    });
                    Ok(())
                })
                .unwrap();

                task
            })
            .collect();

        let (all, ()) = Task::create("all", &pool, |t| {
            for task in &tasks {
                t.composite(task);
            }
            Ok(())
        })
        .unwrap();

        all.run().unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(tasks.iter().all(|task| task.executor().name() == "git"));
    }

    fn cached(pool: &Executor, target: &Utf8PathBuf, calls: &Arc<AtomicUsize>) -> Task {
        let target = target.clone();
        let counter = calls.clone();

        let (task, ()) = Task::create("a", pool, |t| {
            let path = t.output::<Utf8PathBuf>("path");
            path.set(target.clone())?;

            let committed = path.clone();
            t.with_caching(&path, "", move |digest| {
                digest.add_port(&committed)?;
                Ok(())
            })?;

            t.execute(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        })
        .unwrap();

        task
    }

    #[test]
    fn test_cached_task_skips_when_unchanged() {
        let pool = pool();
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let x = root.join("x");
        std::fs::write(&x, "h1").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(cached(&pool, &x, &calls).run().unwrap(), Outcome::Executed);
        assert!(root.join("x.digest").exists());

        let second = cached(&pool, &x, &calls);
        assert_eq!(second.run().unwrap(), Outcome::UpToDate);
        assert_eq!(second.execution().map(|e| e.status), Some(Status::UpToDate));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        std::fs::write(&x, "h2").unwrap();
        assert_eq!(cached(&pool, &x, &calls).run().unwrap(), Outcome::Executed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_body_does_not_persist_digest() {
        let pool = pool();
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let target = root.join("out.jar");

        let (task, ()) = Task::create("failing", &pool, |t| {
            let path = t.output::<Utf8PathBuf>("path");
            path.set(target.clone())?;
            t.with_caching(&path, "-remap", |digest| {
                digest.add_text("1.21");
                Ok(())
            })?;
            t.execute(|_| anyhow::bail!("remapper exited with 1"));
            Ok(())
        })
        .unwrap();

        assert!(task.run().is_err());
        assert!(!root.join("out.jar-remap.digest").exists());
    }

    fn versioned(pool: &Executor, target: &Utf8PathBuf, version: &str, calls: &Arc<AtomicUsize>) -> Task {
        let version = version.to_string();
        let counter = calls.clone();

        let (task, ()) = Task::create("decompile", pool, |t| {
            let path = t.output::<Utf8PathBuf>("path");
            path.set(target.clone())?;

            t.with_caching(&path, "-decompile", move |digest| {
                digest.add_text(version);
                Ok(())
            })?;

            t.execute(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        })
        .unwrap();

        task
    }

    #[test]
    fn test_text_commitment_change_reruns() {
        let pool = pool();
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let target = root.join("sources");
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(versioned(&pool, &target, "1.21", &calls).run().unwrap(), Outcome::Executed);
        assert_eq!(versioned(&pool, &target, "1.21", &calls).run().unwrap(), Outcome::UpToDate);
        assert_eq!(versioned(&pool, &target, "1.22", &calls).run().unwrap(), Outcome::Executed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
