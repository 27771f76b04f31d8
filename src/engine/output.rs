use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use futures::future::{self, BoxFuture};

use crate::engine::port::{Port, Slot, Value};
use crate::engine::task::Task;
use crate::error::PortError;

/// Which shape an output port was declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Assigned by the caller before scheduling, independent of the body.
    Static,
    /// Written by the task body while it executes.
    Computed,
}

/// A port whose value is produced by, or on behalf of, its task.
///
/// Static outputs are wired like inputs and describe values that are known up
/// front, such as the path a download will be written to. Computed outputs are
/// filled in by the body through [`OutputPort::put`].
///
/// Consumers on other tasks never read an output directly: wiring an input to
/// it with [`InputPort::set_from`](crate::InputPort::set_from) makes the
/// consumer wait for this port's task before the value is read.
///
/// An output port keeps its task alive, so wiring to it keeps working after
/// the caller dropped the [`Task`] handle itself.
pub struct OutputPort<T> {
    pub(crate) slot: Arc<Slot<T>>,
    /// Filled in once the builder has turned into a task.
    task: Arc<OnceLock<Task>>,
    kind: OutputKind,
}

impl<T> Clone for OutputPort<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            task: self.task.clone(),
            kind: self.kind,
        }
    }
}

impl<T: Value> OutputPort<T> {
    pub(crate) fn new(slot: Arc<Slot<T>>, task: Arc<OnceLock<Task>>, kind: OutputKind) -> Self {
        Self { slot, task, kind }
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    /// Assigns the value of a static output.
    pub fn set(&self, value: T) -> Result<(), PortError> {
        self.ensure_static()?;
        self.slot.literal(value)
    }

    /// Assigns a lazily evaluated value to a static output, typically derived
    /// from other ports of the same task.
    pub fn set_with<F, Fut>(&self, dependencies: Vec<Task>, supplier: F) -> Result<(), PortError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PortError>> + Send + 'static,
    {
        self.ensure_static()?;
        self.slot.deferred(dependencies, supplier)
    }

    /// Writes a computed output. Called from the task body, at most once,
    /// and rejected once the task has settled.
    pub fn put(&self, value: T) -> Result<(), PortError> {
        if self.kind == OutputKind::Static {
            return Err(PortError::Static {
                task: self.slot.owner.name.clone(),
                port: self.slot.name.clone(),
            });
        }

        if self.slot.owner.is_settled() {
            return Err(self.slot.finalized());
        }

        self.slot.computed.set(value).map_err(|_| self.slot.finalized())
    }

    /// The value once the owning task has completed.
    pub fn settled(&self) -> BoxFuture<'static, Result<T, PortError>> {
        let completion = self.owning_task().map(|task| task.completion());
        let port = self.clone();

        async move {
            completion?.await?;
            port.value().await
        }
        .boxed()
    }

    /// Blocks until the owning task has completed, then reads the value.
    pub fn wait(&self) -> Result<T, PortError> {
        futures::executor::block_on(self.settled())
    }

    pub(crate) fn owning_task(&self) -> Result<Task, PortError> {
        self.task.get().cloned().ok_or_else(|| PortError::Detached {
            task: self.slot.owner.name.clone(),
            port: self.slot.name.clone(),
        })
    }

    fn ensure_static(&self) -> Result<(), PortError> {
        match self.kind {
            OutputKind::Static => Ok(()),
            OutputKind::Computed => Err(PortError::Computed {
                task: self.slot.owner.name.clone(),
                port: self.slot.name.clone(),
            }),
        }
    }
}

impl<T: Value> Port for OutputPort<T> {
    type Item = T;

    fn name(&self) -> &str {
        &self.slot.name
    }

    fn task_name(&self) -> &str {
        &self.slot.owner.name
    }

    /// The value as it stands now: the static source, or whatever the body
    /// has written so far.
    fn value(&self) -> BoxFuture<'static, Result<T, PortError>> {
        match self.kind {
            OutputKind::Static => self.slot.resolve(),
            OutputKind::Computed => {
                let value = self.slot.computed.get().cloned().ok_or_else(|| PortError::NotComputed {
                    task: self.slot.owner.name.clone(),
                    port: self.slot.name.clone(),
                });

                future::ready(value).boxed()
            }
        }
    }
}

impl<T> std::fmt::Debug for OutputPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort")
            .field("task", &self.slot.owner.name)
            .field("name", &self.slot.name)
            .field("kind", &self.kind)
            .finish()
    }
}
