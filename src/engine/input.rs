use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, try_join_all};
use futures::{FutureExt, TryFutureExt};

use crate::engine::output::OutputPort;
use crate::engine::port::{Port, Slot, Value};
use crate::engine::task::Task;
use crate::error::PortError;

/// Which shape an input port was declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Wraps a single value.
    Scalar,
    /// Wraps an `Option<T>`, `None` until assigned.
    Optional,
    /// Wraps an ordered `Vec<T>`, usually gathered from several outputs.
    Collection,
}

/// A port whose value is supplied by the owner of the task.
///
/// The value is a literal, another task's [`OutputPort`], or a lazily
/// evaluated source. Wiring an input to an output is what makes the owning
/// task depend on the output's task.
pub struct InputPort<T> {
    pub(crate) slot: Arc<Slot<T>>,
    kind: InputKind,
}

impl<T> Clone for InputPort<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            kind: self.kind,
        }
    }
}

impl<T: Value> InputPort<T> {
    pub(crate) fn new(slot: Arc<Slot<T>>, kind: InputKind) -> Self {
        Self { slot, kind }
    }

    pub fn kind(&self) -> InputKind {
        self.kind
    }

    /// Assigns an immediately available value.
    pub fn set(&self, value: T) -> Result<(), PortError> {
        self.slot.literal(value)
    }

    /// Assigns a lazily evaluated value. `dependencies` lists every task the
    /// produced future waits on; they become dependencies of the owning task.
    pub fn set_with<F, Fut>(&self, dependencies: Vec<Task>, supplier: F) -> Result<(), PortError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PortError>> + Send + 'static,
    {
        self.slot.deferred(dependencies, supplier)
    }

    /// Wires this input to another task's output.
    pub fn set_from(&self, output: &OutputPort<T>) -> Result<(), PortError> {
        let upstream = output.owning_task()?;
        let output = output.clone();

        self.set_with(vec![upstream], move || output.settled())
    }

    /// Whether a source has been assigned. Defaults do not count.
    pub fn is_assigned(&self) -> bool {
        self.slot.is_assigned()
    }
}

impl<T: Value> InputPort<Option<T>> {
    /// Wires this optional input to another task's output, wrapping its value
    /// in `Some`.
    pub fn set_from_some(&self, output: &OutputPort<T>) -> Result<(), PortError> {
        let upstream = output.owning_task()?;
        let output = output.clone();

        self.set_with(vec![upstream], move || output.settled().map_ok(Some))
    }
}

impl<T: Value> InputPort<Vec<T>> {
    /// Gathers the values of `outputs` in the given order, regardless of the
    /// order in which their tasks complete.
    pub fn set_from_outputs(&self, outputs: &[OutputPort<T>]) -> Result<(), PortError> {
        let mut dependencies = Vec::with_capacity(outputs.len());
        for output in outputs {
            let task = output.owning_task()?;
            if !dependencies.iter().any(|dep: &Task| dep.id() == task.id()) {
                dependencies.push(task);
            }
        }

        let outputs = outputs.to_vec();
        self.set_with(dependencies, move || {
            try_join_all(outputs.iter().map(OutputPort::settled))
        })
    }
}

impl<T: Value> Port for InputPort<T> {
    type Item = T;

    fn name(&self) -> &str {
        &self.slot.name
    }

    fn task_name(&self) -> &str {
        &self.slot.owner.name
    }

    fn value(&self) -> BoxFuture<'static, Result<T, PortError>> {
        self.slot.resolve()
    }
}

impl<T> std::fmt::Debug for InputPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort")
            .field("task", &self.slot.owner.name)
            .field("name", &self.slot.name)
            .field("kind", &self.kind)
            .finish()
    }
}
