//! The value-holding core shared by input and output ports.
//!
//! A [`Slot`] holds at most one [`Source`]: either a literal, or a deferred
//! supplier of a future together with the tasks that future waits on. The
//! supplier sits behind a `LazyLock`, so it is invoked once no matter how many
//! readers race for it, and the resulting future is `Shared` between them.

use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex, OnceLock};

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};

use crate::core::{ArcStr, lock};
use crate::engine::task::{Owner, Task};
use crate::error::PortError;

/// Anything that can flow through a port.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}

/// A memoized, shareable future of a port's value.
pub type Pending<T> = Shared<BoxFuture<'static, Result<T, PortError>>>;

type Supplier<T> = Box<dyn FnOnce() -> Pending<T> + Send>;

pub(crate) enum Source<T> {
    Literal(T),
    Deferred {
        value: Arc<LazyLock<Pending<T>, Supplier<T>>>,
        dependencies: Vec<Task>,
    },
}

/// Typed handle to a value that becomes available asynchronously.
///
/// Implemented by [`InputPort`](crate::InputPort) and
/// [`OutputPort`](crate::OutputPort).
pub trait Port {
    /// Type of the value carried by the port.
    type Item: Value;

    /// Diagnostic name of the port.
    fn name(&self) -> &str;

    /// Name of the task that declared the port.
    fn task_name(&self) -> &str;

    /// The port's value as a future.
    fn value(&self) -> BoxFuture<'static, Result<Self::Item, PortError>>;

    /// Blocks the calling thread until the port's value is available.
    fn get(&self) -> Result<Self::Item, PortError> {
        futures::executor::block_on(self.value())
    }
}

pub(crate) struct Slot<T> {
    pub(crate) name: ArcStr,
    pub(crate) owner: Arc<Owner>,
    default: Option<T>,
    source: Mutex<Option<Source<T>>>,
    /// Written by the body, computed outputs only.
    pub(crate) computed: OnceLock<T>,
}

impl<T: Value> Slot<T> {
    pub(crate) fn new(owner: Arc<Owner>, name: ArcStr, default: Option<T>) -> Self {
        Self {
            name,
            owner,
            default,
            source: Mutex::new(None),
            computed: OnceLock::new(),
        }
    }

    fn assign(&self, source: Source<T>) -> Result<(), PortError> {
        let mut slot = lock(&self.source);

        // Checked under the slot lock: freezing reads every slot afterwards,
        // so a wiring either lands before the freeze is observed or not at all.
        if slot.is_some() || self.owner.is_frozen() {
            return Err(self.finalized());
        }

        tracing::trace!(task = %self.owner.name, port = %self.name, "port assigned");
        *slot = Some(source);
        Ok(())
    }

    pub(crate) fn literal(&self, value: T) -> Result<(), PortError> {
        self.assign(Source::Literal(value))
    }

    pub(crate) fn deferred<F, Fut>(&self, dependencies: Vec<Task>, supplier: F) -> Result<(), PortError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PortError>> + Send + 'static,
    {
        let supplier: Supplier<T> = Box::new(move || supplier().boxed().shared());

        self.assign(Source::Deferred {
            value: Arc::new(LazyLock::new(supplier)),
            dependencies,
        })
    }

    pub(crate) fn is_assigned(&self) -> bool {
        lock(&self.source).is_some()
    }

    pub(crate) fn resolve(&self) -> BoxFuture<'static, Result<T, PortError>> {
        let deferred = match &*lock(&self.source) {
            Some(Source::Literal(value)) => return future::ready(Ok(value.clone())).boxed(),
            Some(Source::Deferred { value, .. }) => value.clone(),
            None => {
                let value = self.default.clone().ok_or_else(|| self.unassigned());
                return future::ready(value).boxed();
            }
        };

        // Forced outside the slot lock, the supplier may read other ports.
        LazyLock::force(&deferred).clone().boxed()
    }

    pub(crate) fn finalized(&self) -> PortError {
        PortError::AlreadyFinalized {
            task: self.owner.name.clone(),
            port: self.name.clone(),
        }
    }

    pub(crate) fn unassigned(&self) -> PortError {
        PortError::Unassigned {
            task: self.owner.name.clone(),
            port: self.name.clone(),
        }
    }
}

/// Type-erased view of a port used while collecting a task's dependencies.
pub(crate) trait Wired: Send + Sync {
    fn name(&self) -> &str;
    fn dependencies(&self) -> Vec<Task>;
    /// Whether the body has written the computed value.
    fn is_written(&self) -> bool;
}

impl<T: Value> Wired for Slot<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<Task> {
        match &*lock(&self.source) {
            Some(Source::Deferred { dependencies, .. }) => dependencies.clone(),
            Some(Source::Literal(_)) | None => Vec::new(),
        }
    }

    fn is_written(&self) -> bool {
        self.computed.get().is_some()
    }
}
