mod cache;
mod executor;
mod graph;
mod input;
mod output;
mod port;
pub(crate) mod runner;
mod task;

pub use crate::engine::cache::{Commit, Digest, Number};
pub use crate::engine::executor::Executor;
pub use crate::engine::input::{InputKind, InputPort};
pub use crate::engine::output::{OutputKind, OutputPort};
pub use crate::engine::port::{Pending, Port, Value};
pub use crate::engine::runner::{Report, Status, TaskExecution, TaskReport};
pub use crate::engine::task::{Completion, Outcome, Task, TaskBuilder, TaskContext};
