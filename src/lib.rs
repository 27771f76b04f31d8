#![forbid(unsafe_code)]
//! A task execution engine for multi-stage content pipelines.
//!
//! Work is split into [`Task`]s. Each task declares typed [`InputPort`]s and
//! [`OutputPort`]s, and wiring an input to another task's output is all it
//! takes to make one task depend on another. Nothing runs while the graph is
//! being wired. Requesting a task's [`Completion`] freezes everything
//! reachable from it, and each body then runs on its [`Executor`] as soon as
//! all of its upstream tasks have completed.
//!
//! Tasks that opt into caching commit their inputs to a [`Digest`]. When the
//! digest matches the one persisted by the previous successful run, the body
//! is skipped.
//!
//! ## Core abstractions
//!
//! * [`Task::create`]: factory running a configuration callback on a
//!   [`TaskBuilder`], where ports are declared and the body is attached.
//! * [`Port`]: the shared read side of inputs and outputs.
//! * [`Digest`]: ordered, content-hashed commitments deciding staleness.
//! * [`Engine`]: owns the executors and drives whole graphs to completion,
//!   returning a [`Report`].

mod config;
mod core;
mod engine;
mod error;
#[cfg(feature = "logging")]
mod logging;
mod utils;

pub use crate::config::{Engine, EngineConfig};
pub use crate::core::TaskId;
pub use crate::engine::*;
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;

/// Result of a task body.
pub type TaskResult<T = ()> = anyhow::Result<T>;
