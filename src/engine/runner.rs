mod diagnostics;

use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::graph::TaskGraph;
use crate::engine::task::Task;
use crate::error::{EngineError, TaskFailure};

pub use diagnostics::{Report, TaskReport};

/// Final state of a task after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// The body ran and succeeded.
    Executed,
    /// The cache digest matched, the body was skipped.
    UpToDate,
    /// The body, or the cache check, failed.
    Failed,
    /// Never started because something upstream failed.
    NotRun,
}

/// When a task's body ran, for how long, and how it ended.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
    pub status: Status,
}

/// Drives every task reachable from `roots` until each one has settled.
///
/// Independent branches keep running when another branch fails. Once
/// everything settled, the first failure in dependency order is returned
/// together with the full report.
pub(crate) fn run(roots: &[Task]) -> Result<Report, EngineError> {
    let graph = TaskGraph::walk(roots, true);
    let order = graph.order()?;

    let root_span = tracing::info_span!("pipeline");
    root_span.pb_set_length(order.len() as u64);
    root_span.pb_set_style(&crate::utils::STYLE_PIPELINE);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    // Requested in dependency order, so each request only schedules itself.
    let settled = order.iter().map(|id| {
        let span = root_span.clone();

        graph.tasks[id].completion().map(move |result| {
            span.pb_inc(1);
            result
        })
    });

    let results = futures::executor::block_on(join_all(settled));

    let mut failures: Vec<TaskFailure> = Vec::new();
    let mut reports = Vec::with_capacity(order.len());

    for (id, result) in order.iter().zip(results) {
        let task = &graph.tasks[id];
        let execution = task.execution();

        let status = match (&execution, &result) {
            (Some(execution), _) => execution.status,
            (None, Ok(_)) => Status::Executed,
            (None, Err(_)) => Status::NotRun,
        };

        if let Err(failure) = &result {
            failures.push(failure.clone());
        }

        reports.push(TaskReport {
            id: id.index(),
            name: task.name().to_string(),
            executor: task.executor().name().to_string(),
            dependencies: graph.dependencies_of(*id).map(|dep| dep.index()).collect(),
            status,
            start: execution.as_ref().map(|execution| execution.start),
            duration: execution.as_ref().map(|execution| execution.duration),
            error: result.err().map(|failure| failure.to_string()),
        });
    }

    let report = Report { tasks: reports };

    // Prefer the failure raised by its own task over the copies its
    // dependents observed.
    let origin = failures
        .iter()
        .find(|failure| report.status(failure.task()) == Some(Status::Failed))
        .or(failures.first())
        .cloned();

    match origin {
        Some(failure) => Err(EngineError::Failed(failure, Box::new(report))),
        None => Ok(report),
    }
}
