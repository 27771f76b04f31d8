use std::fmt::{Display, Formatter, Write};
use std::time::{Duration, Instant};

use console::style;
use serde::Serialize;

use super::Status;

/// Outcome of a pipeline run, one entry per task in dependency order.
///
/// Returned by [`Engine::run`](crate::Engine::run), and carried by
/// [`EngineError::Failed`](crate::EngineError::Failed) when the run failed.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub tasks: Vec<TaskReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: usize,
    pub name: String,
    pub executor: String,
    /// Ids of the direct dependencies.
    pub dependencies: Vec<usize>,
    pub status: Status,
    #[serde(skip)]
    pub start: Option<Instant>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
}

impl Report {
    /// Status of the first task called `name`.
    pub fn status(&self, name: &str) -> Option<Status> {
        self.tasks
            .iter()
            .find(|task| task.name == name)
            .map(|task| task.status)
    }

    pub fn count(&self, status: Status) -> usize {
        self.tasks.iter().filter(|task| task.status == status).count()
    }

    /// Serialize the report to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cached (skipped)
    /// * **Grey**: Not run
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        _ = writeln!(f, "graph LR");

        let executed = self
            .tasks
            .iter()
            .filter(|task| task.status == Status::Executed)
            .filter_map(|task| task.duration)
            .map(|duration| duration.as_secs_f64());

        let (mut min_time, mut max_time) = executed.fold((f64::MAX, f64::MIN), |(lo, hi), secs| {
            (lo.min(secs), hi.max(secs))
        });

        if min_time > max_time {
            // No tasks ran
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for task in &self.tasks {
            let name = task.name.replace('"', "\\\"");

            let (label_extra, color_code) = match (task.status, task.duration) {
                (Status::Executed, Some(duration)) => {
                    let t = (duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{duration:.2?}"), gradient(t))
                }
                (Status::Executed, None) => ("Done".to_string(), gradient(0.0)),
                (Status::UpToDate, _) => ("Cached".to_string(), "#ADD8E6".to_string()),
                (Status::Failed, _) => ("Failed".to_string(), "#F87171".to_string()),
                (Status::NotRun, _) => ("Not run".to_string(), "#D1D5DB".to_string()),
            };

            _ = writeln!(f, "    {}[\"{}\\n{}\"]", task.id, name, label_extra);
            _ = writeln!(f, "    style {} fill:{}", task.id, color_code);
        }

        for task in &self.tasks {
            for dependency in &task.dependencies {
                _ = writeln!(f, "    {} --> {}", dependency, task.id);
            }
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);

    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };

    format!("#{r:02X}{g:02X}{b:02X}")
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for task in &self.tasks {
            let status = match task.status {
                Status::Executed => style("done").green(),
                Status::UpToDate => style("cached").blue(),
                Status::Failed => style("failed").red(),
                Status::NotRun => style("skipped").dim(),
            };

            match task.duration {
                Some(duration) => writeln!(f, "{status:>8} {} ({duration:.2?})", task.name)?,
                None => writeln!(f, "{status:>8} {}", task.name)?,
            }
        }

        write!(
            f,
            "{} executed, {} cached, {} failed, {} not run",
            self.count(Status::Executed),
            self.count(Status::UpToDate),
            self.count(Status::Failed),
            self.count(Status::NotRun),
        )
    }
}
