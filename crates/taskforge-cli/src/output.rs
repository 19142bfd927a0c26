// Output formatting for the CLI.

use serde::Serialize;
use taskforge_engine::engine::{RunReport, TaskStatus};

#[derive(Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

#[derive(Serialize)]
struct TaskOutcomeView {
    task: String,
    status: &'static str,
    attempts: u32,
    error: Option<String>,
    duration_ms: Option<i64>,
}

#[derive(Serialize)]
struct RunReportView {
    workflow: String,
    failed: bool,
    tasks: Vec<TaskOutcomeView>,
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
        TaskStatus::Skipped => "skipped",
    }
}

pub fn print_report(report: &RunReport, format: OutputFormat) {
    let view = RunReportView {
        workflow: report.workflow_name.clone(),
        failed: report.failed(),
        tasks: report
            .outcomes
            .iter()
            .map(|o| TaskOutcomeView {
                task: o.task_name.clone(),
                status: status_label(o.status),
                attempts: o.attempts,
                error: o.error_kind.as_ref().map(|e| e.to_string()),
                duration_ms: match (o.start, o.end) {
                    (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                    _ => None,
                },
            })
            .collect(),
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&view).unwrap());
        }
        OutputFormat::Text => {
            println!("workflow: {} ({})", view.workflow, if view.failed { "failed" } else { "succeeded" });
            for task in &view.tasks {
                let duration = task
                    .duration_ms
                    .map(|ms| format!("{ms}ms"))
                    .unwrap_or_else(|| "-".to_string());
                let error = task.error.as_deref().unwrap_or("-");
                println!(
                    "  {:<20} {:<10} attempts={:<3} duration={:<8} error={}",
                    task.task, task.status, task.attempts, duration, error
                );
            }
        }
    }
}
