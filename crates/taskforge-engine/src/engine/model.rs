//! The workflow catalogue's data model: the immutable output of the parser
//! that the executor walks.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ErrorKind;
use crate::value::Value;

/// A task declared inside a workflow. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub description: Option<String>,
    pub command: String,
    pub delegate_to: Option<String>,
    pub retries: u32,
    pub timeout: Option<Duration>,
    pub depends_on: Vec<String>,
    pub tags: Vec<String>,
}

impl Task {
    /// Converts a script-supplied keyed aggregate into a `Task`, per the
    /// task_spec fields: `{name, description, command, delegate_to?,
    /// retries?, timeout?, depends_on?, tags?}`.
    pub fn from_value(value: &Value) -> Result<Task, ErrorKind> {
        let Value::Map(map) = value else {
            return Err(ErrorKind::Malformed("task_spec must be a keyed aggregate".to_string()));
        };
        let name = map
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorKind::Malformed("task_spec missing required field 'name'".to_string()))?
            .to_string();
        let command = map
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ErrorKind::Malformed(format!("task '{name}' missing required field 'command'"))
            })?
            .to_string();
        let description = map.get("description").and_then(Value::as_str).map(String::from);
        let delegate_to = map.get("delegate_to").and_then(Value::as_str).map(String::from);
        let retries = map
            .get("retries")
            .and_then(Value::as_f64)
            .map(|n| n as u32)
            .unwrap_or(0);
        let timeout = map
            .get("timeout")
            .and_then(Value::as_f64)
            .map(Duration::from_secs_f64);
        let depends_on = match map.get("depends_on") {
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(String::from)
                        .ok_or_else(|| ErrorKind::Malformed(format!("task '{name}' depends_on entries must be strings")))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(ErrorKind::Malformed(format!(
                    "task '{name}' depends_on must be a sequence"
                )))
            }
            None => Vec::new(),
        };
        let tags = match map.get("tags") {
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };
        Ok(Task {
            name,
            description,
            command,
            delegate_to,
            retries,
            timeout,
            depends_on,
            tags,
        })
    }
}

/// A workflow: an ordered, named collection of tasks.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub description: Option<String>,
    pub workdir: Option<String>,
    pub create_workdir_before_run: bool,
    pub tasks: Vec<Task>,
    pub version: u32,
}

impl Workflow {
    /// Converts a script-supplied `workflow(spec)` aggregate into a
    /// `Workflow`: `{name, description, workdir, create_workdir_before_run,
    /// tasks: [ task_spec, ... ]}`. Enforces unique task names within the
    /// workflow.
    pub fn from_value(value: &Value) -> Result<Workflow, ErrorKind> {
        let Value::Map(map) = value else {
            return Err(ErrorKind::Malformed("workflow spec must be a keyed aggregate".to_string()));
        };
        let name = map
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorKind::Malformed("workflow spec missing required field 'name'".to_string()))?
            .to_string();
        let description = map.get("description").and_then(Value::as_str).map(String::from);
        let workdir = map.get("workdir").and_then(Value::as_str).map(String::from);
        let create_workdir_before_run = map
            .get("create_workdir_before_run")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let tasks_value = map
            .get("tasks")
            .ok_or_else(|| ErrorKind::Malformed(format!("workflow '{name}' missing required field 'tasks'")))?;
        let Value::Sequence(task_values) = tasks_value else {
            return Err(ErrorKind::Malformed(format!("workflow '{name}' field 'tasks' must be a sequence")));
        };

        let mut tasks = Vec::with_capacity(task_values.len());
        let mut seen = std::collections::HashSet::new();
        for task_value in task_values {
            let task = Task::from_value(task_value)?;
            if !seen.insert(task.name.clone()) {
                return Err(ErrorKind::DuplicateName(format!(
                    "task '{}' declared twice in workflow '{name}'",
                    task.name
                )));
            }
            tasks.push(task);
        }

        Ok(Workflow {
            name,
            description,
            workdir,
            create_workdir_before_run,
            tasks,
            version: 1,
        })
    }

    /// Computes a topological execution order over `depends_on`, breaking
    /// ties by declaration order. Rejects cycles as `Malformed`.
    pub fn execution_order(&self) -> Result<Vec<usize>, ErrorKind> {
        let index_of: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];

        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let dep_idx = *index_of.get(dep.as_str()).ok_or_else(|| {
                    ErrorKind::Malformed(format!(
                        "task '{}' depends_on unknown task '{}'",
                        task.name, dep
                    ))
                })?;
                dependents[dep_idx].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: Vec<usize> = (0..self.tasks.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while !ready.is_empty() {
            ready.sort_unstable();
            let next = ready.remove(0);
            order.push(next);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(dependent);
                }
            }
        }

        if order.len() != self.tasks.len() {
            return Err(ErrorKind::Malformed(format!(
                "workflow '{}' has a dependency cycle",
                self.name
            )));
        }
        Ok(order)
    }
}

/// The immutable catalogue produced by the parser.
#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    workflows: HashMap<String, Workflow>,
}

impl Catalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Registers a workflow. A second registration under the same name
    /// within the same parse bumps `version` rather than erroring — the
    /// parser itself is responsible for rejecting duplicates within a
    /// single script evaluation; this only backs repeated re-registration
    /// across separate parses of an unchanged script.
    pub fn insert(&mut self, mut workflow: Workflow) {
        if let Some(existing) = self.workflows.get(&workflow.name) {
            workflow.version = existing.version + 1;
        }
        self.workflows.insert(workflow.name.clone(), workflow);
    }
}

/// Terminal or in-flight status of a task's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

/// The runtime record of a single task's execution.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_name: String,
    pub status: TaskStatus,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub output: Option<Value>,
    pub tags: Vec<String>,
}

impl TaskOutcome {
    pub fn pending(task: &Task) -> Self {
        Self {
            task_name: task.name.clone(),
            status: TaskStatus::Pending,
            start: None,
            end: None,
            attempts: 0,
            error_kind: None,
            output: None,
            tags: task.tags.clone(),
        }
    }
}
