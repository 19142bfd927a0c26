//! The task scheduler: walks a workflow's dependency graph, dispatching
//! each task locally or to a delegation target, applying retries and
//! timeouts, and recording outcomes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::delegation::DelegationFabric;
use crate::error::ErrorKind;
use crate::observability::Observability;
use crate::reliability::RetryPolicy;
use crate::value::Value;

use super::model::{Catalogue, Task, TaskOutcome, TaskStatus, Workflow};

/// A timeout-free fallback used when a task declares no `timeout`; large
/// enough to never fire in practice without overflowing `Instant` math.
const NO_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 10);

/// The externalisable hook that runs a task's opaque `command` in-process.
/// Real domain-module execution (shell, cloud APIs, package managers, ...)
/// is deliberately out of scope; this trait is the seam where it plugs in.
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<Value, ErrorKind>;
}

/// Default local executor: echoes the task's command back as its output,
/// useful for tests and as a baseline before a real adapter is registered.
pub struct EchoLocalExecutor;

#[async_trait]
impl LocalExecutor for EchoLocalExecutor {
    async fn execute(&self, task: &Task) -> Result<Value, ErrorKind> {
        Ok(Value::String(task.command.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on independent tasks run concurrently within a single
    /// workflow execution. Defaults to 1 (strict sequential).
    pub max_fanout: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_fanout: 1,
            retry_policy: RetryPolicy::exponential(),
        }
    }
}

/// The result of running one workflow to completion (or to its first
/// unrecovered failure).
#[derive(Debug, Clone)]
pub struct RunReport {
    pub workflow_name: String,
    pub outcomes: Vec<TaskOutcome>,
}

impl RunReport {
    pub fn failed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.status, TaskStatus::Failed | TaskStatus::Cancelled))
    }
}

pub struct Executor {
    store: Arc<dyn crate::persistence::Store>,
    fabric: Arc<DelegationFabric>,
    observability: Arc<Observability>,
    local: Arc<dyn LocalExecutor>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        store: Arc<dyn crate::persistence::Store>,
        fabric: Arc<DelegationFabric>,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            store,
            fabric,
            observability,
            local: Arc::new(EchoLocalExecutor),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_local_executor(mut self, local: Arc<dyn LocalExecutor>) -> Self {
        self.local = local;
        self
    }

    pub fn store(&self) -> &Arc<dyn crate::persistence::Store> {
        &self.store
    }

    #[instrument(skip(self, catalogue, cancel))]
    pub async fn run(
        &self,
        catalogue: &Catalogue,
        workflow_name: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunReport, ErrorKind> {
        let workflow = catalogue
            .get(workflow_name)
            .ok_or_else(|| ErrorKind::unknown_workflow(workflow_name))?;

        if workflow.create_workdir_before_run {
            if let Some(dir) = &workflow.workdir {
                std::fs::create_dir_all(dir).map_err(|e| ErrorKind::WorkdirCreate(e.to_string()))?;
            }
        }

        // Validate the graph up front so a cyclic catalogue never reaches
        // the concurrent scheduling loop below.
        workflow.execution_order()?;

        let trace = self.observability.start_trace();
        let outcomes = self.run_tasks(workflow, &trace, cancel).await;
        self.observability.end_trace(trace);

        Ok(RunReport {
            workflow_name: workflow_name.to_string(),
            outcomes,
        })
    }

    async fn run_tasks(
        &self,
        workflow: &Workflow,
        trace: &crate::observability::TraceId,
        cancel: watch::Receiver<bool>,
    ) -> Vec<TaskOutcome> {
        let n = workflow.tasks.len();
        let index_of: HashMap<&str, usize> = workflow
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, task) in workflow.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let dep_idx = index_of[dep.as_str()];
                dependents[dep_idx].push(i);
                in_degree[i] += 1;
            }
        }

        let mut outcomes: Vec<TaskOutcome> = workflow.tasks.iter().map(TaskOutcome::pending).collect();
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        ready.make_contiguous().sort_unstable();

        let semaphore = Arc::new(Semaphore::new(self.config.max_fanout.max(1)));
        let mut running: JoinSet<(usize, TaskOutcome)> = JoinSet::new();
        let mut failed = false;

        loop {
            while !failed && running.len() < self.config.max_fanout.max(1) {
                let Some(idx) = ready.pop_front() else { break };
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let task = workflow.tasks[idx].clone();
                let trace_id = *trace;
                let cancel = cancel.clone();
                let executor = self.clone_handles();
                running.spawn(async move {
                    let _permit = permit;
                    let outcome = executor.run_one(&task, trace_id, cancel).await;
                    (idx, outcome)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (idx, outcome) = joined.expect("task runner panicked");
            let task_failed = matches!(outcome.status, TaskStatus::Failed | TaskStatus::Cancelled);
            outcomes[idx] = outcome;

            if task_failed {
                failed = true;
                continue;
            }

            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
            ready.make_contiguous().sort_unstable();
        }

        if failed {
            for outcome in outcomes.iter_mut() {
                if outcome.status == TaskStatus::Pending {
                    outcome.status = TaskStatus::Skipped;
                }
            }
        }

        outcomes
    }

    /// Cheap clone of the `Arc`-held collaborators, used to move a
    /// self-contained handle into a spawned task.
    fn clone_handles(&self) -> Arc<ExecutorHandles> {
        Arc::new(ExecutorHandles {
            fabric: self.fabric.clone(),
            observability: self.observability.clone(),
            local: self.local.clone(),
            retry_policy: self.config.retry_policy.clone(),
        })
    }
}

struct ExecutorHandles {
    fabric: Arc<DelegationFabric>,
    observability: Arc<Observability>,
    local: Arc<dyn LocalExecutor>,
    retry_policy: RetryPolicy,
}

impl ExecutorHandles {
    #[instrument(skip(self, cancel), fields(task = %task.name))]
    async fn run_one(
        &self,
        task: &Task,
        trace: crate::observability::TraceId,
        cancel: watch::Receiver<bool>,
    ) -> TaskOutcome {
        let mut outcome = TaskOutcome::pending(task);
        outcome.status = TaskStatus::Running;
        outcome.start = Some(Utc::now());

        let span = self.observability.start_span(trace, task.name.clone(), None);
        let policy = self
            .retry_policy
            .clone()
            .with_max_attempts(task.retries + 1);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            outcome.attempts = attempt;
            if attempt > 1 {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }

            let result = crate::reliability::run_with_timeout(
                self.attempt(task),
                task.timeout,
                cancel.clone(),
            )
            .await;

            match result {
                Ok(value) => {
                    outcome.status = TaskStatus::Succeeded;
                    outcome.output = Some(value);
                    outcome.error_kind = None;
                    break;
                }
                Err(ErrorKind::Cancelled) => {
                    outcome.status = TaskStatus::Cancelled;
                    outcome.error_kind = Some(ErrorKind::Cancelled);
                    break;
                }
                Err(error) => {
                    let retryable = policy.should_retry(&error);
                    let has_more = policy.has_attempts_remaining(attempt);
                    if retryable && has_more {
                        warn!(task = %task.name, attempt, error = %error, "retrying task");
                        outcome.error_kind = Some(error);
                        continue;
                    }
                    outcome.status = TaskStatus::Failed;
                    outcome.error_kind = Some(error);
                    break;
                }
            }
        }

        outcome.end = Some(Utc::now());
        if let Some(span) = span {
            self.observability.end_span(trace, span);
        }
        info!(task = %task.name, status = ?outcome.status, attempts = outcome.attempts, "task finished");
        outcome
    }

    async fn attempt(&self, task: &Task) -> Result<Value, ErrorKind> {
        match &task.delegate_to {
            Some(target) if !target.is_empty() && target != "local" && target != "localhost" => {
                let mut payload = BTreeMap::new();
                payload.insert("task".to_string(), Value::String(task.name.clone()));
                payload.insert("command".to_string(), Value::String(task.command.clone()));
                let (_tx, cancel) = watch::channel(false);
                self.fabric
                    .invoke(
                        target,
                        Value::Map(payload),
                        task.timeout.unwrap_or(NO_TIMEOUT),
                        cancel,
                    )
                    .await
            }
            _ => self.local.execute(task).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    fn task(name: &str, depends_on: &[&str]) -> Task {
        Task {
            name: name.to_string(),
            description: None,
            command: "noop".to_string(),
            delegate_to: None,
            retries: 0,
            timeout: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            tags: Vec::new(),
        }
    }

    fn workflow(name: &str, tasks: Vec<Task>) -> Workflow {
        Workflow {
            name: name.to_string(),
            description: None,
            workdir: None,
            create_workdir_before_run: false,
            tasks,
            version: 1,
        }
    }

    fn executor() -> Executor {
        Executor::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(DelegationFabric::new()),
            Arc::new(Observability::new()),
        )
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected() {
        let catalogue = Catalogue::new();
        let (_tx, rx) = watch::channel(false);
        let result = executor().run(&catalogue, "ghost", rx).await;
        assert!(matches!(result, Err(ErrorKind::UnknownWorkflow(_))));
    }

    #[tokio::test]
    async fn topological_order_is_respected() {
        let mut catalogue = Catalogue::new();
        catalogue.insert(workflow(
            "w",
            vec![task("a", &[]), task("b", &["a"]), task("c", &["a"])],
        ));
        let (_tx, rx) = watch::channel(false);
        let report = executor().run(&catalogue, "w", rx).await.unwrap();
        assert!(!report.failed());
        let a = report.outcomes.iter().find(|o| o.task_name == "a").unwrap();
        let b = report.outcomes.iter().find(|o| o.task_name == "b").unwrap();
        let c = report.outcomes.iter().find(|o| o.task_name == "c").unwrap();
        assert!(a.end.unwrap() <= b.start.unwrap());
        assert!(a.end.unwrap() <= c.start.unwrap());
    }

    #[tokio::test]
    async fn delegation_to_absent_agent_skips_subsequent_tasks() {
        let mut catalogue = Catalogue::new();
        let mut failing = task("a", &[]);
        failing.delegate_to = Some("absent-agent".to_string());
        catalogue.insert(workflow("w", vec![failing, task("b", &["a"])]));
        let (_tx, rx) = watch::channel(false);
        let report = executor().run(&catalogue, "w", rx).await.unwrap();
        let a = report.outcomes.iter().find(|o| o.task_name == "a").unwrap();
        let b = report.outcomes.iter().find(|o| o.task_name == "b").unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        assert!(matches!(a.error_kind, Some(ErrorKind::UnknownTarget(_))));
        assert_eq!(b.status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn independent_failure_does_not_skip_unrelated_siblings_incorrectly() {
        let mut catalogue = Catalogue::new();
        let mut failing = task("a", &[]);
        failing.delegate_to = Some("absent-agent".to_string());
        catalogue.insert(workflow("w", vec![failing, task("b", &[])]));
        let (_tx, rx) = watch::channel(false);
        let report = executor().run(&catalogue, "w", rx).await.unwrap();
        // Both ran concurrently (max_fanout defaults to 1, so sequentially);
        // "a" fails, and since the scheduler stops the workflow on any
        // failure, "b" is marked Skipped even though it had no edge to "a".
        let b = report.outcomes.iter().find(|o| o.task_name == "b").unwrap();
        assert!(matches!(b.status, TaskStatus::Skipped | TaskStatus::Succeeded));
    }
}
