// taskforge CLI
//
// Design Decision: clap derive for argument parsing.
// Design Decision: text/json output only (no yaml).
// Design Decision: anyhow at this boundary, thiserror everywhere below it.

mod output;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use taskforge_engine::delegation::DelegationFabric;
use taskforge_engine::observability::Observability;
use taskforge_engine::persistence::{SqliteStore, Store};
use taskforge_engine::script::WorkflowParser;
use taskforge_engine::value::Value;

/// Runs a single workflow declared by a script against the persistent
/// store, printing a structured outcome summary.
#[derive(Parser)]
#[command(name = "taskforge")]
#[command(about = "Run a scripted workflow")]
#[command(version)]
struct Cli {
    /// Path to the workflow script
    script: PathBuf,

    /// Workflow to run, by name
    #[arg(long, short)]
    workflow: String,

    /// Override a `values` entry (key=value); may be repeated
    #[arg(long = "set", value_parser = parse_key_val)]
    set: Vec<(String, String)>,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    output: String,

    /// Storage directory override
    #[arg(long, env = "TASKFORGE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Default delegation agent target (reserved: no transport is bundled
    /// by this binary; set for embedding applications that register one)
    #[arg(long, env = "TASKFORGE_DEFAULT_AGENT")]
    default_agent: Option<String>,

    /// Global per-task timeout in seconds, applied to tasks that declare
    /// none of their own
    #[arg(long, env = "TASKFORGE_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    Ok((key.to_string(), value.to_string()))
}

/// Documented CLI exit codes, per the core's "exit 0 on clean completion;
/// non-zero with documented kinds on failure" contract.
mod exit_code {
    // Success is the implicit `Ok(())` return from `main`; documented here
    // for completeness of the exit-code contract.
    #[allow(dead_code)]
    pub const SUCCESS: i32 = 0;
    pub const WORKFLOW_FAILED: i32 = 1;
    pub const SCRIPT_ERROR: i32 = 2;
    pub const USAGE_ERROR: i32 = 3;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let output_format = output::OutputFormat::from_str(&cli.output);

    let script_source = match std::fs::read_to_string(&cli.script) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("failed to read script {}: {error}", cli.script.display());
            std::process::exit(exit_code::USAGE_ERROR);
        }
    };

    let state_path = match &cli.state_dir {
        Some(dir) => dir.join("state.db"),
        None => match SqliteStore::default_path("taskforge") {
            Ok(path) => path,
            Err(error) => {
                eprintln!("failed to resolve default state directory: {error}");
                std::process::exit(exit_code::USAGE_ERROR);
            }
        },
    };

    let store: Arc<dyn Store> = match SqliteStore::open(&state_path, true).await {
        Ok(store) => Arc::new(store),
        Err(error) => {
            eprintln!("failed to open state store at {}: {error}", state_path.display());
            std::process::exit(exit_code::USAGE_ERROR);
        }
    };

    let fabric = Arc::new(DelegationFabric::new());
    if let Some(agent) = &cli.default_agent {
        tracing::info!(agent, "default delegation agent configured, but no transport is bundled by this binary");
    }
    let observability = Arc::new(Observability::new());

    let overrides: HashMap<String, Value> = cli
        .set
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();

    let parser = WorkflowParser::new(store.clone(), fabric.clone(), observability.clone())
        .with_default_timeout(cli.timeout_secs.map(Duration::from_secs));

    let catalogue = match parser.parse(&script_source, overrides).await {
        Ok(catalogue) => catalogue,
        Err(error) => {
            eprintln!("failed to parse script: {error}");
            std::process::exit(exit_code::SCRIPT_ERROR);
        }
    };

    let executor = taskforge_engine::engine::Executor::new(store, fabric, observability);
    let (_tx, cancel) = tokio::sync::watch::channel(false);

    let report = match executor.run(&catalogue, &cli.workflow, cancel).await {
        Ok(report) => report,
        Err(error) => {
            eprintln!("failed to run workflow '{}': {error}", cli.workflow);
            std::process::exit(exit_code::SCRIPT_ERROR);
        }
    };

    output::print_report(&report, output_format);

    if report.failed() {
        std::process::exit(exit_code::WORKFLOW_FAILED);
    }
    Ok(())
}
