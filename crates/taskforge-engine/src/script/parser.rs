//! The workflow parser: evaluates a script once and collects every
//! `workflow(spec)` call it makes into an immutable [`Catalogue`].

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mlua::Lua;

use crate::delegation::DelegationFabric;
use crate::engine::{Catalogue, Workflow};
use crate::error::ErrorKind;
use crate::observability::Observability;
use crate::persistence::Store;
use crate::value::Value;

use super::registry;

fn lua_to_engine_err(error: mlua::Error) -> ErrorKind {
    ErrorKind::Malformed(error.to_string())
}

/// Builds a fresh Lua environment per parse, wires it to the engine's
/// shared collaborators, evaluates the script once, and converts every
/// `workflow(spec)` call it accumulated into the catalogue.
pub struct WorkflowParser {
    store: Arc<dyn Store>,
    fabric: Arc<DelegationFabric>,
    observability: Arc<Observability>,
    default_timeout: Option<Duration>,
}

impl WorkflowParser {
    pub fn new(
        store: Arc<dyn Store>,
        fabric: Arc<DelegationFabric>,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            store,
            fabric,
            observability,
            default_timeout: None,
        }
    }

    /// Applied to any task that declares no `timeout` of its own, e.g. from
    /// `TASKFORGE_TIMEOUT_SECS`.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Parses `source`, binding `overrides` under the `values` global, and
    /// returns the catalogue of workflows it declared. Rejects a script
    /// that declares the same workflow name twice.
    pub async fn parse(
        &self,
        source: &str,
        overrides: HashMap<String, Value>,
    ) -> Result<Catalogue, ErrorKind> {
        let lua = Lua::new();
        let specs = Rc::new(RefCell::new(Vec::new()));

        registry::register_workflow_fn(&lua, specs.clone()).map_err(lua_to_engine_err)?;
        registry::register_values(&lua, &overrides).map_err(lua_to_engine_err)?;
        registry::register_state(&lua, self.store.clone()).map_err(lua_to_engine_err)?;
        registry::register_delegate_to(&lua, self.fabric.clone()).map_err(lua_to_engine_err)?;
        registry::register_observability(&lua, self.observability.clone())
            .map_err(lua_to_engine_err)?;

        lua.load(source)
            .exec_async()
            .await
            .map_err(lua_to_engine_err)?;

        let mut catalogue = Catalogue::new();
        let mut seen = HashSet::new();
        for spec in specs.borrow().iter() {
            let mut workflow = Workflow::from_value(spec)?;
            if let Some(default_timeout) = self.default_timeout {
                for task in &mut workflow.tasks {
                    task.timeout.get_or_insert(default_timeout);
                }
            }
            if !seen.insert(workflow.name.clone()) {
                return Err(ErrorKind::DuplicateName(format!(
                    "workflow '{}' declared twice in one script",
                    workflow.name
                )));
            }
            catalogue.insert(workflow);
        }
        Ok(catalogue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    fn parser() -> WorkflowParser {
        WorkflowParser::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(DelegationFabric::new()),
            Arc::new(Observability::new()),
        )
    }

    #[tokio::test]
    async fn parses_single_workflow() {
        let source = r#"
            workflow({
                name = "deploy",
                tasks = {
                    { name = "build", command = "cargo build" },
                    { name = "ship", command = "cargo publish", depends_on = { "build" } },
                },
            })
        "#;
        let catalogue = parser().parse(source, HashMap::new()).await.unwrap();
        assert_eq!(catalogue.len(), 1);
        let workflow = catalogue.get("deploy").unwrap();
        assert_eq!(workflow.tasks.len(), 2);
    }

    #[tokio::test]
    async fn rejects_duplicate_workflow_names_in_one_script() {
        let source = r#"
            workflow({ name = "w", tasks = { { name = "a", command = "x" } } })
            workflow({ name = "w", tasks = { { name = "b", command = "y" } } })
        "#;
        let result = parser().parse(source, HashMap::new()).await;
        assert!(matches!(result, Err(ErrorKind::DuplicateName(_))));
    }

    #[tokio::test]
    async fn values_overrides_are_readable_from_script() {
        let mut overrides = HashMap::new();
        overrides.insert("env".to_string(), Value::from("staging"));
        let source = r#"
            workflow({
                name = "w",
                tasks = { { name = "a", command = "deploy to " .. values.env } },
            })
        "#;
        let catalogue = parser().parse(source, overrides).await.unwrap();
        let task = &catalogue.get("w").unwrap().tasks[0];
        assert_eq!(task.command, "deploy to staging");
    }

    #[tokio::test]
    async fn state_bindings_round_trip_through_script() {
        let source = r#"
            state.set("counter", 1)
            state.increment("counter", 4)
            workflow({
                name = "w",
                tasks = { { name = "a", command = "noop" } },
            })
        "#;
        let parser = parser();
        parser.parse(source, HashMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_script_surfaces_as_malformed() {
        let result = parser().parse("this is not lua (((", HashMap::new()).await;
        assert!(matches!(result, Err(ErrorKind::Malformed(_))));
    }
}
