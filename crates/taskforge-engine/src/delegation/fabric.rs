//! The delegation fabric implementation.
//!
//! Routes through a single `AgentClient` trait object per target so a real
//! transport (gRPC, SSH, local exec) can be plugged in without the fabric
//! itself changing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::ErrorKind;
use crate::value::Value;

/// Errors an [`AgentClient`] surfaces, before the fabric maps them into the
/// crate-wide [`ErrorKind`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Unreachable(String),

    #[error("remote execution failed: {0}")]
    RemoteFailed(String),
}

impl From<AgentError> for ErrorKind {
    fn from(error: AgentError) -> Self {
        match error {
            AgentError::Unreachable(detail) => ErrorKind::Unreachable(detail),
            AgentError::RemoteFailed(detail) => ErrorKind::RemoteFailed(detail),
        }
    }
}

/// A cooperative cancellation signal.
pub type CancelToken = watch::Receiver<bool>;

pub fn cancel_pair() -> (watch::Sender<bool>, CancelToken) {
    watch::channel(false)
}

/// A dispatch target: either the in-process local hook or a registered
/// remote agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn dispatch(
        &self,
        payload: Value,
        deadline: Duration,
        cancel: CancelToken,
    ) -> Result<Value, AgentError>;
}

fn is_local_identifier(target: &str) -> bool {
    matches!(target, "" | "local" | "localhost")
}

/// Routes a payload to a named target, applying a deadline and propagating
/// cancellation.
pub struct DelegationFabric {
    local: RwLock<Option<Arc<dyn AgentClient>>>,
    agents: RwLock<HashMap<String, Arc<dyn AgentClient>>>,
}

impl Default for DelegationFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl DelegationFabric {
    pub fn new() -> Self {
        Self {
            local: RwLock::new(None),
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the in-process handler used for `""`, `"local"`, and
    /// `"localhost"` targets.
    pub fn register_local(&self, client: Arc<dyn AgentClient>) {
        *self.local.write() = Some(client);
    }

    /// Registers a named remote agent. Re-registering the same identifier
    /// replaces the previous client.
    pub fn register_agent(&self, id: impl Into<String>, client: Arc<dyn AgentClient>) {
        self.agents.write().insert(id.into(), client);
    }

    pub fn unregister_agent(&self, id: &str) {
        self.agents.write().remove(id);
    }

    /// Dispatches `payload` to `target`, honouring `deadline` and `cancel`.
    #[tracing::instrument(skip(self, payload, cancel))]
    pub async fn invoke(
        &self,
        target: &str,
        payload: Value,
        deadline: Duration,
        cancel: CancelToken,
    ) -> Result<Value, ErrorKind> {
        let client = if is_local_identifier(target) {
            self.local
                .read()
                .clone()
                .ok_or_else(|| ErrorKind::UnknownTarget("local".to_string()))?
        } else {
            self.agents
                .read()
                .get(target)
                .cloned()
                .ok_or_else(|| ErrorKind::UnknownTarget(target.to_string()))?
        };

        let mut cancel_watch = cancel.clone();
        tokio::select! {
            result = client.dispatch(payload, deadline, cancel) => {
                result.map_err(ErrorKind::from)
            }
            _ = tokio::time::sleep(deadline) => {
                Err(ErrorKind::DeadlineExceeded)
            }
            _ = cancel_watch.changed() => {
                Err(ErrorKind::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoClient;

    #[async_trait]
    impl AgentClient for EchoClient {
        async fn dispatch(
            &self,
            payload: Value,
            _deadline: Duration,
            _cancel: CancelToken,
        ) -> Result<Value, AgentError> {
            Ok(payload)
        }
    }

    struct SlowClient;

    #[async_trait]
    impl AgentClient for SlowClient {
        async fn dispatch(
            &self,
            _payload: Value,
            _deadline: Duration,
            _cancel: CancelToken,
        ) -> Result<Value, AgentError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Nil)
        }
    }

    #[tokio::test]
    async fn unknown_target_is_rejected() {
        let fabric = DelegationFabric::new();
        let (_tx, rx) = cancel_pair();
        let result = fabric
            .invoke("absent-agent", Value::Nil, Duration::from_secs(1), rx)
            .await;
        assert!(matches!(result, Err(ErrorKind::UnknownTarget(_))));
    }

    #[tokio::test]
    async fn local_synonyms_route_to_local_handler() {
        let fabric = DelegationFabric::new();
        fabric.register_local(Arc::new(EchoClient));
        let (_tx, rx) = cancel_pair();
        for target in ["", "local", "localhost"] {
            let result = fabric
                .invoke(target, Value::from("x"), Duration::from_secs(1), rx.clone())
                .await
                .unwrap();
            assert_eq!(result, Value::from("x"));
        }
    }

    #[tokio::test]
    async fn deadline_elapses_to_deadline_exceeded() {
        let fabric = DelegationFabric::new();
        fabric.register_agent("slow", Arc::new(SlowClient));
        let (_tx, rx) = cancel_pair();
        let result = fabric
            .invoke("slow", Value::Nil, Duration::from_millis(20), rx)
            .await;
        assert!(matches!(result, Err(ErrorKind::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_dispatch() {
        let fabric = DelegationFabric::new();
        fabric.register_agent("slow", Arc::new(SlowClient));
        let (tx, rx) = cancel_pair();
        let invoke = fabric.invoke("slow", Value::Nil, Duration::from_secs(5), rx);
        tokio::pin!(invoke);
        tx.send(true).unwrap();
        let result = invoke.await;
        assert!(matches!(result, Err(ErrorKind::Cancelled)));
    }
}
