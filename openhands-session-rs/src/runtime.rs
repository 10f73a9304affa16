use crate::errors::RuntimeError;
use crate::event_log::EventLog;
use crate::microagent::Microagent;
use crate::status::StatusSender;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

pub mod local;
pub use local::{LocalRuntime, LocalRuntimeFactory};

/// Defines the sandboxed environment where the agent's actions execute.
///
/// The session only manages the runtime's lifecycle and reads workspace
/// context from it; executing actions is between the runtime and the
/// controller.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Connects to (or boots) the sandbox. May wait on external systems for
    /// an unbounded time.
    ///
    /// # Errors
    /// [`RuntimeError::Unavailable`] when the sandbox cannot be reached.
    async fn connect(&self) -> Result<(), RuntimeError>;

    /// Clones `repository` into the workspace and returns the checkout path.
    async fn clone_repo(
        &self,
        token: Option<&str>,
        repository: &str,
        branch: Option<&str>,
    ) -> Result<PathBuf, RuntimeError>;

    /// Hosts reachable from inside the sandbox, mapped to their ports.
    fn web_hosts(&self) -> BTreeMap<String, u16> {
        BTreeMap::new()
    }

    fn additional_agent_instructions(&self) -> String {
        String::new()
    }

    /// Microagents shipped with the selected repository (or the bare
    /// workspace when none is selected).
    async fn get_microagents_from_selected_repo(
        &self,
        repository: Option<&str>,
    ) -> Result<Vec<Microagent>, RuntimeError>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// What a runtime is built from.
pub struct RuntimeContext {
    pub sid: String,
    pub event_log: Arc<EventLog>,
    pub env_vars: HashMap<String, String>,
    pub plugins: Vec<String>,
    pub status: StatusSender,
}

pub trait RuntimeFactory: Send + Sync {
    fn create(&self, ctx: RuntimeContext) -> Result<Arc<dyn Runtime>, RuntimeError>;
}

impl<F> RuntimeFactory for F
where
    F: Fn(RuntimeContext) -> Result<Arc<dyn Runtime>, RuntimeError> + Send + Sync,
{
    fn create(&self, ctx: RuntimeContext) -> Result<Arc<dyn Runtime>, RuntimeError> {
        self(ctx)
    }
}
