//! Controller state persisted across processes, keyed by session id.

use crate::errors::SessionError;
use crate::events::AgentState;
use crate::storage::{self, FileStore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub session_id: String,
    pub agent_state: AgentState,
    #[serde(default)]
    pub iteration: u32,
    pub max_iterations: u32,
    #[serde(default)]
    pub budget_spent: f64,
    #[serde(default)]
    pub max_budget_per_task: Option<f64>,
    /// Id of the first event this controller run is responsible for.
    #[serde(default)]
    pub start_id: u64,
    /// Controller-specific data, opaque to the session.
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl State {
    pub fn new(
        session_id: impl Into<String>,
        max_iterations: u32,
        max_budget_per_task: Option<f64>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_state: AgentState::Loading,
            iteration: 0,
            max_iterations,
            budget_spent: 0.0,
            max_budget_per_task,
            start_id: 0,
            extra: serde_json::Value::Null,
        }
    }

    pub fn save_to_session(
        &self,
        sid: &str,
        file_store: &dyn FileStore,
    ) -> Result<(), SessionError> {
        let json = serde_json::to_string(self).map_err(crate::errors::StorageError::from)?;
        file_store.write(&storage::agent_state_path(sid), &json)?;
        Ok(())
    }

    /// Reads back the state saved for `sid`.
    ///
    /// Missing or undecodable state is reported as [`SessionError::RestoreFailed`].
    pub fn restore_from_session(
        sid: &str,
        file_store: &dyn FileStore,
    ) -> Result<Self, SessionError> {
        let raw = file_store
            .read(&storage::agent_state_path(sid))
            .map_err(|e| SessionError::RestoreFailed(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| SessionError::RestoreFailed(e.to_string()))
    }
}
