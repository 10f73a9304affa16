use crate::agent::Agent;
use crate::event_log::EventLog;
use crate::events::AgentState;
use crate::state::State;
use crate::status::StatusSender;
use async_trait::async_trait;
use std::sync::Arc;

/// Everything a controller is built from.
pub struct ControllerParams {
    pub sid: String,
    pub event_log: Arc<EventLog>,
    pub agent: Arc<dyn Agent>,
    pub max_iterations: u32,
    pub max_budget_per_task: Option<f64>,
    pub confirmation_mode: bool,
    /// State saved by a previous run of this session, if it could be read.
    pub initial_state: Option<State>,
    pub status: StatusSender,
}

/// The agent loop driving a session, consuming the event log.
#[async_trait]
pub trait Controller: Send + Sync {
    fn get_state(&self) -> AgentState;

    /// Snapshot persisted when the session closes.
    fn state(&self) -> State;

    async fn close(&self) -> anyhow::Result<()>;
}

pub trait ControllerFactory: Send + Sync {
    fn create(&self, params: ControllerParams) -> anyhow::Result<Arc<dyn Controller>>;
}

impl<F> ControllerFactory for F
where
    F: Fn(ControllerParams) -> anyhow::Result<Arc<dyn Controller>> + Send + Sync,
{
    fn create(&self, params: ControllerParams) -> anyhow::Result<Arc<dyn Controller>> {
        self(params)
    }
}
