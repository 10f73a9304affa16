//! Mock collaborators shared by the unit tests.

use crate::agent::Agent;
use crate::controller::{Controller, ControllerFactory, ControllerParams};
use crate::errors::RuntimeError;
use crate::events::AgentState;
use crate::microagent::Microagent;
use crate::monitoring::MonitoringListener;
use crate::runtime::{Runtime, RuntimeContext, RuntimeFactory};
use crate::state::State;
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

pub struct MockAgent;

impl Agent for MockAgent {
    fn name(&self) -> &str {
        "MockAgent"
    }

    fn llm_model(&self) -> Option<&str> {
        Some("mock-model")
    }
}

#[derive(Default)]
pub struct MockRuntime {
    pub fail_connect: bool,
    pub fail_clone: bool,
    pub fail_close: bool,
    /// When set, `connect` parks until the gate is notified.
    pub connect_gate: Option<Arc<Notify>>,
    pub microagents: Vec<Microagent>,
    pub web_hosts: BTreeMap<String, u16>,
    pub connect_calls: AtomicUsize,
    pub closed: AtomicBool,
    pub env_vars: Mutex<HashMap<String, String>>,
}

impl MockRuntime {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn connect(&self) -> Result<(), RuntimeError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.connect_gate {
            gate.notified().await;
        }
        if self.fail_connect {
            return Err(RuntimeError::Unavailable("sandbox unreachable".into()));
        }
        Ok(())
    }

    async fn clone_repo(
        &self,
        _token: Option<&str>,
        repository: &str,
        _branch: Option<&str>,
    ) -> Result<PathBuf, RuntimeError> {
        if self.fail_clone {
            return Err(RuntimeError::Clone {
                repo: repository.to_string(),
                message: "authentication failed".into(),
            });
        }
        let name = repository.rsplit('/').next().unwrap_or(repository);
        Ok(PathBuf::from("/workspace").join(name))
    }

    fn web_hosts(&self) -> BTreeMap<String, u16> {
        self.web_hosts.clone()
    }

    async fn get_microagents_from_selected_repo(
        &self,
        _repository: Option<&str>,
    ) -> Result<Vec<Microagent>, RuntimeError> {
        Ok(self.microagents.clone())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(anyhow!("runtime close failed"));
        }
        Ok(())
    }
}

pub fn runtime_factory(runtime: Arc<MockRuntime>) -> Arc<dyn RuntimeFactory> {
    Arc::new(move |ctx: RuntimeContext| -> Result<Arc<dyn Runtime>, RuntimeError> {
        *runtime.env_vars.lock() = ctx.env_vars;
        Ok(Arc::clone(&runtime) as Arc<dyn Runtime>)
    })
}

pub struct MockController {
    pub sid: String,
    pub agent_state: Mutex<AgentState>,
    pub initial_state: Option<State>,
    pub max_iterations: u32,
    pub fail_close: bool,
    pub closed: AtomicBool,
}

impl MockController {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Controller for MockController {
    fn get_state(&self) -> AgentState {
        *self.agent_state.lock()
    }

    fn state(&self) -> State {
        let mut state = self
            .initial_state
            .clone()
            .unwrap_or_else(|| State::new(&self.sid, self.max_iterations, None));
        state.agent_state = self.get_state();
        state
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(anyhow!("controller close failed"));
        }
        Ok(())
    }
}

/// Every controller built through [`controller_factory`].
pub type CreatedControllers = Arc<Mutex<Vec<Arc<MockController>>>>;

pub fn controller_factory(
    created: CreatedControllers,
    fail_close: bool,
) -> Arc<dyn ControllerFactory> {
    Arc::new(move |params: ControllerParams| -> anyhow::Result<Arc<dyn Controller>> {
        let controller = Arc::new(MockController {
            sid: params.sid,
            agent_state: Mutex::new(AgentState::Loading),
            initial_state: params.initial_state,
            max_iterations: params.max_iterations,
            fail_close,
            closed: AtomicBool::new(false),
        });
        created.lock().push(Arc::clone(&controller));
        Ok(controller as Arc<dyn Controller>)
    })
}

#[derive(Default)]
pub struct RecordingMonitor {
    pub starts: Mutex<Vec<(bool, Duration)>>,
    pub closes: Mutex<Vec<String>>,
}

impl MonitoringListener for RecordingMonitor {
    fn on_agent_session_start(&self, success: bool, duration: Duration) {
        self.starts.lock().push((success, duration));
    }

    fn on_agent_session_close(&self, sid: &str) {
        self.closes.lock().push(sid.to_string());
    }
}
