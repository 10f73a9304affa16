use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    User,
    Agent,
    Environment,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::Environment => write!(f, "environment"),
        }
    }
}

/// State of the agent loop as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Loading,
    Init,
    Running,
    AwaitingUserInput,
    Paused,
    Stopped,
    Finished,
    Rejected,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Init => "init",
            Self::Running => "running",
            Self::AwaitingUserInput => "awaiting_user_input",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Finished => "finished",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }

    /// States the agent loop never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Finished | Self::Rejected | Self::Error
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry of the session event log.
///
/// `id`, `timestamp` and `cause` are assigned by the log at append time and
/// never change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
    /// Id of the event this one responds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<u64>,
    pub kind: EventKind,
}

impl Event {
    /// A message typed by the user.
    pub fn user_message(&self) -> Option<&MessageEvent> {
        match (&self.kind, self.source) {
            (EventKind::Message(m), EventSource::User) => Some(m),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Message(MessageEvent),
    RecallRequest(RecallRequest),
    RecallResult(RecallObservation),
    ChangeAgentState(ChangeAgentStateEvent),
    AgentStateChanged(AgentStateChangedEvent),
    Action(ActionEvent),
    Observation(ObservationEvent),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::RecallRequest(_) => "recall_request",
            Self::RecallResult(_) => "recall_result",
            Self::ChangeAgentState(_) => "change_agent_state",
            Self::AgentStateChanged(_) => "agent_state_changed",
            Self::Action(_) => "action",
            Self::Observation(_) => "observation",
        }
    }

    pub fn message(content: impl Into<String>) -> Self {
        Self::Message(MessageEvent {
            content: content.into(),
        })
    }

    pub fn change_agent_state(agent_state: AgentState) -> Self {
        Self::ChangeAgentState(ChangeAgentStateEvent {
            agent_state,
            thought: String::new(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub content: String,
}

/// Explicit request to look up knowledge for a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallRequest {
    pub query: RecallQuery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallQuery {
    Text(String),
    Keywords(Vec<String>),
}

impl RecallQuery {
    /// Text fragments matched independently against microagent triggers.
    pub fn fragments(&self) -> Vec<&str> {
        match self {
            Self::Text(text) => vec![text.as_str()],
            Self::Keywords(keywords) => keywords.iter().map(String::as_str).collect(),
        }
    }
}

/// Notifies the controller that the agent should move to a new state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeAgentStateEvent {
    pub agent_state: AgentState,
    #[serde(default)]
    pub thought: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateChangedEvent {
    pub agent_state: AgentState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEvent {
    pub tool_name: String,
    pub tool_call_id: String,
    pub arguments: serde_json::Value,
    pub thought: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationEvent {
    pub tool_name: String,
    pub tool_call_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallType {
    /// Repository instructions, runtime hosts and similar workspace context.
    EnvironmentInfo,
    /// Knowledge microagents triggered by keywords.
    KnowledgeMicroagent,
}

/// One triggered knowledge microagent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroagentKnowledge {
    pub name: String,
    pub trigger: String,
    pub content: String,
}

/// Context recalled in response to a user message or recall request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallObservation {
    pub recall_type: RecallType,
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub repo_directory: String,
    #[serde(default)]
    pub repo_instructions: String,
    #[serde(default)]
    pub runtime_hosts: BTreeMap<String, u16>,
    #[serde(default)]
    pub additional_agent_instructions: String,
    #[serde(default)]
    pub microagent_knowledge: Vec<MicroagentKnowledge>,
}

impl RecallObservation {
    pub fn knowledge(microagent_knowledge: Vec<MicroagentKnowledge>) -> Self {
        Self {
            recall_type: RecallType::KnowledgeMicroagent,
            repo_name: String::new(),
            repo_directory: String::new(),
            repo_instructions: String::new(),
            runtime_hosts: BTreeMap::new(),
            additional_agent_instructions: String::new(),
            microagent_knowledge,
        }
    }
}

impl fmt::Display for RecallObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let instructions: String = self.repo_instructions.chars().take(20).collect();
        let names: Vec<&str> = self
            .microagent_knowledge
            .iter()
            .map(|k| k.name.as_str())
            .collect();
        write!(
            f,
            "Recalled: recall_type={:?}, repo_name={}, repo_instructions={}..., \
             runtime_hosts={:?}, microagents={:?}",
            self.recall_type, self.repo_name, instructions, self.runtime_hosts, names
        )
    }
}
