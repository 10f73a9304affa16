//! Recall engine.
//!
//! [`Memory`] listens on the session event log for user messages and
//! explicit recall requests and answers them with a recall result event:
//! workspace context on the first user message, and the knowledge
//! microagents whose triggers appear in the text. The causing event is never
//! modified.

use crate::errors::{MicroagentError, RecallError};
use crate::event_log::{EventLog, panic_message, subscribers};
use crate::events::{
    Event, EventKind, EventSource, MicroagentKnowledge, RecallObservation, RecallQuery,
    RecallType,
};
use crate::microagent::{Microagent, MicroagentIndex};
use crate::status::{STATUS_ERROR_MEMORY, StatusSender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub repo_name: String,
    pub repo_directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub available_hosts: BTreeMap<String, u16>,
    pub additional_agent_instructions: String,
}

impl RuntimeInfo {
    fn is_empty(&self) -> bool {
        self.available_hosts.is_empty() && self.additional_agent_instructions.is_empty()
    }
}

struct MemoryState {
    index: Arc<MicroagentIndex>,
    first_user_message_seen: bool,
    repository_info: Option<RepositoryInfo>,
    runtime_info: Option<RuntimeInfo>,
}

pub struct Memory {
    event_log: Arc<EventLog>,
    disabled_microagents: Vec<String>,
    status: Option<StatusSender>,
    state: Mutex<MemoryState>,
}

impl Memory {
    /// Creates the engine and subscribes it to `event_log`.
    pub fn new(
        event_log: Arc<EventLog>,
        index: MicroagentIndex,
        disabled_microagents: Vec<String>,
        status: Option<StatusSender>,
    ) -> Arc<Self> {
        let memory = Arc::new(Self {
            event_log,
            disabled_microagents,
            status,
            state: Mutex::new(MemoryState {
                index: Arc::new(index),
                first_user_message_seen: false,
                repository_info: None,
                runtime_info: None,
            }),
        });

        let weak = Arc::downgrade(&memory);
        memory.event_log.subscribe(subscribers::MEMORY, move |event| {
            if let Some(memory) = weak.upgrade() {
                memory.handle_event(event);
            }
            Ok(())
        });
        memory
    }

    pub fn set_repository_info(
        &self,
        repo_name: impl Into<String>,
        repo_directory: impl Into<String>,
    ) {
        self.state.lock().repository_info = Some(RepositoryInfo {
            repo_name: repo_name.into(),
            repo_directory: repo_directory.into(),
        });
    }

    pub fn set_runtime_info(
        &self,
        available_hosts: BTreeMap<String, u16>,
        additional_agent_instructions: impl Into<String>,
    ) {
        self.state.lock().runtime_info = Some(RuntimeInfo {
            available_hosts,
            additional_agent_instructions: additional_agent_instructions.into(),
        });
    }

    /// Layers microagents found in the user's workspace over the current
    /// index. Workspace entries win over same-named global ones.
    pub fn load_user_workspace_microagents(
        &self,
        microagents: Vec<Microagent>,
    ) -> Result<(), MicroagentError> {
        let names: Vec<&str> = microagents.iter().map(|m| m.name.as_str()).collect();
        info!(microagents = ?names, "Loading user workspace microagents");
        let mut state = self.state.lock();
        let merged = state.index.merged(microagents, &self.disabled_microagents)?;
        state.index = Arc::new(merged);
        Ok(())
    }

    pub fn microagent_index(&self) -> Arc<MicroagentIndex> {
        Arc::clone(&self.state.lock().index)
    }

    pub fn repository_info(&self) -> Option<RepositoryInfo> {
        self.state.lock().repository_info.clone()
    }

    pub fn runtime_info(&self) -> Option<RuntimeInfo> {
        self.state.lock().runtime_info.clone()
    }

    pub fn first_user_message_seen(&self) -> bool {
        self.state.lock().first_user_message_seen
    }

    /// Subscriber entry point. Failures are logged and reported on the
    /// status channel; they never propagate into the event log.
    fn handle_event(&self, event: &Event) {
        let result = catch_unwind(AssertUnwindSafe(|| self.on_event(event)))
            .unwrap_or_else(|panic| Err(RecallError::Panicked(panic_message(panic.as_ref()))));
        if let Err(e) = result {
            error!(sid = %self.event_log.sid(), id = event.id, error = %e, "Recall failed");
            if let Some(status) = &self.status {
                status.error(STATUS_ERROR_MEMORY, format!("Error during recall: {}", e));
            }
        }
    }

    fn on_event(&self, event: &Event) -> Result<Option<Arc<Event>>, RecallError> {
        let observation = match &event.kind {
            EventKind::Message(message) if event.source == EventSource::User => {
                self.recall_for_user_message(event, &message.content)
            }
            EventKind::RecallRequest(request) => self.recall_for_request(&request.query),
            _ => return Ok(None),
        };

        let Some(observation) = observation else {
            return Ok(None);
        };
        debug!(
            id = event.id,
            recall_type = ?observation.recall_type,
            microagents = observation.microagent_knowledge.len(),
            "Publishing recall result"
        );
        // The state lock is released here: the append may deliver straight
        // back into this engine.
        let published = self.event_log.append_with_cause(
            EventSource::Environment,
            EventKind::RecallResult(observation),
            Some(event.id),
        )?;
        Ok(Some(published))
    }

    fn recall_for_user_message(&self, event: &Event, content: &str) -> Option<RecallObservation> {
        let mut state = self.state.lock();

        let first = !state.first_user_message_seen && self.is_first_user_message(event);
        let environment = if first {
            state.first_user_message_seen = true;
            environment_info(&state)
        } else {
            None
        };

        let matches = if content.trim().is_empty() {
            Vec::new()
        } else {
            state.index.match_knowledge(&[content])
        };
        for m in &matches {
            info!(name = %m.name, trigger = %m.trigger, "Microagent triggered by keyword");
        }

        combine(environment, matches)
    }

    fn recall_for_request(&self, query: &RecallQuery) -> Option<RecallObservation> {
        let fragments: Vec<&str> = query
            .fragments()
            .into_iter()
            .filter(|f| !f.trim().is_empty())
            .collect();
        if fragments.is_empty() {
            return None;
        }
        let matches = self.state.lock().index.match_knowledge(&fragments);
        for m in &matches {
            info!(name = %m.name, trigger = %m.trigger, "Microagent triggered by recall request");
        }
        combine(None, matches)
    }

    /// True when no user message older than `event` exists in the log.
    fn is_first_user_message(&self, event: &Event) -> bool {
        self.event_log
            .get_events(true)
            .filter(|e| e.user_message().is_some())
            .map(|e| e.id)
            .min()
            .is_none_or(|lowest| lowest >= event.id)
    }
}

fn environment_info(state: &MemoryState) -> Option<RecallObservation> {
    let repo_instructions = state.index.repo_instructions();
    let runtime = state.runtime_info.as_ref().filter(|r| !r.is_empty());
    if state.repository_info.is_none() && runtime.is_none() && repo_instructions.is_empty() {
        return None;
    }

    let (repo_name, repo_directory) = state
        .repository_info
        .as_ref()
        .map(|r| (r.repo_name.clone(), r.repo_directory.clone()))
        .unwrap_or_default();
    Some(RecallObservation {
        recall_type: RecallType::EnvironmentInfo,
        repo_name,
        repo_directory,
        repo_instructions: repo_instructions.to_string(),
        runtime_hosts: runtime.map(|r| r.available_hosts.clone()).unwrap_or_default(),
        additional_agent_instructions: runtime
            .map(|r| r.additional_agent_instructions.clone())
            .unwrap_or_default(),
        microagent_knowledge: Vec::new(),
    })
}

fn combine(
    environment: Option<RecallObservation>,
    matches: Vec<MicroagentKnowledge>,
) -> Option<RecallObservation> {
    match environment {
        Some(mut observation) => {
            observation.microagent_knowledge = matches;
            Some(observation)
        }
        None if !matches.is_empty() => Some(RecallObservation::knowledge(matches)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AgentState, RecallRequest};
    use crate::status::{StatusLevel, status_channel};

    fn tips() -> MicroagentIndex {
        MicroagentIndex::new(
            vec![
                Microagent::knowledge("py_tips", ["python"], "Use venv."),
                Microagent::knowledge("git_tips", ["git"], "Rebase often."),
            ],
            &[],
        )
        .unwrap()
    }

    fn recall_results(log: &EventLog) -> Vec<Arc<Event>> {
        log.get_events(false)
            .filter(|e| matches!(e.kind, EventKind::RecallResult(_)))
            .collect()
    }

    fn observation(event: &Event) -> &RecallObservation {
        match &event.kind {
            EventKind::RecallResult(obs) => obs,
            other => panic!("expected recall result, got {}", other.name()),
        }
    }

    fn recall_request(query: RecallQuery) -> EventKind {
        EventKind::RecallRequest(RecallRequest { query })
    }

    #[test]
    fn first_message_emits_environment_info_once() {
        let log = Arc::new(EventLog::new("s1"));
        let memory = Memory::new(Arc::clone(&log), tips(), vec![], None);
        memory.set_repository_info("org/repo", "/workspace/repo");

        let first = log.append(EventSource::User, EventKind::message("hello")).unwrap();
        assert_eq!(first.id, 0);
        log.append(EventSource::Agent, recall_request(RecallQuery::Text("python".into())))
            .unwrap();

        let results = recall_results(&log);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].cause, Some(0));
        assert_eq!(results[0].source, EventSource::Environment);
        let env = observation(&results[0]);
        assert_eq!(env.recall_type, RecallType::EnvironmentInfo);
        assert_eq!(env.repo_name, "org/repo");
        assert!(env.microagent_knowledge.is_empty());

        let knowledge = observation(&results[1]);
        assert_eq!(knowledge.recall_type, RecallType::KnowledgeMicroagent);
        assert_eq!(knowledge.microagent_knowledge[0].name, "py_tips");
        assert!(memory.first_user_message_seen());
    }

    #[test]
    fn result_follows_its_cause_in_the_log() {
        let log = Arc::new(EventLog::new("s1"));
        let _memory = Memory::new(Arc::clone(&log), tips(), vec![], None);
        log.append(EventSource::User, EventKind::message("python please")).unwrap();
        log.append(EventSource::Environment, EventKind::change_agent_state(AgentState::Running))
            .unwrap();

        let kinds: Vec<&'static str> = log.get_events(false).map(|e| e.kind_name()).collect();
        assert_eq!(kinds, vec!["message", "recall_result", "change_agent_state"]);
    }

    #[test]
    fn overlapping_triggers_land_in_one_knowledge_result() {
        let log = Arc::new(EventLog::new("s1"));
        let _memory = Memory::new(Arc::clone(&log), tips(), vec![], None);
        log.append(EventSource::User, EventKind::message("help me with python and git"))
            .unwrap();

        let results = recall_results(&log);
        assert_eq!(results.len(), 1);
        let obs = observation(&results[0]);
        assert_eq!(obs.recall_type, RecallType::KnowledgeMicroagent);
        let triples: Vec<(&str, &str)> = obs
            .microagent_knowledge
            .iter()
            .map(|k| (k.name.as_str(), k.trigger.as_str()))
            .collect();
        assert_eq!(triples, vec![("git_tips", "git"), ("py_tips", "python")]);
    }

    #[test]
    fn first_message_merges_environment_and_knowledge() {
        let log = Arc::new(EventLog::new("s1"));
        let memory = Memory::new(Arc::clone(&log), tips(), vec![], None);
        memory.set_runtime_info(
            BTreeMap::from([("http://localhost:12000".to_string(), 12000)]),
            "",
        );

        log.append(EventSource::User, EventKind::message("help me with python and git"))
            .unwrap();

        let results = recall_results(&log);
        assert_eq!(results.len(), 1);
        let obs = observation(&results[0]);
        assert_eq!(obs.recall_type, RecallType::EnvironmentInfo);
        assert_eq!(obs.runtime_hosts.get("http://localhost:12000"), Some(&12000));
        assert_eq!(obs.microagent_knowledge.len(), 2);
    }

    #[test]
    fn nothing_to_recall_publishes_nothing() {
        let log = Arc::new(EventLog::new("s1"));
        let memory = Memory::new(Arc::clone(&log), tips(), vec![], None);
        log.append(EventSource::User, EventKind::message("what time is it?")).unwrap();
        log.append(EventSource::Agent, recall_request(RecallQuery::Keywords(vec![])))
            .unwrap();
        assert_eq!(log.len(), 2);
        // The flag is spent even though there was no context to send.
        assert!(memory.first_user_message_seen());
    }

    #[test]
    fn agent_messages_are_ignored() {
        let log = Arc::new(EventLog::new("s1"));
        let _memory = Memory::new(Arc::clone(&log), tips(), vec![], None);
        log.append(EventSource::Agent, EventKind::message("python")).unwrap();
        assert!(recall_results(&log).is_empty());
    }

    #[test]
    fn first_user_message_need_not_have_id_zero() {
        let log = Arc::new(EventLog::new("s1"));
        let memory = Memory::new(Arc::clone(&log), MicroagentIndex::empty(), vec![], None);
        memory.set_repository_info("org/repo", "/workspace/repo");

        log.append(EventSource::Environment, EventKind::change_agent_state(AgentState::Loading))
            .unwrap();
        let user = log.append(EventSource::User, EventKind::message("hi")).unwrap();
        assert_eq!(user.id, 1);

        let results = recall_results(&log);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cause, Some(1));
        assert_eq!(observation(&results[0]).recall_type, RecallType::EnvironmentInfo);
    }

    #[test]
    fn resumed_log_does_not_repeat_environment_info() {
        let log = Arc::new(EventLog::new("s1"));
        log.append(EventSource::User, EventKind::message("earlier turn")).unwrap();

        let memory = Memory::new(Arc::clone(&log), MicroagentIndex::empty(), vec![], None);
        memory.set_repository_info("org/repo", "/workspace/repo");
        log.append(EventSource::User, EventKind::message("new turn")).unwrap();

        assert!(recall_results(&log).is_empty());
        assert!(!memory.first_user_message_seen());
    }

    #[test]
    fn repository_microagent_content_is_environment_context() {
        let log = Arc::new(EventLog::new("s1"));
        let index =
            MicroagentIndex::new(vec![Microagent::repository("repo", "Run cargo test.")], &[])
                .unwrap();
        let _memory = Memory::new(Arc::clone(&log), index, vec![], None);
        log.append(EventSource::User, EventKind::message("hi")).unwrap();

        let results = recall_results(&log);
        assert_eq!(results.len(), 1);
        assert_eq!(observation(&results[0]).repo_instructions, "Run cargo test.");
    }

    #[test]
    fn workspace_microagents_override_and_respect_disabled() {
        let log = Arc::new(EventLog::new("s1"));
        let memory = Memory::new(Arc::clone(&log), tips(), vec!["docker_tips".to_string()], None);
        memory
            .load_user_workspace_microagents(vec![
                Microagent::knowledge("py_tips", ["python"], "Use uv."),
                Microagent::knowledge("docker_tips", ["docker"], "Never shown."),
            ])
            .unwrap();

        log.append(EventSource::User, EventKind::message("python in docker")).unwrap();
        let results = recall_results(&log);
        let obs = observation(&results[0]);
        assert_eq!(obs.microagent_knowledge.len(), 1);
        assert_eq!(obs.microagent_knowledge[0].content, "Use uv.");
    }

    #[test]
    fn keyword_recall_request() {
        let log = Arc::new(EventLog::new("s1"));
        let _memory = Memory::new(Arc::clone(&log), tips(), vec![], None);
        let request = log
            .append(
                EventSource::Agent,
                recall_request(RecallQuery::Keywords(vec!["GIT".into(), "rust".into()])),
            )
            .unwrap();

        let results = recall_results(&log);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cause, Some(request.id));
        assert_eq!(observation(&results[0]).microagent_knowledge[0].name, "git_tips");
    }

    #[test]
    fn failures_are_reported_on_status_channel() {
        let log = Arc::new(EventLog::new("s1"));
        let (tx, mut rx) = status_channel();
        let memory = Memory::new(Arc::clone(&log), tips(), vec![], Some(tx));
        let event = log.append(EventSource::User, EventKind::message("hello")).unwrap();
        log.close();

        let trigger = Event {
            id: event.id + 1,
            source: EventSource::User,
            timestamp: event.timestamp,
            cause: None,
            kind: EventKind::message("python"),
        };
        memory.handle_event(&trigger);

        let status = rx.try_recv().unwrap();
        assert_eq!(status.level, StatusLevel::Error);
        assert_eq!(status.id, STATUS_ERROR_MEMORY);
    }
}
