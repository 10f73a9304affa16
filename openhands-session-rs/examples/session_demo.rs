use anyhow::Result;
use async_trait::async_trait;
use openhands_session_rs::{
    AgentSession, StartRequest,
    agent::Agent,
    config::SessionConfig,
    controller::{Controller, ControllerFactory, ControllerParams},
    event_log::{EventLog, subscribers},
    events::{AgentState, EventKind, EventSource},
    microagent::{Microagent, MicroagentIndex},
    runtime::{LocalRuntimeFactory, RuntimeFactory},
    session::generate_sid,
    state::State,
    storage::{FileStore, LocalFileStore},
};
use parking_lot::Mutex;
use secrecy::SecretString;
use std::sync::Arc;

struct DemoAgent;

impl Agent for DemoAgent {
    fn name(&self) -> &str {
        "DemoAgent"
    }
}

/// Answers every user message with a canned reply.
struct EchoController {
    state: Arc<Mutex<State>>,
    event_log: Arc<EventLog>,
}

impl EchoController {
    fn attach(params: ControllerParams) -> Arc<Self> {
        let state = params
            .initial_state
            .unwrap_or_else(|| {
                State::new(&params.sid, params.max_iterations, params.max_budget_per_task)
            });
        let state = Arc::new(Mutex::new(state));

        let shared = Arc::clone(&state);
        let log = Arc::downgrade(&params.event_log);
        params.event_log.subscribe(subscribers::AGENT_CONTROLLER, move |event| {
            match &event.kind {
                EventKind::ChangeAgentState(change) => {
                    shared.lock().agent_state = change.agent_state
                }
                EventKind::Message(message) if event.source == EventSource::User => {
                    shared.lock().iteration += 1;
                    if let Some(log) = log.upgrade() {
                        let reply = format!("You said: {}", message.content);
                        log.append(EventSource::Agent, EventKind::message(reply))?;
                    }
                }
                EventKind::RecallResult(recall) => println!("[recall] {}", recall),
                _ => {}
            }
            Ok(())
        });

        Arc::new(Self {
            state,
            event_log: params.event_log,
        })
    }
}

#[async_trait]
impl Controller for EchoController {
    fn get_state(&self) -> AgentState {
        self.state.lock().agent_state
    }

    fn state(&self) -> State {
        self.state.lock().clone()
    }

    async fn close(&self) -> Result<()> {
        self.event_log.unsubscribe(subscribers::AGENT_CONTROLLER);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    openhands_session_rs::logger::init_logging();

    let root = std::env::temp_dir().join("openhands-session-demo");
    let file_store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(root.join("store"))?);
    let sid = std::env::var("SESSION_ID").unwrap_or_else(|_| generate_sid());
    println!("Session: {}", sid);

    let session = AgentSession::new(&sid, file_store, SessionConfig::from_env())?;
    let mut status = session
        .take_status_receiver()
        .expect("fresh session owns its status receiver");
    tokio::spawn(async move {
        while let Some(message) = status.recv().await {
            println!("[status] {:?} {} {}", message.level, message.id, message.message);
        }
    });

    let microagents = MicroagentIndex::new(
        [Microagent::knowledge(
            "rust_tips",
            ["rust", "cargo"],
            "Prefer `cargo nextest` for large test suites.",
        )],
        &[],
    )?;

    let runtime_factory: Arc<dyn RuntimeFactory> =
        Arc::new(LocalRuntimeFactory::new(root.join("workspaces")));
    let controller_factory: Arc<dyn ControllerFactory> =
        Arc::new(|params: ControllerParams| -> Result<Arc<dyn Controller>> {
            Ok(EchoController::attach(params) as Arc<dyn Controller>)
        });

    let mut request = StartRequest::new(runtime_factory, controller_factory, Arc::new(DemoAgent))
        .with_microagents(microagents)
        .with_initial_message("How do I speed up my rust tests?");
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        request = request.with_github_token(SecretString::from(token));
    }
    if let Ok(repository) = std::env::var("SELECTED_REPOSITORY") {
        request = request.with_repository(repository, std::env::var("SELECTED_BRANCH").ok());
    }

    let report = session.start(request).await?;
    println!("Started: success={} in {:?}", report.success, report.elapsed);
    if let Some(error) = &report.error {
        println!("Start error: {}", error);
    }

    for event in session.event_log().get_events(false) {
        println!("#{} {:?} {}", event.id, event.source, event.kind_name());
    }
    println!("Agent state: {:?}", session.get_state());

    session.close().await?;
    println!("Session closed");
    Ok(())
}
