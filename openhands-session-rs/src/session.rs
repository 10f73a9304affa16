//! Agent session lifecycle.
//!
//! An [`AgentSession`] owns one event log and, once started, one runtime,
//! one controller and optionally one security analyzer. `start` builds them
//! in dependency order; `close` tears them down in reverse, waiting a bounded
//! time for an in-flight `start` first.

use crate::agent::Agent;
use crate::config::SessionConfig;
use crate::controller::{Controller, ControllerFactory, ControllerParams};
use crate::errors::{RuntimeError, SessionError};
use crate::event_log::EventLog;
use crate::events::{AgentState, EventKind, EventSource};
use crate::memory::Memory;
use crate::microagent::MicroagentIndex;
use crate::monitoring::{MonitoringListener, TracingMonitoringListener};
use crate::runtime::{Runtime, RuntimeContext, RuntimeFactory};
use crate::security::{
    SecurityAnalyzer, SecurityAnalyzerFactory, SecurityAnalyzerRegistry,
};
use crate::state::State;
use crate::status::{
    STATUS_ERROR_RUNTIME_DISCONNECTED, STATUS_SETTING_UP_WORKSPACE,
    STATUS_STARTING_RUNTIME, StatusReceiver, StatusSender, status_channel,
};
use crate::storage::FileStore;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Secret key the provider token is registered under in the event log.
pub const GITHUB_TOKEN_SECRET: &str = "github_token";
/// Environment variable the provider token is exposed as inside the runtime.
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

/// A fresh random session id.
pub fn generate_sid() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Closing,
    Closed,
    /// `start` did not complete; only `close` moves on from here.
    Failed,
}

/// What `start` needs besides the session's own configuration.
pub struct StartRequest {
    pub runtime_factory: Arc<dyn RuntimeFactory>,
    pub controller_factory: Arc<dyn ControllerFactory>,
    /// Used when the config names an analyzer. Defaults to a
    /// [`SecurityAnalyzerRegistry`] with nothing registered.
    pub security_analyzer_factory: Option<Arc<dyn SecurityAnalyzerFactory>>,
    pub agent: Arc<dyn Agent>,
    /// Global microagents; workspace microagents are layered on top.
    pub microagents: MicroagentIndex,
    pub github_token: Option<SecretString>,
    pub selected_repository: Option<String>,
    pub selected_branch: Option<String>,
    pub initial_message: Option<String>,
}

impl StartRequest {
    pub fn new(
        runtime_factory: Arc<dyn RuntimeFactory>,
        controller_factory: Arc<dyn ControllerFactory>,
        agent: Arc<dyn Agent>,
    ) -> Self {
        Self {
            runtime_factory,
            controller_factory,
            security_analyzer_factory: None,
            agent,
            microagents: MicroagentIndex::empty(),
            github_token: None,
            selected_repository: None,
            selected_branch: None,
            initial_message: None,
        }
    }

    pub fn with_security_analyzer_factory(
        mut self,
        factory: Arc<dyn SecurityAnalyzerFactory>,
    ) -> Self {
        self.security_analyzer_factory = Some(factory);
        self
    }

    pub fn with_microagents(mut self, microagents: MicroagentIndex) -> Self {
        self.microagents = microagents;
        self
    }

    pub fn with_github_token(mut self, token: SecretString) -> Self {
        self.github_token = Some(token);
        self
    }

    pub fn with_repository(
        mut self,
        repository: impl Into<String>,
        branch: Option<String>,
    ) -> Self {
        self.selected_repository = Some(repository.into());
        self.selected_branch = branch;
        self
    }

    pub fn with_initial_message(mut self, message: impl Into<String>) -> Self {
        self.initial_message = Some(message.into());
        self
    }
}

/// Outcome of a `start` that was accepted.
#[derive(Debug)]
pub struct StartReport {
    pub success: bool,
    pub elapsed: Duration,
    /// Why the start failed, when it did.
    pub error: Option<SessionError>,
}

struct Lifecycle {
    state: SessionState,
    started_at: Option<Instant>,
    close_requested: bool,
    /// Controller state captured by `close` before the controller went away.
    final_agent_state: Option<AgentState>,
}

impl Lifecycle {
    fn teardown_started(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Closed)
    }
}

#[derive(Default)]
struct Handles {
    runtime: Option<Arc<dyn Runtime>>,
    controller: Option<Arc<dyn Controller>>,
    security_analyzer: Option<Arc<dyn SecurityAnalyzer>>,
    memory: Option<Arc<Memory>>,
}

/// One accepted `start`. A start that never reaches `finish` (its future
/// was dropped, or a collaborator panicked) is settled as a failure on drop.
struct StartAttempt<'a> {
    session: &'a AgentSession,
    started_at: Instant,
    finished: bool,
}

impl StartAttempt<'_> {
    fn finish(mut self, success: bool) -> Duration {
        self.finished = true;
        let elapsed = self.started_at.elapsed();
        self.session.end_start(success, elapsed);
        elapsed
    }
}

impl Drop for StartAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(sid = %self.session.sid, "Agent session start abandoned");
            self.session.end_start(false, self.started_at.elapsed());
        }
    }
}

pub struct AgentSession {
    sid: String,
    config: SessionConfig,
    event_log: Arc<EventLog>,
    file_store: Arc<dyn FileStore>,
    monitoring: Arc<dyn MonitoringListener>,
    status_tx: StatusSender,
    status_rx: Mutex<Option<StatusReceiver>>,
    // Lock order: lifecycle before handles. Neither is held across an await.
    lifecycle: Mutex<Lifecycle>,
    handles: Mutex<Handles>,
    starting: watch::Sender<bool>,
}

impl AgentSession {
    /// Creates an idle session. Events already persisted for `sid` in
    /// `file_store` are loaded into the session's event log.
    pub fn new(
        sid: impl Into<String>,
        file_store: Arc<dyn FileStore>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let sid = sid.into();
        let event_log = Arc::new(EventLog::with_file_store(
            sid.clone(),
            Arc::clone(&file_store),
        )?);
        let (status_tx, status_rx) = status_channel();
        let (starting, _) = watch::channel(false);
        Ok(Self {
            sid,
            config,
            event_log,
            file_store,
            monitoring: Arc::new(TracingMonitoringListener),
            status_tx,
            status_rx: Mutex::new(Some(status_rx)),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Idle,
                started_at: None,
                close_requested: false,
                final_agent_state: None,
            }),
            handles: Mutex::new(Handles::default()),
            starting,
        })
    }

    pub fn with_monitoring(mut self, monitoring: Arc<dyn MonitoringListener>) -> Self {
        self.monitoring = monitoring;
        self
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    pub fn session_state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.lock().close_requested
    }

    /// The receiving end of the status channel. Only the first call gets it.
    pub fn take_status_receiver(&self) -> Option<StatusReceiver> {
        self.status_rx.lock().take()
    }

    pub fn runtime(&self) -> Option<Arc<dyn Runtime>> {
        self.handles.lock().runtime.clone()
    }

    pub fn controller(&self) -> Option<Arc<dyn Controller>> {
        self.handles.lock().controller.clone()
    }

    pub fn security_analyzer(&self) -> Option<Arc<dyn SecurityAnalyzer>> {
        self.handles.lock().security_analyzer.clone()
    }

    pub fn memory(&self) -> Option<Arc<Memory>> {
        self.handles.lock().memory.clone()
    }

    /// Starts the session.
    ///
    /// Misuse (a second start, or a start after `close`) is rejected with an
    /// error and changes nothing. Any other failure is reported in the
    /// returned [`StartReport`]; resources created before the failure stay
    /// in place until `close`.
    pub async fn start(
        &self,
        request: StartRequest,
    ) -> Result<StartReport, SessionError> {
        let attempt = self.begin_start()?;
        let result = self.run_start(request).await;
        let success = result.is_ok();
        let elapsed = attempt.finish(success);

        match &result {
            Ok(()) => info!(
                sid = %self.sid,
                elapsed_ms = elapsed.as_millis() as u64,
                "Agent session started"
            ),
            Err(e) => warn!(
                sid = %self.sid,
                category = e.category(),
                error = %e,
                "Agent session failed to start"
            ),
        }
        Ok(StartReport {
            success,
            elapsed,
            error: result.err(),
        })
    }

    fn begin_start(&self) -> Result<StartAttempt<'_>, SessionError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.close_requested {
            warn!(sid = %self.sid, "Session closed before starting");
            return Err(SessionError::AlreadyClosed);
        }
        {
            let handles = self.handles.lock();
            if lifecycle.state != SessionState::Idle
                || handles.runtime.is_some()
                || handles.controller.is_some()
            {
                return Err(SessionError::AlreadyStarted);
            }
        }
        let now = Instant::now();
        lifecycle.state = SessionState::Starting;
        lifecycle.started_at = Some(now);
        self.starting.send_replace(true);
        Ok(StartAttempt {
            session: self,
            started_at: now,
            finished: false,
        })
    }

    /// Settles a start: leaves `Starting`, lowers the in-progress flag and
    /// reports the outcome exactly once.
    fn end_start(&self, success: bool, elapsed: Duration) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == SessionState::Starting {
                lifecycle.state = if success {
                    SessionState::Running
                } else {
                    SessionState::Failed
                };
            }
        }
        self.starting.send_replace(false);
        self.monitoring.on_agent_session_start(success, elapsed);
    }

    async fn run_start(&self, request: StartRequest) -> Result<(), SessionError> {
        let StartRequest {
            runtime_factory,
            controller_factory,
            security_analyzer_factory,
            agent,
            microagents,
            github_token,
            selected_repository,
            selected_branch,
            initial_message,
        } = request;

        if let Some(name) = &self.config.security_analyzer {
            let factory = security_analyzer_factory
                .unwrap_or_else(|| Arc::new(SecurityAnalyzerRegistry::new()));
            let analyzer = factory
                .create(name, Arc::clone(&self.event_log))
                .map_err(SessionError::SecurityAnalyzer)?;
            self.install(|h| h.security_analyzer = Some(analyzer))?;
        }

        let token = github_token.as_ref().map(|t| t.expose_secret());
        let runtime = self
            .create_runtime(runtime_factory.as_ref(), agent.as_ref(), token)
            .await?;

        self.status_tx.info(STATUS_SETTING_UP_WORKSPACE, "Setting up workspace");
        let repo_directory = match selected_repository.as_deref() {
            Some(repository) => Some(
                runtime
                    .clone_repo(token, repository, selected_branch.as_deref())
                    .await?,
            ),
            None => None,
        };

        let memory = Memory::new(
            Arc::clone(&self.event_log),
            microagents,
            self.config.disabled_microagents.clone(),
            Some(self.status_tx.clone()),
        );
        memory.set_runtime_info(runtime.web_hosts(), runtime.additional_agent_instructions());
        let workspace_microagents = runtime
            .get_microagents_from_selected_repo(selected_repository.as_deref())
            .await?;
        memory.load_user_workspace_microagents(workspace_microagents)?;
        if let (Some(repository), Some(directory)) =
            (&selected_repository, &repo_directory)
        {
            memory.set_repository_info(repository.clone(), directory.display().to_string());
        }
        self.install(|h| h.memory = Some(memory))?;

        let controller = self.create_controller(controller_factory.as_ref(), agent)?;
        if let Err(e) =
            self.install(|h| h.controller = Some(Arc::clone(&controller)))
        {
            if let Err(close_err) = controller.close().await {
                warn!(sid = %self.sid, error = %close_err, "Failed to close orphaned controller");
            }
            return Err(e);
        }

        if let Some(token) = token {
            self.event_log.set_secrets(HashMap::from([(
                GITHUB_TOKEN_SECRET.to_string(),
                token.to_string(),
            )]));
        }

        match initial_message {
            Some(message) => {
                self.event_log.append(EventSource::User, EventKind::message(message))?;
                self.event_log.append(
                    EventSource::Environment,
                    EventKind::change_agent_state(AgentState::Running),
                )?;
            }
            None => {
                self.event_log.append(
                    EventSource::Environment,
                    EventKind::change_agent_state(AgentState::AwaitingUserInput),
                )?;
            }
        }
        Ok(())
    }

    async fn create_runtime(
        &self,
        factory: &dyn RuntimeFactory,
        agent: &dyn Agent,
        token: Option<&str>,
    ) -> Result<Arc<dyn Runtime>, SessionError> {
        debug!(sid = %self.sid, "Initializing runtime");
        let env_vars = token
            .map(|t| HashMap::from([(GITHUB_TOKEN_ENV.to_string(), t.to_string())]))
            .unwrap_or_default();
        let ctx = RuntimeContext {
            sid: self.sid.clone(),
            event_log: Arc::clone(&self.event_log),
            env_vars,
            plugins: agent.sandbox_plugins(),
            status: self.status_tx.clone(),
        };

        let runtime = factory.create(ctx).map_err(|e| self.runtime_failure(e))?;
        self.install(|h| h.runtime = Some(Arc::clone(&runtime)))?;

        self.status_tx.info(STATUS_STARTING_RUNTIME, "Starting runtime");
        runtime.connect().await.map_err(|e| self.runtime_failure(e))?;
        // A close that gave up waiting has already torn this runtime down.
        self.ensure_not_torn_down()?;
        debug!(sid = %self.sid, plugins = ?agent.sandbox_plugins(), "Runtime initialized");
        Ok(runtime)
    }

    fn runtime_failure(&self, err: RuntimeError) -> SessionError {
        if let RuntimeError::Unavailable(message) = &err {
            error!(sid = %self.sid, error = %message, "Runtime initialization failed");
            self.status_tx.error(STATUS_ERROR_RUNTIME_DISCONNECTED, message.clone());
        }
        err.into()
    }

    fn create_controller(
        &self,
        factory: &dyn ControllerFactory,
        agent: Arc<dyn Agent>,
    ) -> Result<Arc<dyn Controller>, SessionError> {
        debug!(
            sid = %self.sid,
            agent = agent.name(),
            llm = agent.llm_model().unwrap_or("unknown"),
            plugins = ?agent.sandbox_plugins(),
            "Creating agent controller"
        );
        let params = ControllerParams {
            sid: self.sid.clone(),
            event_log: Arc::clone(&self.event_log),
            agent,
            max_iterations: self.config.max_iterations,
            max_budget_per_task: self.config.max_budget_per_task,
            confirmation_mode: self.config.confirmation_mode,
            initial_state: self.maybe_restore_state(),
            status: self.status_tx.clone(),
        };
        factory.create(params).map_err(SessionError::Controller)
    }

    /// State saved by an earlier run of this session, if readable.
    ///
    /// A session with events on record should have saved state, so a miss
    /// is only worth a warning then.
    fn maybe_restore_state(&self) -> Option<State> {
        match State::restore_from_session(&self.sid, self.file_store.as_ref()) {
            Ok(state) => {
                debug!(sid = %self.sid, "Restored state from session");
                Some(state)
            }
            Err(e) if !self.event_log.is_empty() => {
                warn!(sid = %self.sid, error = %e, "State could not be restored");
                None
            }
            Err(_) => {
                debug!(sid = %self.sid, "No events found, no state to restore");
                None
            }
        }
    }

    /// Stores a freshly created handle unless `close` has begun tearing down.
    fn install(&self, store: impl FnOnce(&mut Handles)) -> Result<(), SessionError> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.teardown_started() {
            return Err(SessionError::ClosedDuringStart);
        }
        store(&mut self.handles.lock());
        Ok(())
    }

    fn ensure_not_torn_down(&self) -> Result<(), SessionError> {
        if self.lifecycle.lock().teardown_started() {
            return Err(SessionError::ClosedDuringStart);
        }
        Ok(())
    }

    /// Reports the controller's state, `Error` when no controller showed up
    /// within the grace period after start, or `None` while still pending.
    /// After `close` the controller's last state keeps being reported.
    pub fn get_state(&self) -> Option<AgentState> {
        let controller = self.handles.lock().controller.clone();
        if let Some(controller) = controller {
            return Some(controller.get_state());
        }
        let lifecycle = self.lifecycle.lock();
        if let Some(state) = lifecycle.final_agent_state {
            return Some(state);
        }
        let started_at = lifecycle.started_at?;
        (started_at.elapsed() > self.config.state_grace_period)
            .then_some(AgentState::Error)
    }

    /// Closes the session. Safe to call from any state and more than once.
    ///
    /// Every teardown step runs even if an earlier one fails; the first
    /// failure is returned.
    pub async fn close(&self) -> Result<(), SessionError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.close_requested {
                debug!(sid = %self.sid, "Session already closed");
                return Ok(());
            }
            lifecycle.close_requested = true;
        }

        self.wait_for_start().await;

        let handles = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = SessionState::Closing;
            std::mem::take(&mut *self.handles.lock())
        };
        let result = self.teardown(handles).await;

        self.lifecycle.lock().state = SessionState::Closed;
        self.monitoring.on_agent_session_close(&self.sid);
        result
    }

    async fn wait_for_start(&self) {
        let mut starting = self.starting.subscribe();
        if !*starting.borrow_and_update() {
            return;
        }

        let began = Instant::now();
        let interval = self.config.close_wait_interval.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(began + interval, interval);
        let deadline = time::sleep(self.config.close_wait);
        let finished = async {
            loop {
                let busy = *starting.borrow_and_update();
                if !busy || starting.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::pin!(deadline, finished);

        loop {
            tokio::select! {
                _ = &mut finished => return,
                _ = ticker.tick() => {
                    debug!(
                        sid = %self.sid,
                        "Waiting for initialization to finish before closing session"
                    );
                }
                _ = &mut deadline => {
                    error!(
                        sid = %self.sid,
                        waited_ms = began.elapsed().as_millis() as u64,
                        "Waited too long for initialization to finish before closing session"
                    );
                    return;
                }
            }
        }
    }

    async fn teardown(&self, handles: Handles) -> Result<(), SessionError> {
        let mut first_error = None;
        self.event_log.close();

        if let Some(controller) = handles.controller {
            self.lifecycle.lock().final_agent_state = Some(controller.get_state());
            if let Err(e) = controller
                .state()
                .save_to_session(&self.sid, self.file_store.as_ref())
            {
                warn!(sid = %self.sid, error = %e, "Failed to save agent state");
                keep_first(&mut first_error, e);
            }
            if let Err(e) = controller.close().await {
                warn!(sid = %self.sid, error = %e, "Failed to close controller");
                keep_first(&mut first_error, SessionError::Controller(e));
            }
        }
        if let Some(runtime) = handles.runtime
            && let Err(e) = runtime.close().await
        {
            warn!(sid = %self.sid, error = %e, "Failed to close runtime");
            keep_first(
                &mut first_error,
                SessionError::Runtime(RuntimeError::Other(e)),
            );
        }
        if let Some(analyzer) = handles.security_analyzer
            && let Err(e) = analyzer.close().await
        {
            warn!(sid = %self.sid, error = %e, "Failed to close security analyzer");
            keep_first(&mut first_error, SessionError::SecurityAnalyzer(e));
        }

        first_error.map_or(Ok(()), Err)
    }
}

fn keep_first(slot: &mut Option<SessionError>, err: SessionError) {
    if slot.is_none() {
        *slot = Some(err);
    }
}
