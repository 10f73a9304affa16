//! Error types shared across the session crate.

/// Errors raised by a [`crate::storage::FileStore`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error while touching the backing directory.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Nothing stored under the requested path.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persisted events for a session skip an id; resuming would overwrite
    /// the events stored after the gap.
    #[error("Persisted events for session {sid} are missing id {id}")]
    MissingEvent { sid: String, id: u64 },

    /// Stored content could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by the [`crate::event_log::EventLog`].
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// The log no longer accepts appends.
    #[error("Event log for session {sid} is closed")]
    Closed { sid: String },
}

/// Errors reported by a [`crate::runtime::Runtime`] collaborator.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The sandbox could not be reached or started.
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    /// Cloning the selected repository failed.
    #[error("Failed to clone {repo}: {message}")]
    Clone { repo: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised while loading or merging microagents.
#[derive(Debug, thiserror::Error)]
pub enum MicroagentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid microagent pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// Microagent file exceeds the maximum size.
    #[error("Microagent file too large: {path} ({size} bytes > {max} bytes)")]
    FileTooLarge { path: String, size: u64, max: u64 },

    /// Frontmatter could not be understood.
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },

    /// More than one repository-wide microagent in a single set.
    #[error("Expected at most one repository microagent, found: {0:?}")]
    MultipleRepoMicroagents(Vec<String>),
}

/// Errors raised while computing or publishing a recall result.
#[derive(Debug, thiserror::Error)]
pub enum RecallError {
    #[error("Failed to publish recall result: {0}")]
    EventLog(#[from] EventLogError),

    /// The recall computation panicked.
    #[error("Recall computation panicked: {0}")]
    Panicked(String),
}

/// Errors surfaced by [`crate::session::AgentSession`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `start` called on a session that already has resources or has left `Idle`.
    #[error("Session already started. Close this session and start a new one")]
    AlreadyStarted,

    /// `start` called after `close` was requested.
    #[error("Session already closed")]
    AlreadyClosed,

    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Persisted controller state was missing or corrupt.
    #[error("State could not be restored: {0}")]
    RestoreFailed(String),

    /// `close` tore the session down while `start` was still running.
    #[error("Session closed while starting")]
    ClosedDuringStart,

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Microagent(#[from] MicroagentError),

    #[error("Runtime error: {0}")]
    Runtime(RuntimeError),

    #[error("Controller error: {0}")]
    Controller(anyhow::Error),

    #[error("Security analyzer error: {0}")]
    SecurityAnalyzer(anyhow::Error),
}

impl From<RuntimeError> for SessionError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(message) => Self::RuntimeUnavailable(message),
            other => Self::Runtime(other),
        }
    }
}

impl SessionError {
    /// Whether the error comes from caller misuse rather than a failing resource.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::AlreadyStarted | Self::AlreadyClosed)
    }

    /// Short category string for logs and status reports.
    pub fn category(&self) -> &'static str {
        match self {
            Self::AlreadyStarted => "already_started",
            Self::AlreadyClosed => "already_closed",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::RestoreFailed(_) => "restore_failed",
            Self::ClosedDuringStart => "closed_during_start",
            Self::EventLog(_) => "event_log",
            Self::Storage(_) => "storage",
            Self::Microagent(_) => "microagent",
            Self::Runtime(_) => "runtime",
            Self::Controller(_) => "controller",
            Self::SecurityAnalyzer(_) => "security_analyzer",
        }
    }
}
