pub mod agent;
pub mod config;
pub mod controller;
pub mod errors;
pub mod event_log;
pub mod events;
pub mod logger;
pub mod memory;
pub mod microagent;
pub mod monitoring;
pub mod runtime;
pub mod security;
pub mod session;
pub mod state;
pub mod status;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use errors::SessionError;
pub use event_log::EventLog;
pub use session::{AgentSession, SessionState, StartReport, StartRequest};
