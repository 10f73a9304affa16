/// The decision-making side of a session.
///
/// The session never drives the agent itself; it only hands it to the
/// controller and reads a few descriptive properties for logging and runtime
/// setup.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Model identifier used by the agent, for the startup log.
    fn llm_model(&self) -> Option<&str> {
        None
    }

    /// Sandbox plugins the runtime must provide for this agent.
    fn sandbox_plugins(&self) -> Vec<String> {
        Vec::new()
    }
}
