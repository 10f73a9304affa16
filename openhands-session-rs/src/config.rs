use serde::{Deserialize, Deserializer};
use std::time::Duration;

pub const DEFAULT_MAX_ITERATIONS: u32 = 250;
/// Longest `close` waits for an in-flight `start` before tearing down anyway.
pub const WAIT_TIME_BEFORE_CLOSE: Duration = Duration::from_secs(90);
pub const WAIT_TIME_BEFORE_CLOSE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the security analyzer to attach, if any.
    pub security_analyzer: Option<String>,
    pub confirmation_mode: bool,
    pub max_iterations: u32,
    pub max_budget_per_task: Option<f64>,
    pub disabled_microagents: Vec<String>,
    #[serde(deserialize_with = "duration_from_secs")]
    pub close_wait: Duration,
    #[serde(deserialize_with = "duration_from_secs")]
    pub close_wait_interval: Duration,
    /// How long `get_state` reports "pending" before calling a controller-less
    /// session failed.
    #[serde(deserialize_with = "duration_from_secs")]
    pub state_grace_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            security_analyzer: None,
            confirmation_mode: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_budget_per_task: None,
            disabled_microagents: Vec::new(),
            close_wait: WAIT_TIME_BEFORE_CLOSE,
            close_wait_interval: WAIT_TIME_BEFORE_CLOSE_INTERVAL,
            state_grace_period: WAIT_TIME_BEFORE_CLOSE,
        }
    }
}

impl SessionConfig {
    /// Defaults overlaid with `OPENHANDS_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`; unparsable values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("OPENHANDS_SECURITY_ANALYZER") {
            self.security_analyzer = Some(name).filter(|n| !n.is_empty());
        }
        if let Some(flag) = lookup("OPENHANDS_CONFIRMATION_MODE") {
            self.confirmation_mode = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(n) = lookup("OPENHANDS_MAX_ITERATIONS").and_then(|v| v.parse().ok()) {
            self.max_iterations = n;
        }
        if let Some(budget) = lookup("OPENHANDS_MAX_BUDGET_PER_TASK").and_then(|v| v.parse().ok()) {
            self.max_budget_per_task = Some(budget);
        }
        if let Some(list) = lookup("OPENHANDS_DISABLED_MICROAGENTS") {
            self.disabled_microagents = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = lookup("OPENHANDS_CLOSE_WAIT_SECS").and_then(|v| v.parse().ok()) {
            self.close_wait = Duration::from_secs(secs);
        }
        self
    }
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
