//! Security analyzers inspect agent actions as they land on the event log.

use crate::event_log::{EventLog, subscribers};
use crate::events::EventKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[async_trait]
pub trait SecurityAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn close(&self) -> anyhow::Result<()>;
}

pub trait SecurityAnalyzerFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        event_log: Arc<EventLog>,
    ) -> anyhow::Result<Arc<dyn SecurityAnalyzer>>;
}

type AnalyzerConstructor =
    Box<dyn Fn(Arc<EventLog>) -> anyhow::Result<Arc<dyn SecurityAnalyzer>> + Send + Sync>;

/// Name-keyed analyzer constructors.
///
/// Unknown names fall back to a [`PassiveSecurityAnalyzer`].
#[derive(Default)]
pub struct SecurityAnalyzerRegistry {
    constructors: HashMap<String, AnalyzerConstructor>,
}

impl SecurityAnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(Arc<EventLog>) -> anyhow::Result<Arc<dyn SecurityAnalyzer>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
    }
}

impl SecurityAnalyzerFactory for SecurityAnalyzerRegistry {
    fn create(
        &self,
        name: &str,
        event_log: Arc<EventLog>,
    ) -> anyhow::Result<Arc<dyn SecurityAnalyzer>> {
        debug!(analyzer = name, "Using security analyzer");
        match self.constructors.get(name) {
            Some(constructor) => constructor(event_log),
            None => {
                Ok(PassiveSecurityAnalyzer::attach(name, event_log) as Arc<dyn SecurityAnalyzer>)
            }
        }
    }
}

/// Watches the log and counts actions without judging them.
pub struct PassiveSecurityAnalyzer {
    name: String,
    event_log: Arc<EventLog>,
    actions_seen: Arc<AtomicU64>,
}

impl PassiveSecurityAnalyzer {
    pub fn attach(name: &str, event_log: Arc<EventLog>) -> Arc<Self> {
        let actions_seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&actions_seen);
        event_log.subscribe(subscribers::SECURITY_ANALYZER, move |event| {
            if let EventKind::Action(action) = &event.kind {
                counter.fetch_add(1, Ordering::Relaxed);
                debug!(tool = %action.tool_name, id = event.id, "Action passed security analyzer");
            }
            Ok(())
        });
        Arc::new(Self {
            name: name.to_string(),
            event_log,
            actions_seen,
        })
    }

    pub fn actions_seen(&self) -> u64 {
        self.actions_seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SecurityAnalyzer for PassiveSecurityAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.event_log.unsubscribe(subscribers::SECURITY_ANALYZER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ActionEvent, EventSource};

    struct Named(String);

    #[async_trait]
    impl SecurityAnalyzer for Named {
        fn name(&self) -> &str {
            &self.0
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_uses_registered_constructor() {
        let mut registry = SecurityAnalyzerRegistry::new();
        registry.register("custom", |_log| {
            Ok(Arc::new(Named("custom".into())) as Arc<dyn SecurityAnalyzer>)
        });
        let log = Arc::new(EventLog::new("s1"));
        let analyzer = registry.create("custom", log).unwrap();
        assert_eq!(analyzer.name(), "custom");
    }

    #[tokio::test]
    async fn unknown_name_falls_back_to_passive_analyzer() {
        let registry = SecurityAnalyzerRegistry::new();
        let log = Arc::new(EventLog::new("s1"));
        let analyzer = registry.create("invariant", Arc::clone(&log)).unwrap();
        assert_eq!(analyzer.name(), "invariant");
        assert_eq!(log.subscriber_count(), 1);

        analyzer.close().await.unwrap();
        assert_eq!(log.subscriber_count(), 0);
    }

    #[test]
    fn passive_analyzer_counts_actions() {
        let log = Arc::new(EventLog::new("s1"));
        let analyzer = PassiveSecurityAnalyzer::attach("passive", Arc::clone(&log));

        log.append(
            EventSource::Agent,
            EventKind::Action(ActionEvent {
                tool_name: "cmd".into(),
                tool_call_id: "call_1".into(),
                arguments: serde_json::json!({"command": "ls"}),
                thought: None,
            }),
        )
        .unwrap();
        log.append(EventSource::User, EventKind::message("hi")).unwrap();
        assert_eq!(analyzer.actions_seen(), 1);
    }
}
