//! Append-only, ordered event log with synchronous fan-out to subscribers.
//!
//! Every session owns exactly one [`EventLog`]. Appends are assigned
//! consecutive ids starting at 0 and are delivered to subscribers in
//! registration order. Appends that happen while a delivery pass is running
//! (for example from inside a subscriber callback) are queued and delivered
//! by that pass after the current event, so delivery never recurses.

use crate::errors::{EventLogError, StorageError};
use crate::events::{Event, EventKind, EventSource};
use crate::storage::{self, FileStore};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Well-known subscriber keys.
pub mod subscribers {
    pub const AGENT_CONTROLLER: &str = "agent_controller";
    pub const MEMORY: &str = "memory";
    pub const SECURITY_ANALYZER: &str = "security_analyzer";
}

const SECRET_PLACEHOLDER: &str = "<secret_hidden>";

pub type SubscriberCallback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    key: String,
    callback: SubscriberCallback,
}

#[derive(Default)]
struct LogState {
    events: Vec<Arc<Event>>,
    next_id: u64,
    subscribers: Vec<Subscriber>,
    pending: VecDeque<Arc<Event>>,
    delivering: bool,
    closed: bool,
    secrets: HashMap<String, String>,
}

pub struct EventLog {
    sid: String,
    file_store: Option<Arc<dyn FileStore>>,
    state: Mutex<LogState>,
}

impl EventLog {
    /// Creates an empty, memory-only log.
    pub fn new(sid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            file_store: None,
            state: Mutex::new(LogState::default()),
        }
    }

    /// Creates a log that writes every event through to `file_store`.
    ///
    /// Events already persisted for `sid` are loaded first, so ids continue
    /// where the previous process stopped.
    pub fn with_file_store(
        sid: impl Into<String>,
        file_store: Arc<dyn FileStore>,
    ) -> Result<Self, StorageError> {
        let sid = sid.into();
        let mut events = Vec::new();
        for path in file_store.list(&storage::events_dir(&sid))? {
            let content = file_store.read(&path)?;
            let event: Event = serde_json::from_str(&content)?;
            events.push(Arc::new(event));
        }
        events.sort_by_key(|e| e.id);

        if let Some(missing) = events
            .iter()
            .enumerate()
            .find(|(i, e)| e.id != *i as u64)
            .map(|(i, _)| i as u64)
        {
            error!(sid = %sid, missing, loaded = events.len(), "Persisted events have a gap");
            return Err(StorageError::MissingEvent { sid, id: missing });
        }
        if !events.is_empty() {
            debug!(sid = %sid, count = events.len(), "Loaded persisted events");
        }

        let state = LogState {
            next_id: events.len() as u64,
            events,
            ..LogState::default()
        };
        Ok(Self {
            sid,
            file_store: Some(file_store),
            state: Mutex::new(state),
        })
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn append(
        &self,
        source: EventSource,
        kind: EventKind,
    ) -> Result<Arc<Event>, EventLogError> {
        self.append_with_cause(source, kind, None)
    }

    /// Appends an event, recording the id of the event it responds to.
    pub fn append_with_cause(
        &self,
        source: EventSource,
        kind: EventKind,
        cause: Option<u64>,
    ) -> Result<Arc<Event>, EventLogError> {
        let (event, secrets) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EventLogError::Closed {
                    sid: self.sid.clone(),
                });
            }
            let event = Arc::new(Event {
                id: state.next_id,
                source,
                timestamp: Utc::now(),
                cause,
                kind,
            });
            state.next_id += 1;
            state.events.push(Arc::clone(&event));
            state.pending.push_back(Arc::clone(&event));
            let secrets: Vec<String> = state.secrets.values().cloned().collect();
            (event, secrets)
        };

        self.persist(&event, &secrets);
        self.deliver_pending();
        Ok(event)
    }

    /// Registers `callback` under `key`, replacing any callback already
    /// registered for that key (the original registration position is kept).
    pub fn subscribe<F>(&self, key: &str, callback: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: SubscriberCallback = Arc::new(callback);
        let mut state = self.state.lock();
        if let Some(existing) = state.subscribers.iter_mut().find(|s| s.key == key) {
            debug!(sid = %self.sid, key, "Replacing event log subscriber");
            existing.callback = callback;
        } else {
            state.subscribers.push(Subscriber {
                key: key.to_string(),
                callback,
            });
        }
    }

    pub fn unsubscribe(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.key != key);
        state.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Iterator over a snapshot of the stored events, oldest first unless
    /// `reverse` is set. Events appended afterwards are not visible to it.
    pub fn get_events(&self, reverse: bool) -> EventIter {
        let events = self.state.lock().events.clone();
        EventIter::new(events, reverse)
    }

    pub fn get_event(&self, id: u64) -> Option<Arc<Event>> {
        let state = self.state.lock();
        usize::try_from(id)
            .ok()
            .and_then(|index| state.events.get(index).cloned())
    }

    pub fn latest_event_id(&self) -> Option<u64> {
        self.state.lock().events.last().map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values that must never reach persisted storage in clear text.
    pub fn set_secrets(&self, secrets: HashMap<String, String>) {
        let mut state = self.state.lock();
        state.secrets = secrets
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Stops delivery and rejects further appends. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.pending.clear();
        state.subscribers.clear();
        debug!(sid = %self.sid, events = state.events.len(), "Event log closed");
    }

    fn persist(&self, event: &Event, secrets: &[String]) {
        let Some(file_store) = &self.file_store else {
            return;
        };
        let mut value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                error!(sid = %self.sid, id = event.id, error = %e, "Failed to serialize event");
                return;
            }
        };
        mask_secrets(&mut value, secrets);
        let path = storage::event_path(&self.sid, event.id);
        if let Err(e) = file_store.write(&path, &value.to_string()) {
            warn!(sid = %self.sid, id = event.id, error = %e, "Failed to persist event");
        }
    }

    fn deliver_pending(&self) {
        {
            let mut state = self.state.lock();
            if state.delivering {
                return;
            }
            state.delivering = true;
        }

        loop {
            let (event, targets) = {
                let mut state = self.state.lock();
                let next = if state.closed {
                    None
                } else {
                    state.pending.pop_front()
                };
                let Some(event) = next else {
                    state.delivering = false;
                    return;
                };
                let targets: Vec<(String, SubscriberCallback)> = state
                    .subscribers
                    .iter()
                    .map(|s| (s.key.clone(), Arc::clone(&s.callback)))
                    .collect();
                (event, targets)
            };

            for (key, callback) in targets {
                match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(
                            sid = %self.sid,
                            subscriber = %key,
                            id = event.id,
                            error = %e,
                            "Event subscriber failed"
                        );
                    }
                    Err(panic) => {
                        error!(
                            sid = %self.sid,
                            subscriber = %key,
                            id = event.id,
                            panic = %panic_message(panic.as_ref()),
                            "Event subscriber panicked"
                        );
                    }
                }
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn mask_secrets(value: &mut Value, secrets: &[String]) {
    if secrets.is_empty() {
        return;
    }
    match value {
        Value::String(s) => {
            for secret in secrets {
                if s.contains(secret.as_str()) {
                    *s = s.replace(secret.as_str(), SECRET_PLACEHOLDER);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| mask_secrets(v, secrets)),
        Value::Object(map) => map.values_mut().for_each(|v| mask_secrets(v, secrets)),
        _ => {}
    }
}

/// Lazy iterator over an event snapshot. Cloning restarts from the same
/// position, so a fresh clone taken before iterating can be replayed.
#[derive(Clone)]
pub struct EventIter {
    events: Vec<Arc<Event>>,
    front: usize,
    back: usize,
    reverse: bool,
}

impl EventIter {
    fn new(events: Vec<Arc<Event>>, reverse: bool) -> Self {
        let back = events.len();
        Self {
            events,
            front: 0,
            back,
            reverse,
        }
    }
}

impl Iterator for EventIter {
    type Item = Arc<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let index = if self.reverse {
            self.back -= 1;
            self.back
        } else {
            self.front += 1;
            self.front - 1
        };
        self.events.get(index).cloned()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for EventIter {}
