use pkg_constants::state::REGISTRY_PREFIX;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    /// New value for puts, last value for deletes.
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

/// Identity of a stored object, recovered from its registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub plural: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    /// Parses `/registry/<plural>/<name>` and `/registry/<plural>/<ns>/<name>`.
    pub fn from_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(REGISTRY_PREFIX)?;
        let mut parts = rest.split('/');
        let plural = parts.next().filter(|p| !p.is_empty())?;
        let first = parts.next().filter(|p| !p.is_empty())?;
        match (parts.next(), parts.next()) {
            (None, _) => Some(Self {
                plural: plural.to_string(),
                namespace: String::new(),
                name: first.to_string(),
            }),
            (Some(name), None) if !name.is_empty() => Some(Self {
                plural: plural.to_string(),
                namespace: first.to_string(),
                name: name.to_string(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.plural, self.name)
        } else {
            write!(f, "{}/{}/{}", self.plural, self.namespace, self.name)
        }
    }
}

impl WatchEvent {
    pub fn object_ref(&self) -> Option<ObjectRef> {
        ObjectRef::from_key(&self.key)
    }
}

/// In-memory event log that tracks all state mutations with monotonic sequence numbers.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<RwLock<EventLogInner>>,
    sender: broadcast::Sender<WatchEvent>,
}

struct EventLogInner {
    seq: u64,
    /// Ring buffer of recent events (capped)
    events: VecDeque<WatchEvent>,
    max_events: usize,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(max_events.max(16));
        Self {
            inner: Arc::new(RwLock::new(EventLogInner {
                seq: 0,
                events: VecDeque::with_capacity(max_events),
                max_events,
            })),
            sender,
        }
    }

    /// Record a new event. Called by the store after every successful write.
    pub async fn emit(&self, event_type: EventType, key: String, value: Option<Vec<u8>>) -> u64 {
        let mut inner = self.inner.write().await;
        inner.seq += 1;
        let event = WatchEvent {
            seq: inner.seq,
            event_type,
            key,
            value,
        };
        if inner.events.len() >= inner.max_events {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
        // No receivers is fine
        let _ = self.sender.send(event);
        inner.seq
    }

    /// Sequence number of the last write; doubles as a write counter.
    pub async fn current_seq(&self) -> u64 {
        self.inner.read().await.seq
    }

    pub async fn events_since(&self, from_seq: u64) -> Vec<WatchEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}
