use pkg_constants::state::EVENT_LOG_CAPACITY;
use pkg_types::Resource;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::api::Api;
use crate::backend::Backend;
use crate::client::StateStore;
use crate::memory::MemoryStore;
use crate::watch::EventLog;

/// Object store shared by every controller.
///
/// Writes are serialized so that resource-version checks and the event
/// order both match the order writes hit the backend.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    write_lock: Arc<Mutex<()>>,
    pub event_log: EventLog,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
            event_log: EventLog::new(EVENT_LOG_CAPACITY),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Open a SlateDB-backed store rooted at `path`.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let backend = StateStore::new(path).await?;
        Ok(Self::new(Arc::new(backend)))
    }

    /// Typed access to one kind of object.
    pub fn api<K: Resource>(&self) -> Api<K> {
        Api::new(self.clone())
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.backend.close().await
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub(crate) fn write_lock(&self) -> &Mutex<()> {
        &self.write_lock
    }
}
