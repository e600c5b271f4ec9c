use async_trait::async_trait;
use dashmap::DashMap;
use pkg_constants::state::{
    DEFAULT_WORKERS, DEPENDENCY_REQUEUE_SECS, ERROR_REQUEUE_SECS, RESYNC_INTERVAL_SECS,
};
use pkg_state::watch::{EventType, WatchEvent};
use pkg_state::{Api, Store};
use pkg_types::Resource;
use pkg_types::binding::{ClusterRoleTemplateBinding, ProjectRoleTemplateBinding};
use pkg_types::cluster::Project;
use pkg_types::crd::CustomResourceDefinition;
use pkg_types::namespace::Namespace;
use pkg_types::rbac::ClusterRoleBinding;
use pkg_types::roletemplate::RoleTemplate;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;
use crate::retry::update_with_retry;

/// Kinds of objects the controller watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    RoleTemplate,
    ClusterRoleTemplateBinding,
    ProjectRoleTemplateBinding,
    Namespace,
    Project,
    ClusterRoleBinding,
    CustomResourceDefinition,
}

impl Kind {
    pub const ALL: [Kind; 7] = [
        Kind::RoleTemplate,
        Kind::ClusterRoleTemplateBinding,
        Kind::ProjectRoleTemplateBinding,
        Kind::Namespace,
        Kind::Project,
        Kind::ClusterRoleBinding,
        Kind::CustomResourceDefinition,
    ];

    pub fn plural(self) -> &'static str {
        match self {
            Kind::RoleTemplate => RoleTemplate::PLURAL,
            Kind::ClusterRoleTemplateBinding => ClusterRoleTemplateBinding::PLURAL,
            Kind::ProjectRoleTemplateBinding => ProjectRoleTemplateBinding::PLURAL,
            Kind::Namespace => Namespace::PLURAL,
            Kind::Project => Project::PLURAL,
            Kind::ClusterRoleBinding => ClusterRoleBinding::PLURAL,
            Kind::CustomResourceDefinition => CustomResourceDefinition::PLURAL,
        }
    }

    pub fn from_plural(plural: &str) -> Option<Kind> {
        Kind::ALL.into_iter().find(|k| k.plural() == plural)
    }
}

/// Identity of one queued reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl QueueKey {
    pub fn new(kind: Kind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn for_object<K: Resource>(kind: Kind, obj: &K) -> Self {
        Self::new(kind, obj.namespace(), obj.name())
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{:?} {}", self.kind, self.name)
        } else {
            write!(f, "{:?} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// What to do with a key after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

/// Reconciles one kind of object.
#[async_trait]
pub trait Handler<K: Resource>: Send + Sync + 'static {
    /// Called with the current object whenever it may have changed.
    async fn sync(&self, obj: K) -> anyhow::Result<Action>;

    /// Called once the object is being deleted, or with its last state once
    /// it is gone.
    async fn remove(&self, obj: K) -> anyhow::Result<Action> {
        let _ = obj;
        Ok(Action::Done)
    }

    /// Finalizer held on the object until `remove` has succeeded.
    fn finalizer(&self) -> Option<&'static str> {
        None
    }
}

#[async_trait]
trait Dispatch: Send + Sync {
    async fn process(&self, key: &QueueKey, tombstone: Option<Vec<u8>>) -> anyhow::Result<Action>;

    async fn keys(&self) -> anyhow::Result<Vec<QueueKey>>;
}

struct TypedDispatch<K, H> {
    kind: Kind,
    api: Api<K>,
    handler: H,
    _kind: PhantomData<fn() -> K>,
}

#[async_trait]
impl<K: Resource, H: Handler<K>> Dispatch for TypedDispatch<K, H> {
    async fn process(&self, key: &QueueKey, tombstone: Option<Vec<u8>>) -> anyhow::Result<Action> {
        let finalizer = self.handler.finalizer();
        match self.api.get_opt(&key.namespace, &key.name).await? {
            Some(obj) if obj.meta().is_deleting() => {
                let action = self.handler.remove(obj.clone()).await?;
                if let (Action::Done, Some(f)) = (action, finalizer) {
                    update_with_retry(&self.api, obj, |o| o.meta_mut().remove_finalizer(f)).await?;
                }
                Ok(action)
            }
            Some(obj) => {
                let obj = match finalizer {
                    Some(f) if !obj.meta().has_finalizer(f) => {
                        let added =
                            update_with_retry(&self.api, obj, |o| o.meta_mut().add_finalizer(f))
                                .await?;
                        match added {
                            Some(obj) => obj,
                            None => return Ok(Action::Done),
                        }
                    }
                    _ => obj,
                };
                self.handler.sync(obj).await
            }
            None => {
                let Some(bytes) = tombstone else {
                    debug!("{} is gone, nothing to clean up", key);
                    return Ok(Action::Done);
                };
                let last: K = serde_json::from_slice(&bytes)?;
                // With a finalizer the removal already ran before the object went away.
                if finalizer.is_some() && last.meta().is_deleting() {
                    return Ok(Action::Done);
                }
                self.handler.remove(last).await
            }
        }
    }

    async fn keys(&self) -> anyhow::Result<Vec<QueueKey>> {
        Ok(self
            .api
            .list(None)
            .await?
            .iter()
            .map(|obj| QueueKey::for_object(self.kind, obj))
            .collect())
    }
}

/// Timing and concurrency of the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub workers: usize,
    /// Delay before retrying a key whose handler failed.
    pub requeue_delay: Duration,
    /// Interval between full resyncs.
    pub resync_interval: Duration,
    /// Delay before retrying a binding whose cluster or project is missing.
    pub dependency_delay: Duration,
}

impl ControllerSettings {
    /// Rejects settings the controller cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.resync_interval.is_zero() {
            anyhow::bail!("resync interval must be non-zero");
        }
        Ok(())
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            requeue_delay: Duration::from_secs(ERROR_REQUEUE_SECS),
            resync_interval: Duration::from_secs(RESYNC_INTERVAL_SECS),
            dependency_delay: Duration::from_secs(DEPENDENCY_REQUEUE_SECS),
        }
    }
}

/// Delivers store changes to handlers through a shared work queue.
pub struct Controller {
    store: Store,
    queue: WorkQueue<QueueKey>,
    dispatchers: HashMap<Kind, Arc<dyn Dispatch>>,
    tombstones: Arc<DashMap<QueueKey, Vec<u8>>>,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(store: Store, settings: ControllerSettings) -> Self {
        Self {
            store,
            queue: WorkQueue::new(),
            dispatchers: HashMap::new(),
            tombstones: Arc::new(DashMap::new()),
            settings,
        }
    }

    pub fn queue(&self) -> WorkQueue<QueueKey> {
        self.queue.clone()
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Routes events for objects of `kind` to `handler`.
    pub fn register<K: Resource, H: Handler<K>>(&mut self, kind: Kind, handler: H) {
        let dispatch = TypedDispatch {
            kind,
            api: self.store.api::<K>(),
            handler,
            _kind: PhantomData,
        };
        self.dispatchers.insert(kind, Arc::new(dispatch));
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "AuthzController started (workers={}, resync={}s)",
                self.settings.workers,
                self.settings.resync_interval.as_secs()
            );
            let dispatchers = Arc::new(self.dispatchers);

            for id in 0..self.settings.workers.max(1) {
                tokio::spawn(worker(
                    id,
                    self.queue.clone(),
                    dispatchers.clone(),
                    self.tombstones.clone(),
                    self.settings.requeue_delay,
                ));
            }

            let mut events = self.store.event_log.subscribe();
            let mut resync = tokio::time::interval(self.settings.resync_interval);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            enqueue_event(&self.queue, &dispatchers, &self.tombstones, event).await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!("AuthzController missed {} events, resyncing", missed);
                            enqueue_all(&self.queue, &dispatchers).await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    // The first tick fires immediately and lists everything.
                    _ = resync.tick() => {
                        enqueue_all(&self.queue, &dispatchers).await;
                    }
                }
            }
            self.queue.shut_down().await;
            info!("AuthzController stopped");
        })
    }
}

async fn enqueue_event(
    queue: &WorkQueue<QueueKey>,
    dispatchers: &HashMap<Kind, Arc<dyn Dispatch>>,
    tombstones: &DashMap<QueueKey, Vec<u8>>,
    event: WatchEvent,
) {
    let Some(object) = event.object_ref() else {
        return;
    };
    let Some(kind) = Kind::from_plural(&object.plural) else {
        return;
    };
    if !dispatchers.contains_key(&kind) {
        return;
    }
    let key = QueueKey::new(kind, &object.namespace, &object.name);
    if event.event_type == EventType::Delete {
        if let Some(value) = event.value {
            tombstones.insert(key.clone(), value);
        }
    }
    queue.add(key).await;
}

async fn enqueue_all(queue: &WorkQueue<QueueKey>, dispatchers: &HashMap<Kind, Arc<dyn Dispatch>>) {
    for (kind, dispatch) in dispatchers {
        match dispatch.keys().await {
            Ok(keys) => {
                for key in keys {
                    queue.add(key).await;
                }
            }
            Err(e) => warn!("AuthzController failed to list {:?}: {}", kind, e),
        }
    }
}

async fn worker(
    id: usize,
    queue: WorkQueue<QueueKey>,
    dispatchers: Arc<HashMap<Kind, Arc<dyn Dispatch>>>,
    tombstones: Arc<DashMap<QueueKey, Vec<u8>>>,
    requeue_delay: Duration,
) {
    debug!("AuthzController worker {} started", id);
    while let Some(key) = queue.get().await {
        let Some(dispatch) = dispatchers.get(&key.kind) else {
            queue.done(&key).await;
            continue;
        };
        let tombstone = tombstones.get(&key).map(|t| t.value().clone());
        match dispatch.process(&key, tombstone).await {
            Ok(Action::Done) => {
                tombstones.remove(&key);
            }
            Ok(Action::RequeueAfter(delay)) => {
                debug!("Requeueing {} in {}s", key, delay.as_secs());
                queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                warn!("AuthzController reconcile error for {}: {:#}", key, e);
                queue.add_after(key.clone(), requeue_delay);
            }
        }
        queue.done(&key).await;
    }
    debug!("AuthzController worker {} stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_constants::labels::AUTHZ_FINALIZER;
    use pkg_types::cluster::Cluster;
    use pkg_types::roletemplate::RoleTemplateContext;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        fail_first: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Handler<Namespace> for Recorder {
        async fn sync(&self, obj: Namespace) -> anyhow::Result<Action> {
            let mut fail = self.fail_first.lock().await;
            if *fail {
                *fail = false;
                anyhow::bail!("transient");
            }
            self.calls.lock().await.push(format!("sync {}", obj.metadata.name));
            Ok(Action::Done)
        }

        async fn remove(&self, obj: Namespace) -> anyhow::Result<Action> {
            self.calls.lock().await.push(format!("remove {}", obj.metadata.name));
            Ok(Action::Done)
        }
    }

    #[derive(Clone, Default)]
    struct Finalizing {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler<RoleTemplate> for Finalizing {
        async fn sync(&self, obj: RoleTemplate) -> anyhow::Result<Action> {
            assert!(obj.metadata.has_finalizer(AUTHZ_FINALIZER));
            self.calls.lock().await.push(format!("sync {}", obj.metadata.name));
            Ok(Action::Done)
        }

        async fn remove(&self, obj: RoleTemplate) -> anyhow::Result<Action> {
            self.calls.lock().await.push(format!("remove {}", obj.metadata.name));
            Ok(Action::Done)
        }

        fn finalizer(&self) -> Option<&'static str> {
            Some(AUTHZ_FINALIZER)
        }
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            workers: 2,
            requeue_delay: Duration::from_millis(20),
            resync_interval: Duration::from_secs(3600),
            dependency_delay: Duration::from_millis(20),
        }
    }

    async fn wait_for(calls: &Arc<Mutex<Vec<String>>>, entry: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if calls.lock().await.iter().any(|c| c == entry) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", entry));
    }

    #[test]
    fn kinds_round_trip_through_plurals() {
        for kind in Kind::ALL {
            assert_eq!(Kind::from_plural(kind.plural()), Some(kind));
        }
        assert_eq!(Kind::from_plural("pods"), None);
        assert_eq!(
            QueueKey::new(Kind::ClusterRoleTemplateBinding, "c1", "crtb-a").to_string(),
            "ClusterRoleTemplateBinding c1/crtb-a"
        );
    }

    #[tokio::test]
    async fn events_reach_sync_and_tombstones_reach_remove() {
        let store = Store::in_memory();
        let recorder = Recorder::default();
        let mut controller = Controller::new(store.clone(), settings());
        controller.register(Kind::Namespace, recorder.clone());
        let handle = controller.start();

        let namespaces = store.api::<Namespace>();
        namespaces.create(&Namespace::new("ns1")).await.unwrap();
        wait_for(&recorder.calls, "sync ns1").await;

        namespaces.delete("", "ns1").await.unwrap();
        wait_for(&recorder.calls, "remove ns1").await;

        // Unregistered kinds are ignored.
        store.api::<Cluster>().create(&Cluster::new("c1")).await.unwrap();
        handle.abort();
    }

    #[tokio::test]
    async fn failed_syncs_are_retried() {
        let store = Store::in_memory();
        let recorder = Recorder::default();
        *recorder.fail_first.lock().await = true;
        let mut controller = Controller::new(store.clone(), settings());
        controller.register(Kind::Namespace, recorder.clone());
        let handle = controller.start();

        store.api::<Namespace>().create(&Namespace::new("ns1")).await.unwrap();
        wait_for(&recorder.calls, "sync ns1").await;
        handle.abort();
    }

    #[tokio::test]
    async fn finalizer_holds_object_until_removed() {
        let store = Store::in_memory();
        let handler = Finalizing::default();
        let mut controller = Controller::new(store.clone(), settings());
        controller.register(Kind::RoleTemplate, handler.clone());
        let handle = controller.start();

        let templates = store.api::<RoleTemplate>();
        let rt = RoleTemplate::new("view", RoleTemplateContext::Cluster, vec![]);
        templates.create(&rt).await.unwrap();
        wait_for(&handler.calls, "sync view").await;
        assert!(
            templates
                .get("", "view")
                .await
                .unwrap()
                .metadata
                .has_finalizer(AUTHZ_FINALIZER)
        );

        templates.delete("", "view").await.unwrap();
        wait_for(&handler.calls, "remove view").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while templates.get_opt("", "view").await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let removes = handler
            .calls
            .lock()
            .await
            .iter()
            .filter(|c| c.as_str() == "remove view")
            .count();
        assert_eq!(removes, 1);
        handle.abort();
    }
}
