use chrono::Utc;
use pkg_constants::state::REGISTRY_PREFIX;
use pkg_types::Resource;
use pkg_types::validate::validate_object_name;
use std::marker::PhantomData;
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;
use crate::store::Store;
use crate::watch::EventType;

/// Typed, resource-version checked access to objects of kind `K`.
///
/// Cluster-scoped kinds ignore the `namespace` argument.
pub struct Api<K> {
    store: Store,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> Api<K> {
    pub(crate) fn new(store: Store) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }

    /// Registry key of an object.
    pub fn key(namespace: &str, name: &str) -> String {
        if K::NAMESPACED {
            format!("{}{}/{}/{}", REGISTRY_PREFIX, K::PLURAL, namespace, name)
        } else {
            format!("{}{}/{}", REGISTRY_PREFIX, K::PLURAL, name)
        }
    }

    fn prefix(namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if K::NAMESPACED => format!("{}{}/{}/", REGISTRY_PREFIX, K::PLURAL, ns),
            _ => format!("{}{}/", REGISTRY_PREFIX, K::PLURAL),
        }
    }

    fn display_name(namespace: &str, name: &str) -> String {
        if K::NAMESPACED {
            format!("{}/{}", namespace, name)
        } else {
            name.to_string()
        }
    }

    fn decode(name: &str, bytes: &[u8]) -> Result<K, ApiError> {
        serde_json::from_slice(bytes).map_err(|source| ApiError::Serialization {
            kind: K::KIND,
            name: name.to_string(),
            source,
        })
    }

    fn encode(obj: &K) -> Result<Vec<u8>, ApiError> {
        serde_json::to_vec(obj).map_err(|source| ApiError::Serialization {
            kind: K::KIND,
            name: obj.meta().key(),
            source,
        })
    }

    pub async fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<K>, ApiError> {
        let key = Self::key(namespace, name);
        match self
            .store
            .backend()
            .get(&key)
            .await
            .map_err(ApiError::Storage)?
        {
            Some(bytes) => Ok(Some(Self::decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<K, ApiError> {
        self.get_opt(namespace, name)
            .await?
            .ok_or_else(|| ApiError::NotFound {
                kind: K::KIND,
                name: Self::display_name(namespace, name),
            })
    }

    /// All objects, or those in one namespace. Undecodable entries are skipped.
    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, ApiError> {
        let entries = self
            .store
            .backend()
            .list_prefix(&Self::prefix(namespace))
            .await
            .map_err(ApiError::Storage)?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| match Self::decode(&key, &value) {
                Ok(obj) => Some(obj),
                Err(e) => {
                    debug!("Skipping {}: {}", key, e);
                    None
                }
            })
            .collect())
    }

    /// Objects for which `pred` holds.
    pub async fn list_matching<F>(
        &self,
        namespace: Option<&str>,
        pred: F,
    ) -> Result<Vec<K>, ApiError>
    where
        F: Fn(&K) -> bool,
    {
        Ok(self
            .list(namespace)
            .await?
            .into_iter()
            .filter(|obj| pred(obj))
            .collect())
    }

    /// Objects carrying label `key=value`.
    pub async fn list_labeled(
        &self,
        namespace: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<Vec<K>, ApiError> {
        self.list_matching(namespace, |obj| {
            obj.meta().labels.get(key).map(String::as_str) == Some(value)
        })
        .await
    }

    fn validate(obj: &K) -> Result<(), ApiError> {
        let meta = obj.meta();
        let invalid = |reason: String| ApiError::Invalid {
            kind: K::KIND,
            name: meta.key(),
            reason,
        };
        validate_object_name(&meta.name).map_err(|e| invalid(e.to_string()))?;
        if K::NAMESPACED {
            validate_object_name(&meta.namespace)
                .map_err(|e| invalid(format!("namespace: {}", e)))?;
        } else if !meta.namespace.is_empty() {
            return Err(invalid("cluster-scoped objects have no namespace".to_string()));
        }
        Ok(())
    }

    /// Create a new object. Assigns uid, resource version and creation time.
    pub async fn create(&self, obj: &K) -> Result<K, ApiError> {
        Self::validate(obj)?;
        let meta = obj.meta();
        let key = Self::key(&meta.namespace, &meta.name);

        let _guard = self.store.write_lock().lock().await;
        let backend = self.store.backend();
        if backend.get(&key).await.map_err(ApiError::Storage)?.is_some() {
            return Err(ApiError::AlreadyExists {
                kind: K::KIND,
                name: meta.key(),
            });
        }

        let mut created = obj.clone();
        let m = created.meta_mut();
        if m.uid.is_empty() {
            m.uid = Uuid::new_v4().to_string();
        }
        m.resource_version = 1;
        m.created_at = Some(Utc::now());
        m.deletion_timestamp = None;

        let data = Self::encode(&created)?;
        backend.put(&key, &data).await.map_err(ApiError::Storage)?;
        self.store
            .event_log
            .emit(EventType::Put, key, Some(data))
            .await;
        Ok(created)
    }

    /// Replace an object. Fails with `Conflict` if `obj` carries a stale
    /// resource version. A deleting object whose last finalizer is removed
    /// is deleted.
    pub async fn update(&self, obj: &K) -> Result<K, ApiError> {
        let meta = obj.meta();
        let key = Self::key(&meta.namespace, &meta.name);

        let _guard = self.store.write_lock().lock().await;
        let backend = self.store.backend();
        let current = match backend.get(&key).await.map_err(ApiError::Storage)? {
            Some(bytes) => Self::decode(&key, &bytes)?,
            None => {
                return Err(ApiError::NotFound {
                    kind: K::KIND,
                    name: meta.key(),
                });
            }
        };
        let current_meta = current.meta();
        if current_meta.resource_version != meta.resource_version {
            return Err(ApiError::Conflict {
                kind: K::KIND,
                name: meta.key(),
                expected: meta.resource_version,
                current: current_meta.resource_version,
            });
        }

        let mut updated = obj.clone();
        let m = updated.meta_mut();
        m.uid = current_meta.uid.clone();
        m.created_at = current_meta.created_at;
        m.deletion_timestamp = current_meta.deletion_timestamp;
        m.resource_version = current_meta.resource_version + 1;

        let data = Self::encode(&updated)?;
        if updated.meta().is_deleting() && updated.meta().finalizers.is_empty() {
            backend.delete(&key).await.map_err(ApiError::Storage)?;
            self.store
                .event_log
                .emit(EventType::Delete, key, Some(data))
                .await;
        } else {
            backend.put(&key, &data).await.map_err(ApiError::Storage)?;
            self.store
                .event_log
                .emit(EventType::Put, key, Some(data))
                .await;
        }
        Ok(updated)
    }

    /// Write back an object after changing only its status. Same
    /// resource-version rules as `update`; metadata changes other than the
    /// version bump are discarded.
    pub async fn update_status(&self, obj: &K) -> Result<K, ApiError> {
        let meta = obj.meta();
        let key = Self::key(&meta.namespace, &meta.name);

        let _guard = self.store.write_lock().lock().await;
        let backend = self.store.backend();
        let current = match backend.get(&key).await.map_err(ApiError::Storage)? {
            Some(bytes) => Self::decode(&key, &bytes)?,
            None => {
                return Err(ApiError::NotFound {
                    kind: K::KIND,
                    name: meta.key(),
                });
            }
        };
        if current.meta().resource_version != meta.resource_version {
            return Err(ApiError::Conflict {
                kind: K::KIND,
                name: meta.key(),
                expected: meta.resource_version,
                current: current.meta().resource_version,
            });
        }

        let mut updated = obj.clone();
        let mut stored_meta = current.meta().clone();
        stored_meta.resource_version += 1;
        *updated.meta_mut() = stored_meta;

        let data = Self::encode(&updated)?;
        backend.put(&key, &data).await.map_err(ApiError::Storage)?;
        self.store
            .event_log
            .emit(EventType::Put, key, Some(data))
            .await;
        Ok(updated)
    }

    /// Delete an object. With finalizers present the object is only marked
    /// with a deletion timestamp.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let key = Self::key(namespace, name);

        let _guard = self.store.write_lock().lock().await;
        let backend = self.store.backend();
        let mut current = match backend.get(&key).await.map_err(ApiError::Storage)? {
            Some(bytes) => Self::decode(&key, &bytes)?,
            None => {
                return Err(ApiError::NotFound {
                    kind: K::KIND,
                    name: Self::display_name(namespace, name),
                });
            }
        };

        if current.meta().finalizers.is_empty() {
            backend.delete(&key).await.map_err(ApiError::Storage)?;
            let data = Self::encode(&current)?;
            self.store
                .event_log
                .emit(EventType::Delete, key, Some(data))
                .await;
            return Ok(());
        }

        if current.meta().is_deleting() {
            return Ok(());
        }
        let m = current.meta_mut();
        m.deletion_timestamp = Some(Utc::now());
        m.resource_version += 1;
        let data = Self::encode(&current)?;
        backend.put(&key, &data).await.map_err(ApiError::Storage)?;
        self.store
            .event_log
            .emit(EventType::Put, key, Some(data))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::ObjectMeta;
    use pkg_types::rbac::{ClusterRole, PolicyRule, Role};

    fn role(ns: &str, name: &str) -> Role {
        Role {
            metadata: ObjectMeta::namespaced(ns, name),
            rules: vec![PolicyRule::new(&[""], &["pods"], &["get"])],
        }
    }

    #[tokio::test]
    async fn create_get_list() {
        let store = Store::in_memory();
        let roles = store.api::<Role>();

        let created = roles.create(&role("ns1", "a")).await.unwrap();
        assert_eq!(created.metadata.resource_version, 1);
        assert!(!created.metadata.uid.is_empty());
        roles.create(&role("ns1", "b")).await.unwrap();
        roles.create(&role("ns2", "a")).await.unwrap();

        assert_eq!(roles.list(None).await.unwrap().len(), 3);
        assert_eq!(roles.list(Some("ns1")).await.unwrap().len(), 2);
        assert_eq!(roles.get("ns2", "a").await.unwrap().metadata.namespace, "ns2");
        assert!(roles.get("ns3", "a").await.unwrap_err().is_not_found());
        assert!(roles.get_opt("ns3", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let store = Store::in_memory();
        let roles = store.api::<Role>();
        roles.create(&role("ns1", "a")).await.unwrap();
        let err = roles.create(&role("ns1", "a")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = Store::in_memory();
        let roles = store.api::<Role>();
        let created = roles.create(&role("ns1", "a")).await.unwrap();

        let mut first = created.clone();
        first.rules.clear();
        let updated = roles.update(&first).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);
        assert_eq!(updated.metadata.uid, created.metadata.uid);

        let err = roles.update(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn invalid_objects_are_rejected() {
        let store = Store::in_memory();
        let err = store.api::<Role>().create(&role("", "a")).await.unwrap_err();
        assert!(matches!(err, ApiError::Invalid { .. }));

        let scoped = ClusterRole {
            metadata: ObjectMeta::namespaced("ns1", "view"),
            rules: vec![],
        };
        let err = store.api::<ClusterRole>().create(&scoped).await.unwrap_err();
        assert!(matches!(err, ApiError::Invalid { .. }));
    }

    #[tokio::test]
    async fn status_writes_keep_stored_metadata() {
        let store = Store::in_memory();
        let roles = store.api::<Role>();
        let created = roles.create(&role("ns1", "a")).await.unwrap();

        let mut changed = created.clone();
        changed.metadata.labels.insert("ignored".to_string(), "x".to_string());
        changed.rules.clear();
        let written = roles.update_status(&changed).await.unwrap();
        assert_eq!(written.metadata.resource_version, 2);
        assert!(written.metadata.labels.is_empty());
        assert!(written.rules.is_empty());

        assert!(roles.update_status(&created).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn list_matching_filters() {
        let store = Store::in_memory();
        let roles = store.api::<Role>();
        let mut labeled = role("ns1", "a");
        labeled.metadata.labels.insert("team".to_string(), "x".to_string());
        roles.create(&labeled).await.unwrap();
        roles.create(&role("ns1", "b")).await.unwrap();

        let found = roles.list_labeled(None, "team", "x").await.unwrap();
        assert_eq!(found.len(), 1);
        let found = roles
            .list_matching(Some("ns1"), |r| r.metadata.name == "b")
            .await
            .unwrap();
        assert_eq!(found[0].metadata.name, "b");
    }

    #[tokio::test]
    async fn finalizers_defer_deletion() {
        let store = Store::in_memory();
        let roles = store.api::<Role>();
        let mut r = role("ns1", "a");
        r.metadata.finalizers.push("test/cleanup".to_string());
        roles.create(&r).await.unwrap();

        roles.delete("ns1", "a").await.unwrap();
        let mut deleting = roles.get("ns1", "a").await.unwrap();
        assert!(deleting.metadata.is_deleting());

        deleting.metadata.remove_finalizer("test/cleanup");
        roles.update(&deleting).await.unwrap();
        assert!(roles.get_opt("ns1", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_emit_events_with_tombstones() {
        let store = Store::in_memory();
        let roles = store.api::<Role>();
        let before = store.event_log.current_seq().await;
        roles.create(&role("ns1", "a")).await.unwrap();
        roles.delete("ns1", "a").await.unwrap();
        assert!(roles.delete("ns1", "a").await.unwrap_err().is_not_found());

        let events = store.event_log.events_since(before).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EventType::Delete);
        let tombstone: Role = serde_json::from_slice(events[1].value.as_ref().unwrap()).unwrap();
        assert_eq!(tombstone.metadata.name, "a");
        assert_eq!(events[1].key, "/registry/roles/ns1/a");
    }
}
