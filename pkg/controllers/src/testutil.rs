//! Fixtures shared by the unit tests of this crate.

use async_trait::async_trait;
use pkg_constants::labels::{GRANT_LABEL, GRANT_ROLE_TEMPLATE, RBAC_API_GROUP};
use pkg_state::Store;
use pkg_state::backend::Backend;
use pkg_state::memory::MemoryStore;
use pkg_types::binding::{ClusterRoleTemplateBinding, ProjectRoleTemplateBinding};
use pkg_types::rbac::{ClusterRoleBinding, PolicyRule, RoleRef, RoleRefKind, Subject, SubjectKind};
use pkg_types::roletemplate::{RoleTemplate, RoleTemplateContext};
use pkg_types::{ObjectMeta, Resource};
use std::collections::HashSet;
use std::sync::Mutex;

pub async fn seed<K: Resource>(store: &Store, obj: K) -> K {
    store.api::<K>().create(&obj).await.unwrap()
}

pub fn cluster_template(name: &str) -> RoleTemplate {
    RoleTemplate::new(
        name,
        RoleTemplateContext::Cluster,
        vec![PolicyRule::new(&[""], &["pods"], &["get"])],
    )
}

pub fn project_template(name: &str) -> RoleTemplate {
    RoleTemplate::new(
        name,
        RoleTemplateContext::Project,
        vec![PolicyRule::new(&["apps"], &["deployments"], &["get", "update"])],
    )
}

pub fn inheriting(rt: RoleTemplate, names: &[&str]) -> RoleTemplate {
    rt.inheriting(names)
}

pub fn crtb(cluster: &str, name: &str, user: &str, template: &str) -> ClusterRoleTemplateBinding {
    ClusterRoleTemplateBinding {
        metadata: ObjectMeta::namespaced(cluster, name),
        user_name: user.to_string(),
        role_template_name: template.to_string(),
        cluster_name: cluster.to_string(),
        ..Default::default()
    }
}

pub fn prtb(
    cluster: &str,
    project: &str,
    name: &str,
    user: &str,
    template: &str,
) -> ProjectRoleTemplateBinding {
    ProjectRoleTemplateBinding {
        metadata: ObjectMeta::namespaced(project, name),
        user_name: user.to_string(),
        role_template_name: template.to_string(),
        project_name: format!("{}:{}", cluster, project),
        ..Default::default()
    }
}

pub fn user(name: &str) -> Subject {
    Subject {
        kind: SubjectKind::User,
        name: name.to_string(),
        namespace: String::new(),
        api_group: RBAC_API_GROUP.to_string(),
    }
}

/// A role-template ClusterRoleBinding owned by `owner_keys`.
pub fn crb(name: &str, role: &str, subject: Subject, owner_keys: &[&str]) -> ClusterRoleBinding {
    let mut metadata = ObjectMeta::named(name).with_label(GRANT_LABEL, GRANT_ROLE_TEMPLATE);
    for key in owner_keys {
        metadata.labels.insert(key.to_string(), "true".to_string());
    }
    ClusterRoleBinding {
        metadata,
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: RoleRefKind::ClusterRole,
            name: role.to_string(),
        },
        subjects: vec![subject],
    }
}

/// Memory backend where selected keys change under the reader: every get
/// of a drifting key bumps its stored resource version first, so every
/// write to it conflicts.
#[derive(Default)]
pub struct DriftingBackend {
    inner: MemoryStore,
    drifting: Mutex<HashSet<String>>,
}

impl DriftingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drift(&self, key: &str) {
        self.drifting.lock().unwrap().insert(key.to_string());
    }
}

#[async_trait]
impl Backend for DriftingBackend {
    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let drifting = self.drifting.lock().unwrap().contains(key);
        let Some(bytes) = self.inner.get(key).await? else {
            return Ok(None);
        };
        if !drifting {
            return Ok(Some(bytes));
        }
        let mut value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let version = value["metadata"]["resource_version"].as_u64().unwrap_or(0);
        value["metadata"]["resource_version"] = serde_json::json!(version + 1);
        let bumped = serde_json::to_vec(&value)?;
        self.inner.put(key, &bumped).await?;
        Ok(Some(bumped))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.inner.delete(key).await
    }

    async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        self.inner.list_prefix(prefix).await
    }
}

/// Memory backend that refuses to delete selected keys.
#[derive(Default)]
pub struct StuckBackend {
    inner: MemoryStore,
    stuck: Mutex<HashSet<String>>,
}

impl StuckBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stick(&self, key: &str) {
        self.stuck.lock().unwrap().insert(key.to_string());
    }
}

#[async_trait]
impl Backend for StuckBackend {
    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        if self.stuck.lock().unwrap().contains(key) {
            anyhow::bail!("storage refused to delete {}", key);
        }
        self.inner.delete(key).await
    }

    async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        self.inner.list_prefix(prefix).await
    }
}
