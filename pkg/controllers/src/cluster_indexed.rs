use dashmap::DashMap;
use pkg_constants::labels::{CLUSTER_ROLE_OWNER_ANNOTATION, GRANT_CLUSTER_INDEXED, GRANT_LABEL};
use pkg_state::{Api, Store};
use pkg_types::ObjectMeta;
use pkg_types::rbac::{PolicyRule, Role, RoleBinding, RoleRefKind, Subject};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bindings::{BindingChanges, BindingReconciler};
use crate::inheritance::RoleSet;
use crate::ownership::OwnershipTracker;
use crate::resource_match::ResourceMatchRegistry;
use crate::retry::update_with_retry;

/// Whether a Role was generated for cluster-indexed resources.
pub fn is_cluster_indexed_role(meta: &ObjectMeta) -> bool {
    meta.labels.get(GRANT_LABEL).map(String::as_str) == Some(GRANT_CLUSTER_INDEXED)
}

/// Per-cluster Roles over cluster-indexed resources.
///
/// A cluster binding whose templates grant access to a cluster-indexed kind
/// gets a Role named after the template in the cluster namespace, holding
/// only those rules, plus a RoleBinding to it.
#[derive(Clone)]
pub struct ClusterIndexedRoles {
    roles: Api<Role>,
    bindings: BindingReconciler<RoleBinding>,
    registry: ResourceMatchRegistry,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ClusterIndexedRoles {
    pub fn new(
        store: &Store,
        ownership: OwnershipTracker,
        registry: ResourceMatchRegistry,
    ) -> Self {
        Self {
            roles: store.api(),
            bindings: BindingReconciler::new(store, ownership, GRANT_CLUSTER_INDEXED),
            registry,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, cluster: &str) -> Arc<Mutex<()>> {
        self.locks.entry(cluster.to_string()).or_default().clone()
    }

    /// Computes and applies the cluster-indexed Role of `template` in
    /// `cluster` and binds `subject` to it. Returns the binding changes.
    pub async fn ensure(
        &self,
        cluster: &str,
        template: &str,
        roles: &RoleSet,
        owner: &ObjectMeta,
        subject: &Subject,
    ) -> anyhow::Result<BindingChanges> {
        let lock = self.lock_for(cluster);
        let _guard = lock.lock().await;

        let all_rules: Vec<PolicyRule> = roles
            .values()
            .flat_map(|rt| {
                if rt.external {
                    rt.external_rules.clone().unwrap_or_default()
                } else {
                    rt.rules.clone()
                }
            })
            .collect();
        let rules = self.registry.matching_rules(&all_rules).await;

        if rules.is_empty() {
            self.delete_role(cluster, template).await?;
            let none: [&str; 0] = [];
            return self
                .bindings
                .ensure_bindings(cluster, RoleRefKind::Role, none, owner, subject)
                .await;
        }

        self.apply_role(cluster, template, rules).await?;
        self.bindings
            .ensure_bindings(cluster, RoleRefKind::Role, [template], owner, subject)
            .await
    }

    async fn apply_role(
        &self,
        cluster: &str,
        template: &str,
        rules: Vec<PolicyRule>,
    ) -> anyhow::Result<()> {
        match self.roles.get_opt(cluster, template).await? {
            Some(existing) => {
                if !is_cluster_indexed_role(&existing.metadata) {
                    anyhow::bail!(
                        "role {}/{} exists and is not cluster-indexed",
                        cluster,
                        template
                    );
                }
                if existing.rules == rules {
                    debug!("Cluster-indexed role {}/{} is up to date", cluster, template);
                    return Ok(());
                }
                info!("Updating cluster-indexed role {}/{}", cluster, template);
                update_with_retry(&self.roles, existing, |r| {
                    if r.rules == rules {
                        return false;
                    }
                    r.rules = rules.clone();
                    true
                })
                .await?;
            }
            None => {
                info!("Creating cluster-indexed role {}/{}", cluster, template);
                let role = Role {
                    metadata: ObjectMeta::namespaced(cluster, template)
                        .with_label(GRANT_LABEL, GRANT_CLUSTER_INDEXED)
                        .with_annotation(CLUSTER_ROLE_OWNER_ANNOTATION, template),
                    rules,
                };
                if let Err(e) = self.roles.create(&role).await {
                    if !e.is_already_exists() {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete_role(&self, cluster: &str, template: &str) -> anyhow::Result<()> {
        let Some(existing) = self.roles.get_opt(cluster, template).await? else {
            return Ok(());
        };
        if !is_cluster_indexed_role(&existing.metadata) {
            return Ok(());
        }
        info!("Deleting cluster-indexed role {}/{}, no indexed rules remain", cluster, template);
        match self.roles.delete(cluster, template).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub async fn remove_owner(&self, owner: &ObjectMeta) -> anyhow::Result<()> {
        self.bindings.remove_owner(None, owner).await
    }
}
