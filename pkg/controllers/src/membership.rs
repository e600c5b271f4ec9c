use anyhow::Context;
use pkg_constants::labels::{
    CLUSTER_NAME_ANNOTATION, CLUSTERS_RESOURCE, GRANT_MEMBERSHIP, MANAGEMENT_API_GROUP,
    PROJECTS_RESOURCE,
};
use pkg_state::{Api, Store};
use pkg_types::rbac::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRefKind, Subject,
};
use pkg_types::{ObjectMeta, Resource};
use tracing::{debug, info};

use crate::bindings::{BindingReconciler, NativeBinding, desired_binding, rbac_role_ref};
use crate::error::join_errors;
use crate::naming::safe_concat_name;
use crate::ownership::{OwnershipTracker, carry_owner_labels, claim};
use crate::retry::update_with_retry;

/// ClusterRole granting visibility of a cluster.
pub fn cluster_membership_role(cluster: &str, owner: bool) -> String {
    let suffix = if owner { "clusterowner" } else { "clustermember" };
    safe_concat_name(&[cluster, suffix])
}

/// Role, in the cluster namespace, granting visibility of a project.
pub fn project_membership_role(project: &str, owner: bool) -> String {
    let suffix = if owner { "projectowner" } else { "projectmember" };
    safe_concat_name(&[project, suffix])
}

fn membership_rule(resource: &str, name: &str, owner: bool) -> PolicyRule {
    let verb = if owner { "*" } else { "get" };
    PolicyRule::new(&[MANAGEMENT_API_GROUP], &[resource], &[verb]).with_resource_names(&[name])
}

/// Whether an upsert wrote anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Replaced,
    Labeled,
    Unchanged,
}

/// Grants subjects visibility of the cluster or project a role template
/// binding points at.
#[derive(Clone)]
pub struct MembershipBindingManager {
    cluster_roles: Api<ClusterRole>,
    roles: Api<Role>,
    crbs: BindingReconciler<ClusterRoleBinding>,
    rbs: BindingReconciler<RoleBinding>,
    ownership: OwnershipTracker,
}

impl MembershipBindingManager {
    pub fn new(store: &Store, ownership: OwnershipTracker) -> Self {
        Self {
            cluster_roles: store.api(),
            roles: store.api(),
            crbs: BindingReconciler::new(store, ownership.clone(), GRANT_MEMBERSHIP),
            rbs: BindingReconciler::new(store, ownership.clone(), GRANT_MEMBERSHIP),
            ownership,
        }
    }

    async fn ensure_cluster_role(&self, cluster: &str, owner: bool) -> anyhow::Result<String> {
        let name = cluster_membership_role(cluster, owner);
        let rules = vec![membership_rule(CLUSTERS_RESOURCE, cluster, owner)];
        match self.cluster_roles.get_opt("", &name).await? {
            Some(existing) if existing.rules == rules => {}
            Some(existing) => {
                info!("Updating clusterRole {}", name);
                update_with_retry(&self.cluster_roles, existing, |cr| {
                    if cr.rules == rules {
                        return false;
                    }
                    cr.rules = rules.clone();
                    true
                })
                .await?;
            }
            None => {
                info!("Creating clusterRole {}", name);
                let role = ClusterRole {
                    metadata: ObjectMeta::named(name.as_str())
                        .with_annotation(CLUSTER_NAME_ANNOTATION, cluster),
                    rules,
                };
                if let Err(e) = self.cluster_roles.create(&role).await {
                    if !e.is_already_exists() {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(name)
    }

    async fn ensure_project_role(
        &self,
        cluster: &str,
        project: &str,
        owner: bool,
    ) -> anyhow::Result<String> {
        let name = project_membership_role(project, owner);
        let rules = vec![membership_rule(PROJECTS_RESOURCE, project, owner)];
        match self.roles.get_opt(cluster, &name).await? {
            Some(existing) if existing.rules == rules => {}
            Some(existing) => {
                info!("Updating role {}/{}", cluster, name);
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
                info!("Creating role {}/{}", cluster, name);
                let role = Role {
                    metadata: ObjectMeta::namespaced(cluster, name.as_str())
                        .with_annotation(CLUSTER_NAME_ANNOTATION, cluster),
                    rules,
                };
                if let Err(e) = self.roles.create(&role).await {
                    if !e.is_already_exists() {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(name)
    }

    /// Ensures `subject` can see `cluster` on behalf of `owner`. Moving
    /// between member and owner releases `owner` from the other binding.
    pub async fn ensure_cluster_membership(
        &self,
        cluster: &str,
        owner: &ObjectMeta,
        subject: &Subject,
        is_owner: bool,
    ) -> anyhow::Result<Upsert> {
        let role = self.ensure_cluster_role(cluster, is_owner).await?;
        let role_ref = rbac_role_ref(RoleRefKind::ClusterRole, &role);
        let mut desired: ClusterRoleBinding =
            desired_binding("", role_ref, subject, owner, GRANT_MEMBERSHIP);
        desired
            .metadata
            .annotations
            .insert(CLUSTER_NAME_ANNOTATION.to_string(), cluster.to_string());
        let result = upsert(self.crbs.api(), desired, owner).await.with_context(|| {
            format!("couldn't ensure membership of {} in cluster {}", owner.key(), cluster)
        })?;

        let other = rbac_role_ref(
            RoleRefKind::ClusterRole,
            &cluster_membership_role(cluster, !is_owner),
        );
        let other_name = ClusterRoleBinding::binding_name("", &other, subject);
        if let Some(previous) = self.crbs.api().get_opt("", &other_name).await? {
            self.ownership.release(self.crbs.api(), previous, owner).await?;
        }
        Ok(result)
    }

    /// Ensures `subject` can see `project`, and is at least a member of the
    /// owning cluster.
    pub async fn ensure_project_membership(
        &self,
        cluster: &str,
        project: &str,
        owner: &ObjectMeta,
        subject: &Subject,
        is_owner: bool,
    ) -> anyhow::Result<Upsert> {
        let role = self.ensure_project_role(cluster, project, is_owner).await?;
        let role_ref = rbac_role_ref(RoleRefKind::Role, &role);
        let desired: RoleBinding =
            desired_binding(cluster, role_ref, subject, owner, GRANT_MEMBERSHIP);
        let result = upsert(self.rbs.api(), desired, owner).await.with_context(|| {
            format!("couldn't ensure membership of {} in project {}", owner.key(), project)
        })?;

        let other = rbac_role_ref(RoleRefKind::Role, &project_membership_role(project, !is_owner));
        let other_name = RoleBinding::binding_name(cluster, &other, subject);
        if let Some(previous) = self.rbs.api().get_opt(cluster, &other_name).await? {
            self.ownership.release(self.rbs.api(), previous, owner).await?;
        }

        self.ensure_cluster_membership(cluster, owner, subject, false).await?;
        Ok(result)
    }

    /// Releases `owner` from every membership binding it holds.
    pub async fn remove_owner(&self, owner: &ObjectMeta) -> anyhow::Result<()> {
        let errors = [
            self.crbs.remove_owner(None, owner).await,
            self.rbs.remove_owner(None, owner).await,
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();
        join_errors(errors)
    }

    /// Deletes the membership Roles of a project.
    pub async fn remove_project_roles(&self, cluster: &str, project: &str) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        for owner in [true, false] {
            let name = project_membership_role(project, owner);
            match self.roles.delete(cluster, &name).await {
                Ok(()) => info!("Deleting role {}/{}", cluster, name),
                Err(e) if e.is_not_found() => {}
                Err(e) => errors.push(e.into()),
            }
        }
        join_errors(errors)
    }
}

/// Create-or-fix for a single binding with a known name.
async fn upsert<B: NativeBinding>(
    api: &Api<B>,
    desired: B,
    owner: &ObjectMeta,
) -> anyhow::Result<Upsert> {
    let namespace = desired.namespace().to_string();
    let name = desired.name().to_string();
    let key = desired.meta().key();

    let existing = match api.get_opt(&namespace, &name).await? {
        Some(existing) => existing,
        None => match api.create(&desired).await {
            Ok(_) => {
                info!("Creating {} {} for {}", B::KIND, key, owner.key());
                return Ok(Upsert::Created);
            }
            Err(e) if e.is_already_exists() => api.get(&namespace, &name).await?,
            Err(e) => return Err(e.into()),
        },
    };

    if existing.role_ref() != desired.role_ref() || existing.subjects() != desired.subjects() {
        info!("Recreating {} {}, its role or subject changed", B::KIND, key);
        let mut desired = desired;
        carry_owner_labels(existing.meta(), desired.meta_mut());
        if let Err(e) = api.delete(&namespace, &name).await {
            if !e.is_not_found() {
                return Err(e.into());
            }
        }
        api.create(&desired).await?;
        return Ok(Upsert::Replaced);
    }

    let grant = GRANT_MEMBERSHIP;
    let mut probe = existing.meta().clone();
    if !claim(&mut probe, owner, grant) {
        debug!("{} {} already grants membership to {}", B::KIND, key, owner.key());
        return Ok(Upsert::Unchanged);
    }
    info!("Adding owner {} to {} {}", owner.key(), B::KIND, key);
    update_with_retry(api, existing, |b| claim(b.meta_mut(), owner, grant)).await?;
    Ok(Upsert::Labeled)
}
