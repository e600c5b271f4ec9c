use anyhow::Context;
use pkg_constants::labels::CLUSTER_ROLE_OWNER_ANNOTATION;
use pkg_state::{Api, Store};
use pkg_types::ObjectMeta;
use pkg_types::cluster::{Cluster, Project};
use pkg_types::rbac::{ClusterRole, PolicyRule, Role};
use pkg_types::roletemplate::{RoleTemplate, RoleTemplateContext};
use tracing::{debug, info};

use crate::cluster_indexed::is_cluster_indexed_role;
use crate::error::join_errors;
use crate::inheritance::{RoleInheritanceResolver, RoleSet};
use crate::retry::update_with_retry;

fn owned_by_template(meta: &ObjectMeta, template: &str) -> bool {
    meta.annotations
        .get(CLUSTER_ROLE_OWNER_ANNOTATION)
        .map(String::as_str)
        == Some(template)
}

/// Keeps native ClusterRoles (and existing namespaced Roles) in sync with
/// role template rules.
#[derive(Clone)]
pub struct ClusterRoleSynchronizer {
    cluster_roles: Api<ClusterRole>,
    roles: Api<Role>,
    clusters: Api<Cluster>,
    projects: Api<Project>,
    resolver: RoleInheritanceResolver,
}

impl ClusterRoleSynchronizer {
    pub fn new(store: &Store, resolver: RoleInheritanceResolver) -> Self {
        Self {
            cluster_roles: store.api(),
            roles: store.api(),
            clusters: store.api(),
            projects: store.api(),
            resolver,
        }
    }

    /// Ensures a ClusterRole per non-external template in `roles`.
    pub async fn ensure_roles(&self, roles: &RoleSet) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        for rt in roles.values().filter(|rt| !rt.external) {
            if let Err(e) = self.ensure_cluster_role(&rt.metadata.name, &rt.rules).await {
                errors.push(e);
            }
        }
        join_errors(errors)
    }

    async fn ensure_cluster_role(&self, name: &str, rules: &[PolicyRule]) -> anyhow::Result<()> {
        if let Some(existing) = self.cluster_roles.get_opt("", name).await? {
            if existing.rules == rules {
                debug!("ClusterRole {} is up to date", name);
                return Ok(());
            }
            info!("Updating clusterRole {}", name);
            update_with_retry(&self.cluster_roles, existing, |cr| {
                if cr.rules == rules {
                    return false;
                }
                cr.rules = rules.to_vec();
                true
            })
            .await
            .with_context(|| format!("couldn't update clusterRole {}", name))?;
            return Ok(());
        }

        let role = ClusterRole {
            metadata: ObjectMeta::named(name).with_annotation(CLUSTER_ROLE_OWNER_ANNOTATION, name),
            rules: rules.to_vec(),
        };
        info!("Creating clusterRole {}", name);
        match self.cluster_roles.create(&role).await {
            Err(e) if !e.is_already_exists() => {
                Err(anyhow::Error::from(e).context(format!("couldn't create clusterRole {}", name)))
            }
            _ => Ok(()),
        }
    }

    /// Namespaces holding Roles named after templates of `context`: cluster
    /// namespaces for cluster templates, project namespaces otherwise.
    async fn namespaces_for(&self, context: RoleTemplateContext) -> anyhow::Result<Vec<String>> {
        Ok(match context {
            RoleTemplateContext::Cluster => self
                .clusters
                .list(None)
                .await?
                .into_iter()
                .map(|c| c.metadata.name)
                .collect(),
            RoleTemplateContext::Project => self
                .projects
                .list(None)
                .await?
                .into_iter()
                .map(|p| p.metadata.name)
                .collect(),
        })
    }

    /// Brings existing Roles named after `rt` up to date with its rules.
    /// Roles are never created here. Owner templates and templates with
    /// non-resource rules are skipped, as are cluster-indexed Roles.
    pub async fn refresh_namespaced_roles(&self, rt: &RoleTemplate) -> anyhow::Result<usize> {
        if rt.external || rt.rules.iter().any(|r| !r.non_resource_urls.is_empty()) {
            return Ok(0);
        }
        if self.resolver.is_owner_role(&rt.metadata.name, rt.context).await? {
            return Ok(0);
        }

        let rules: Vec<PolicyRule> = rt.rules.iter().map(PolicyRule::to_lowercase).collect();
        let mut updated = 0;
        let mut errors = Vec::new();
        for ns in self.namespaces_for(rt.context).await? {
            let Some(role) = self.roles.get_opt(&ns, &rt.metadata.name).await? else {
                continue;
            };
            if is_cluster_indexed_role(&role.metadata) || role.rules == rules {
                continue;
            }
            info!("Updating role {}/{}", ns, rt.metadata.name);
            let result = update_with_retry(&self.roles, role, |r| {
                if r.rules == rules {
                    return false;
                }
                r.rules = rules.clone();
                true
            })
            .await;
            match result {
                Ok(_) => updated += 1,
                Err(e) => {
                    let context = format!("couldn't update role {}/{}", ns, rt.metadata.name);
                    errors.push(e.context(context));
                }
            }
        }
        join_errors(errors)?;
        Ok(updated)
    }

    /// Deletes ClusterRoles produced by `template`, and the cluster-indexed
    /// Roles derived from it.
    pub async fn remove_orphaned(&self, template: &str) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let orphans = self
            .cluster_roles
            .list_matching(None, |cr| owned_by_template(&cr.metadata, template))
            .await?;
        for cr in orphans {
            info!("Deleting clusterRole {}, role template {} is gone", cr.metadata.name, template);
            if let Err(e) = self.cluster_roles.delete("", &cr.metadata.name).await {
                if !e.is_not_found() {
                    errors.push(e.into());
                }
            }
        }

        let indexed = self
            .roles
            .list_matching(None, |r| {
                owned_by_template(&r.metadata, template)
                    && is_cluster_indexed_role(&r.metadata)
            })
            .await?;
        for role in indexed {
            info!("Deleting role {}, role template {} is gone", role.metadata.key(), template);
            if let Err(e) = self
                .roles
                .delete(&role.metadata.namespace, &role.metadata.name)
                .await
            {
                if !e.is_not_found() {
                    errors.push(e.into());
                }
            }
        }
        join_errors(errors)
    }
}
