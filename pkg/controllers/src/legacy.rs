use pkg_constants::labels::{
    ADMIN_GLOBAL_ROLE_CHECKED_ANNOTATION, CLUSTER_ADMIN_ROLE, CREATE_NS_ROLE, GRANT_LABEL,
};
use pkg_state::{Api, Store};
use pkg_types::globalrole::{GlobalRole, GlobalRoleBinding};
use pkg_types::rbac::{ClusterRoleBinding, Subject, SubjectKind};
use regex::Regex;
use tracing::{debug, info};

use crate::ownership::OwnershipTracker;
use crate::retry::update_with_retry;

/// Names generated by the previous binding scheme.
const LEGACY_NAME_PATTERN: &str = "^(crb|clusterrolebinding)-[a-z0-9]{5}$";

/// Per-namespace roles the previous scheme bound cluster-wide.
const LEGACY_ROLE_PATTERN: &str = "^p-[a-z0-9]+-namespaces-(readonly|edit)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    Deleted,
    /// The admin check ran; the value is what was recorded.
    AdminChecked(bool),
    Kept,
}

/// Sweeps ClusterRoleBindings left behind by the previous naming scheme.
#[derive(Clone)]
pub struct LegacyCrbCleaner {
    crbs: Api<ClusterRoleBinding>,
    global_roles: Api<GlobalRole>,
    global_role_bindings: Api<GlobalRoleBinding>,
    ownership: OwnershipTracker,
    legacy_name: Regex,
    legacy_role: Regex,
}

impl LegacyCrbCleaner {
    pub fn new(store: &Store, ownership: OwnershipTracker) -> anyhow::Result<Self> {
        Ok(Self {
            crbs: store.api(),
            global_roles: store.api(),
            global_role_bindings: store.api(),
            ownership,
            legacy_name: Regex::new(LEGACY_NAME_PATTERN)?,
            legacy_role: Regex::new(LEGACY_ROLE_PATTERN)?,
        })
    }

    fn is_legacy(&self, crb: &ClusterRoleBinding) -> bool {
        let role = crb.role_ref.name.as_str();
        self.legacy_name.is_match(&crb.metadata.name)
            && !crb.metadata.labels.contains_key(GRANT_LABEL)
            && (role == CREATE_NS_ROLE
                || self.legacy_role.is_match(role)
                || role.ends_with("-promoted"))
    }

    /// Evaluates one observed binding.
    pub async fn sync(&self, crb: ClusterRoleBinding) -> anyhow::Result<Cleanup> {
        if self.is_legacy(&crb) && self.ownership.no_remaining_owner_labels(&crb.metadata).await? {
            info!(
                "Deleting legacy clusterRoleBinding {} for role {}",
                crb.metadata.name, crb.role_ref.name
            );
            return match self.crbs.delete("", &crb.metadata.name).await {
                Err(e) if !e.is_not_found() => Err(e.into()),
                _ => Ok(Cleanup::Deleted),
            };
        }

        if crb.role_ref.name != CLUSTER_ADMIN_ROLE
            || crb.metadata.annotations.contains_key(ADMIN_GLOBAL_ROLE_CHECKED_ANNOTATION)
        {
            return Ok(Cleanup::Kept);
        }

        let mut is_admin = false;
        for subject in &crb.subjects {
            if self.holds_admin_global_role(subject).await? {
                is_admin = true;
                break;
            }
        }
        info!(
            "ClusterRoleBinding {} to {}: admin global role held = {}",
            crb.metadata.name, CLUSTER_ADMIN_ROLE, is_admin
        );
        let value = is_admin.to_string();
        update_with_retry(&self.crbs, crb, |b| {
            if b.metadata.annotations.contains_key(ADMIN_GLOBAL_ROLE_CHECKED_ANNOTATION) {
                return false;
            }
            b.metadata
                .annotations
                .insert(ADMIN_GLOBAL_ROLE_CHECKED_ANNOTATION.to_string(), value.clone());
            true
        })
        .await?;
        Ok(Cleanup::AdminChecked(is_admin))
    }

    async fn holds_admin_global_role(&self, subject: &Subject) -> anyhow::Result<bool> {
        let grbs = self
            .global_role_bindings
            .list_matching(None, |grb| match subject.kind {
                SubjectKind::User => grb.user_name == subject.name,
                SubjectKind::Group => grb.group_principal_name == subject.name,
                SubjectKind::ServiceAccount => false,
            })
            .await?;
        for grb in grbs {
            match self.global_roles.get_opt("", &grb.global_role_name).await? {
                Some(gr) if gr.is_admin() => return Ok(true),
                Some(_) => {}
                None => debug!(
                    "GlobalRoleBinding {} refers to missing globalRole {}",
                    grb.metadata.name, grb.global_role_name
                ),
            }
        }
        Ok(false)
    }
}
