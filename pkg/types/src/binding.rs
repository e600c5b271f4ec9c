use serde::{Deserialize, Serialize};

use crate::impl_resource;
use crate::meta::ObjectMeta;
use crate::status::ReconcileStatus;

/// Subject reference fields shared by both binding kinds.
/// At most one subject should be named.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectFields<'a> {
    pub user_name: &'a str,
    pub user_principal_name: &'a str,
    pub group_name: &'a str,
    pub group_principal_name: &'a str,
    pub service_account: &'a str,
}

/// Grants a role template to one subject across a whole cluster.
/// Lives in the cluster's namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterRoleTemplateBinding {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_principal_name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub group_principal_name: String,
    pub role_template_name: String,
    pub cluster_name: String,
    #[serde(default)]
    pub status: ReconcileStatus,
}

/// Grants a role template to one subject within a single project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRoleTemplateBinding {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_principal_name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub group_principal_name: String,
    /// `namespace:name`
    #[serde(default)]
    pub service_account: String,
    pub role_template_name: String,
    /// `<cluster>:<project>`
    pub project_name: String,
    #[serde(default)]
    pub status: ReconcileStatus,
}

impl_resource!(
    ClusterRoleTemplateBinding,
    "ClusterRoleTemplateBinding",
    "clusterroletemplatebindings",
    namespaced
);
impl_resource!(
    ProjectRoleTemplateBinding,
    "ProjectRoleTemplateBinding",
    "projectroletemplatebindings",
    namespaced
);

impl ClusterRoleTemplateBinding {
    pub fn subject_fields(&self) -> SubjectFields<'_> {
        SubjectFields {
            user_name: &self.user_name,
            user_principal_name: &self.user_principal_name,
            group_name: &self.group_name,
            group_principal_name: &self.group_principal_name,
            service_account: "",
        }
    }
}

impl ProjectRoleTemplateBinding {
    pub fn subject_fields(&self) -> SubjectFields<'_> {
        SubjectFields {
            user_name: &self.user_name,
            user_principal_name: &self.user_principal_name,
            group_name: &self.group_name,
            group_principal_name: &self.group_principal_name,
            service_account: &self.service_account,
        }
    }

    /// Splits `project_name` into cluster and project.
    pub fn project_id(&self) -> Option<(&str, &str)> {
        crate::cluster::parse_project_id(&self.project_name)
    }
}
