use serde::{Deserialize, Serialize};

use crate::impl_resource;
use crate::meta::ObjectMeta;
use crate::rbac::PolicyRule;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalRole {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub builtin: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalRoleBinding {
    pub metadata: ObjectMeta,
    pub global_role_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub group_principal_name: String,
}

impl_resource!(GlobalRole, "GlobalRole", "globalroles", cluster);
impl_resource!(GlobalRoleBinding, "GlobalRoleBinding", "globalrolebindings", cluster);

impl GlobalRole {
    /// Grants every verb on every resource in every API group.
    pub fn is_admin(&self) -> bool {
        self.rules.iter().any(|rule| {
            rule.api_groups.iter().any(|g| g == "*")
                && rule.resources.iter().any(|r| r == "*")
                && rule.verbs.iter().any(|v| v == "*")
        })
    }
}
