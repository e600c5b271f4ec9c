use serde::{Deserialize, Serialize};

use crate::impl_resource;
use crate::meta::ObjectMeta;
use crate::rbac::PolicyRule;
use crate::status::ReconcileStatus;

/// Scope a role template is meant to be granted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleTemplateContext {
    #[default]
    Cluster,
    Project,
}

impl std::fmt::Display for RoleTemplateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleTemplateContext::Cluster => write!(f, "cluster"),
            RoleTemplateContext::Project => write!(f, "project"),
        }
    }
}

/// A named, reusable set of permission rules that may inherit other templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTemplate {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub context: RoleTemplateContext,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Templates whose rules this one inherits.
    #[serde(default)]
    pub role_template_names: Vec<String>,
    #[serde(default)]
    pub builtin: bool,
    /// Backed by a ClusterRole managed outside this controller.
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub external_rules: Option<Vec<PolicyRule>>,
    #[serde(default)]
    pub administrative: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub status: ReconcileStatus,
}

impl_resource!(RoleTemplate, "RoleTemplate", "roletemplates", cluster);

impl RoleTemplate {
    pub fn new(name: &str, context: RoleTemplateContext, rules: Vec<PolicyRule>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            display_name: String::new(),
            context,
            rules,
            role_template_names: Vec::new(),
            builtin: false,
            external: false,
            external_rules: None,
            administrative: false,
            locked: false,
            status: ReconcileStatus::default(),
        }
    }

    pub fn inheriting(mut self, names: &[&str]) -> Self {
        self.role_template_names = names.iter().map(|s| s.to_string()).collect();
        self
    }
}
