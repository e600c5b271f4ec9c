use serde::{Deserialize, Serialize};

use crate::impl_resource;
use crate::meta::ObjectMeta;

// --- Policy rules ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// API groups this rule applies to (e.g., "" for core, "*" for all)
    #[serde(default)]
    pub api_groups: Vec<String>,
    /// Resource types (e.g., "pods", "services", "*" for all)
    #[serde(default)]
    pub resources: Vec<String>,
    /// Allowed verbs (e.g., "get", "list", "create", "update", "delete", "*" for all)
    #[serde(default)]
    pub verbs: Vec<String>,
    /// Restricts the rule to these object names; empty means all.
    #[serde(default)]
    pub resource_names: Vec<String>,
    #[serde(default)]
    pub non_resource_urls: Vec<String>,
}

impl PolicyRule {
    pub fn new(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> Self {
        Self {
            api_groups: api_groups.iter().map(|s| s.to_string()).collect(),
            resources: resources.iter().map(|s| s.to_string()).collect(),
            verbs: verbs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_resource_names(mut self, names: &[&str]) -> Self {
        self.resource_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Copy of the rule with resources and verbs lowercased.
    /// Native RBAC matching is case-sensitive.
    pub fn to_lowercase(&self) -> Self {
        Self {
            resources: self.resources.iter().map(|r| r.to_lowercase()).collect(),
            verbs: self.verbs.iter().map(|v| v.to_lowercase()).collect(),
            ..self.clone()
        }
    }

    pub fn has_verb(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    pub fn has_resource(&self, resource: &str) -> bool {
        self.resources.iter().any(|r| r == resource)
    }

    /// Whether the rule covers `resource` in `api_group`, wildcards included.
    pub fn matches_resource(&self, api_group: &str, resource: &str) -> bool {
        self.api_groups.iter().any(|g| g == api_group || g == "*")
            && self.resources.iter().any(|r| r == resource || r == "*")
    }
}

// --- Roles ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRole {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl_resource!(ClusterRole, "ClusterRole", "clusterroles", cluster);
impl_resource!(Role, "Role", "roles", namespaced);

// --- Subject ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectKind {
    User,
    Group,
    ServiceAccount,
}

impl std::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectKind::User => write!(f, "User"),
            SubjectKind::Group => write!(f, "Group"),
            SubjectKind::ServiceAccount => write!(f, "ServiceAccount"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub name: String,
    /// Only set for service accounts.
    #[serde(default)]
    pub namespace: String,
    /// `rbac.authorization.k8s.io` for users and groups, empty for service accounts.
    #[serde(default)]
    pub api_group: String,
}

// --- Role reference ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleRefKind {
    ClusterRole,
    Role,
}

impl std::fmt::Display for RoleRefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleRefKind::ClusterRole => write!(f, "ClusterRole"),
            RoleRefKind::Role => write!(f, "Role"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleRef {
    #[serde(default)]
    pub api_group: String,
    pub kind: RoleRefKind,
    pub name: String,
}

// --- Bindings ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRoleBinding {
    pub metadata: ObjectMeta,
    pub role_ref: RoleRef,
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleBinding {
    pub metadata: ObjectMeta,
    pub role_ref: RoleRef,
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

impl_resource!(ClusterRoleBinding, "ClusterRoleBinding", "clusterrolebindings", cluster);
impl_resource!(RoleBinding, "RoleBinding", "rolebindings", namespaced);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercase_touches_only_resources_and_verbs() {
        let rule = PolicyRule {
            api_groups: vec!["Apps".to_string()],
            resources: vec!["Deployments".to_string()],
            verbs: vec!["GET".to_string(), "List".to_string()],
            resource_names: vec!["MyApp".to_string()],
            non_resource_urls: vec![],
        };
        let lowered = rule.to_lowercase();
        assert_eq!(lowered.resources, vec!["deployments"]);
        assert_eq!(lowered.verbs, vec!["get", "list"]);
        assert_eq!(lowered.api_groups, vec!["Apps"]);
        assert_eq!(lowered.resource_names, vec!["MyApp"]);
    }

    #[test]
    fn wildcard_resource_match() {
        let rule = PolicyRule::new(&["*"], &["*"], &["get"]);
        assert!(rule.matches_resource("management.cattle.io", "nodes"));
        let rule = PolicyRule::new(&["apps"], &["deployments"], &["get"]);
        assert!(!rule.matches_resource("management.cattle.io", "deployments"));
        assert!(rule.matches_resource("apps", "deployments"));
    }
}
