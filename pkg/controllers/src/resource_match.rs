use pkg_constants::labels::{CLUSTER_INDEXED_LABEL, CLUSTER_INDEXED_VALUE};
use pkg_state::Store;
use pkg_types::crd::CustomResourceDefinition;
use pkg_types::rbac::PolicyRule;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Whether `crd` carries the cluster-indexed label.
pub fn is_cluster_indexed(crd: &CustomResourceDefinition) -> bool {
    crd.metadata.labels.get(CLUSTER_INDEXED_LABEL).map(String::as_str)
        == Some(CLUSTER_INDEXED_VALUE)
}

/// A resource kind whose objects exist once per downstream cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMatch {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

/// Cluster-indexed resource kinds, keyed by the CRD that declared them.
#[derive(Clone, Default)]
pub struct ResourceMatchRegistry {
    inner: Arc<RwLock<BTreeMap<String, Vec<ResourceMatch>>>>,
}

impl ResourceMatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every labeled CRD already in `store`. Bindings must not be
    /// reconciled against a registry that has not been loaded, or their
    /// cluster-indexed Roles would be dropped.
    pub async fn load(store: &Store) -> anyhow::Result<Self> {
        let registry = Self::new();
        let crds = store
            .api::<CustomResourceDefinition>()
            .list_matching(None, is_cluster_indexed)
            .await?;
        for crd in &crds {
            registry.register(crd).await;
        }
        info!("Loaded {} cluster-indexed CRDs", crds.len());
        Ok(registry)
    }

    /// Registers every served version of `crd`, replacing earlier entries.
    /// Returns whether the registry changed.
    pub async fn register(&self, crd: &CustomResourceDefinition) -> bool {
        let mut versions: Vec<&str> = crd.versions.iter().map(String::as_str).collect();
        if versions.is_empty() {
            versions.push("");
        }
        let matches: Vec<ResourceMatch> = versions
            .into_iter()
            .map(|version| ResourceMatch {
                group: crd.group.clone(),
                version: version.to_string(),
                kind: crd.names.kind.clone(),
                plural: crd.names.plural.clone(),
            })
            .collect();

        let mut inner = self.inner.write().await;
        let previous = inner.insert(crd.metadata.name.clone(), matches.clone());
        previous.as_ref() != Some(&matches)
    }

    /// Returns whether anything was registered under `crd_name`.
    pub async fn unregister(&self, crd_name: &str) -> bool {
        self.inner.write().await.remove(crd_name).is_some()
    }

    pub async fn snapshot(&self) -> Vec<ResourceMatch> {
        self.inner.read().await.values().flatten().cloned().collect()
    }

    /// Narrows `rules` to the cluster-indexed resources they grant, one rule
    /// per (rule, matching kind) with the rule's verbs and resource names.
    pub async fn matching_rules(&self, rules: &[PolicyRule]) -> Vec<PolicyRule> {
        let inner = self.inner.read().await;
        let mut out: Vec<PolicyRule> = Vec::new();
        for rule in rules {
            for m in inner.values().flatten() {
                if !rule.matches_resource(&m.group, &m.plural) {
                    continue;
                }
                let narrowed = PolicyRule {
                    api_groups: vec![m.group.clone()],
                    resources: vec![m.plural.clone()],
                    verbs: rule.verbs.clone(),
                    resource_names: rule.resource_names.clone(),
                    non_resource_urls: Vec::new(),
                };
                if !out.contains(&narrowed) {
                    out.push(narrowed);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodepools() -> CustomResourceDefinition {
        CustomResourceDefinition::new("management.cattle.io", "NodePool", "nodepools")
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let registry = ResourceMatchRegistry::new();
        let mut crd = nodepools();
        crd.versions = vec!["v1".into(), "v3".into()];

        assert!(registry.register(&crd).await);
        assert!(!registry.register(&crd).await);
        assert_eq!(registry.snapshot().await.len(), 2);

        assert!(registry.unregister("nodepools.management.cattle.io").await);
        assert!(!registry.unregister("nodepools.management.cattle.io").await);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn rules_are_narrowed_to_indexed_kinds() {
        let registry = ResourceMatchRegistry::new();
        let mut crd = nodepools();
        crd.versions = vec!["v1".into(), "v3".into()];
        registry.register(&crd).await;

        let rules = vec![
            PolicyRule::new(&["*"], &["*"], &["get", "list"]),
            PolicyRule::new(&["apps"], &["deployments"], &["*"]),
            PolicyRule::new(&["management.cattle.io"], &["nodepools"], &["delete"])
                .with_resource_names(&["np-1"]),
        ];
        let narrowed = registry.matching_rules(&rules).await;
        assert_eq!(
            narrowed,
            vec![
                PolicyRule::new(&["management.cattle.io"], &["nodepools"], &["get", "list"]),
                PolicyRule::new(&["management.cattle.io"], &["nodepools"], &["delete"])
                    .with_resource_names(&["np-1"]),
            ]
        );
    }

    #[tokio::test]
    async fn load_registers_only_labeled_crds() {
        let store = Store::in_memory();
        let crds = store.api::<CustomResourceDefinition>();
        let mut labeled = nodepools();
        labeled
            .metadata
            .labels
            .insert(CLUSTER_INDEXED_LABEL.to_string(), CLUSTER_INDEXED_VALUE.to_string());
        crds.create(&labeled).await.unwrap();
        crds.create(&CustomResourceDefinition::new("apps", "Widget", "widgets"))
            .await
            .unwrap();

        let registry = ResourceMatchRegistry::load(&store).await.unwrap();
        let kinds: Vec<String> = registry.snapshot().await.into_iter().map(|m| m.plural).collect();
        assert_eq!(kinds, vec!["nodepools".to_string()]);
    }

    #[tokio::test]
    async fn registries_are_isolated() {
        let a = ResourceMatchRegistry::new();
        let b = ResourceMatchRegistry::new();
        a.register(&CustomResourceDefinition::new("g", "K", "ks")).await;
        assert!(b.snapshot().await.is_empty());
        assert_eq!(a.clone().snapshot().await.len(), 1);
    }
}
