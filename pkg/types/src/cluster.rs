use serde::{Deserialize, Serialize};

use crate::impl_resource;
use crate::meta::ObjectMeta;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub display_name: String,
}

/// A project groups namespaces inside one cluster. Stored in the cluster's namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub display_name: String,
    pub cluster_name: String,
}

impl_resource!(Cluster, "Cluster", "clusters", cluster);
impl_resource!(Project, "Project", "projects", namespaced);

impl Cluster {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            display_name: name.to_string(),
        }
    }
}

impl Project {
    pub fn new(cluster: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(cluster, name),
            display_name: name.to_string(),
            cluster_name: cluster.to_string(),
        }
    }

    /// `<cluster>:<project>`
    pub fn id(&self) -> String {
        format!("{}:{}", self.cluster_name, self.metadata.name)
    }
}

/// Parses `<cluster>:<project>`. Both halves must be non-empty.
pub fn parse_project_id(id: &str) -> Option<(&str, &str)> {
    let (cluster, project) = id.split_once(':')?;
    if cluster.is_empty() || project.is_empty() || project.contains(':') {
        return None;
    }
    Some((cluster, project))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_ids() {
        assert_eq!(parse_project_id("c1:p-abc"), Some(("c1", "p-abc")));
        assert_eq!(parse_project_id("c1"), None);
        assert_eq!(parse_project_id(":p"), None);
        assert_eq!(parse_project_id("c1:"), None);
        assert_eq!(parse_project_id("a:b:c"), None);
        assert_eq!(Project::new("c1", "p1").id(), "c1:p1");
    }
}
