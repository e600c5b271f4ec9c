use serde::{Deserialize, Serialize};

use crate::impl_resource;
use crate::meta::ObjectMeta;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrdNames {
    pub kind: String,
    pub plural: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomResourceDefinition {
    pub metadata: ObjectMeta,
    pub group: String,
    pub names: CrdNames,
    #[serde(default)]
    pub versions: Vec<String>,
}

impl_resource!(
    CustomResourceDefinition,
    "CustomResourceDefinition",
    "customresourcedefinitions",
    cluster
);

impl CustomResourceDefinition {
    pub fn new(group: &str, kind: &str, plural: &str) -> Self {
        Self {
            metadata: ObjectMeta::named(format!("{}.{}", plural, group)),
            group: group.to_string(),
            names: CrdNames {
                kind: kind.to_string(),
                plural: plural.to_string(),
            },
            versions: vec!["v1".to_string()],
        }
    }
}
