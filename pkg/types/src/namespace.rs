use serde::{Deserialize, Serialize};

use crate::impl_resource;
use crate::meta::ObjectMeta;

/// Annotation linking a namespace to `<cluster>:<project>`.
pub const PROJECT_ID_ANNOTATION: &str = "field.cattle.io/projectId";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Namespace {
    pub metadata: ObjectMeta,
}

impl_resource!(Namespace, "Namespace", "namespaces", cluster);

impl Namespace {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
        }
    }

    pub fn in_project(name: &str, project_id: &str) -> Self {
        Self {
            metadata: ObjectMeta::named(name).with_annotation(PROJECT_ID_ANNOTATION, project_id),
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(PROJECT_ID_ANNOTATION)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}
