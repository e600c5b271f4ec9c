use anyhow::Context;
use pkg_constants::labels::{
    CLUSTER_OWNER_TEMPLATE, CLUSTERS_RESOURCE, PROJECT_OWNER_TEMPLATE, PROJECTS_RESOURCE,
};
use pkg_constants::limits::{ROLES_CIRCULAR_HARD_LIMIT, ROLES_CIRCULAR_SOFT_LIMIT};
use pkg_state::{Api, Store};
use pkg_types::rbac::PolicyRule;
use pkg_types::roletemplate::{RoleTemplate, RoleTemplateContext};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use crate::error::RbacError;

/// Role templates keyed by name.
pub type RoleSet = BTreeMap<String, RoleTemplate>;

/// Counts traversal steps against the soft and hard limits.
struct Steps<'a> {
    root: &'a str,
    count: usize,
}

impl<'a> Steps<'a> {
    fn new(root: &'a str) -> Self {
        Self { root, count: 0 }
    }

    fn step(&mut self) -> Result<(), RbacError> {
        self.count += 1;
        if self.count == ROLES_CIRCULAR_SOFT_LIMIT {
            warn!(
                "roletemplate {} has caused {} traversal steps",
                self.root, ROLES_CIRCULAR_SOFT_LIMIT
            );
        }
        if self.count >= ROLES_CIRCULAR_HARD_LIMIT {
            return Err(RbacError::CircularDependency {
                template: self.root.to_string(),
                detail: format!(
                    "inheritance traversal reached {} steps",
                    ROLES_CIRCULAR_HARD_LIMIT
                ),
            });
        }
        Ok(())
    }
}

/// Expands role templates into everything they transitively inherit.
#[derive(Clone)]
pub struct RoleInheritanceResolver {
    templates: Api<RoleTemplate>,
}

impl RoleInheritanceResolver {
    pub fn new(store: &Store) -> Self {
        Self {
            templates: store.api(),
        }
    }

    pub async fn get(&self, name: &str) -> anyhow::Result<RoleTemplate> {
        match self.templates.get_opt("", name).await? {
            Some(rt) => Ok(rt),
            None => Err(RbacError::RoleTemplateNotFound {
                name: name.to_string(),
            }
            .into()),
        }
    }

    /// Collects `root` and every template it inherits, keyed by name.
    ///
    /// Traversal is depth-first over an explicit stack. Reaching a template
    /// that is still being expanded is a cycle and fails immediately; the
    /// step counter bounds the traversal of very large acyclic graphs.
    /// Rules of non-external templates come back with lowercase resources
    /// and verbs.
    pub async fn gather_roles(&self, root: &RoleTemplate) -> anyhow::Result<RoleSet> {
        let root_name = root.metadata.name.as_str();
        let mut steps = Steps::new(root_name);
        steps.step()?;

        let mut roles = RoleSet::new();
        let mut on_path: HashSet<String> = HashSet::new();
        // (template name, index of the next inherited name to visit)
        let mut stack: Vec<(String, usize)> = Vec::new();

        roles.insert(root_name.to_string(), root.clone());
        on_path.insert(root_name.to_string());
        stack.push((root_name.to_string(), 0));

        while let Some(frame) = stack.last_mut() {
            let inherited = &roles[&frame.0].role_template_names;
            let Some(child) = inherited.get(frame.1).cloned() else {
                on_path.remove(&frame.0);
                stack.pop();
                continue;
            };
            frame.1 += 1;

            if on_path.contains(&child) {
                return Err(RbacError::CircularDependency {
                    template: root_name.to_string(),
                    detail: format!(
                        "{} inherits {} which is already being expanded",
                        frame.0, child
                    ),
                }
                .into());
            }
            if roles.contains_key(&child) {
                continue;
            }

            steps.step()?;
            let rt = self
                .get(&child)
                .await
                .with_context(|| format!("couldn't gather role templates of {}", root_name))?;
            roles.insert(child.clone(), rt);
            on_path.insert(child.clone());
            stack.push((child, 0));
        }

        to_lower_role_templates(&mut roles);
        debug!("Gathered {} role templates for {}", roles.len(), root_name);
        Ok(roles)
    }

    /// Whether granting `name` in `context` makes the subject an owner of
    /// the cluster or project. Inherited templates of another context are
    /// not considered.
    pub async fn is_owner_role(
        &self,
        name: &str,
        context: RoleTemplateContext,
    ) -> anyhow::Result<bool> {
        let mut steps = Steps::new(name);
        let mut visited = HashSet::new();
        let mut worklist = vec![name.to_string()];

        while let Some(current) = worklist.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            steps.step()?;
            let rt = self.get(&current).await?;
            if rt.context != context {
                continue;
            }
            if grants_ownership(&rt) {
                return Ok(true);
            }
            worklist.extend(rt.role_template_names.iter().rev().cloned());
        }
        Ok(false)
    }

    /// `name` plus every template that inherits it, directly or not.
    pub async fn dependents(&self, name: &str) -> anyhow::Result<BTreeSet<String>> {
        let mut inherited_by: HashMap<String, Vec<String>> = HashMap::new();
        for rt in self.templates.list(None).await? {
            for parent in &rt.role_template_names {
                inherited_by
                    .entry(parent.clone())
                    .or_default()
                    .push(rt.metadata.name.clone());
            }
        }

        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !found.insert(current.clone()) {
                continue;
            }
            if let Some(children) = inherited_by.get(&current) {
                queue.extend(children.iter().cloned());
            }
        }
        Ok(found)
    }
}

/// Builtin owner templates, or a rule with the `own` verb on clusters or
/// projects.
pub fn grants_ownership(rt: &RoleTemplate) -> bool {
    if rt.builtin {
        let owner = match rt.context {
            RoleTemplateContext::Cluster => CLUSTER_OWNER_TEMPLATE,
            RoleTemplateContext::Project => PROJECT_OWNER_TEMPLATE,
        };
        if rt.metadata.name == owner {
            return true;
        }
    }
    rt.rules.iter().any(|rule| {
        (rule.has_resource(CLUSTERS_RESOURCE) || rule.has_resource(PROJECTS_RESOURCE))
            && rule.has_verb("own")
    })
}

/// Lowercases resources and verbs of every non-external template in place.
/// Callers own the templates, so shared copies are never touched.
pub fn to_lower_role_templates(roles: &mut RoleSet) {
    for rt in roles.values_mut() {
        if rt.external {
            continue;
        }
        rt.rules = rt.rules.iter().map(PolicyRule::to_lowercase).collect();
    }
}
