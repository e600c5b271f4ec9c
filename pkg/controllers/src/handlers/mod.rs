//! Per-kind handlers wired into the [`Controller`].

mod crb;
mod crd;
mod crtb;
mod namespace;
mod project;
mod prtb;
mod roletemplate;

pub use crb::ClusterRoleBindingHandler;
pub use crd::CrdHandler;
pub use crtb::CrtbHandler;
pub use namespace::NamespaceHandler;
pub use project::ProjectHandler;
pub use prtb::PrtbHandler;
pub use roletemplate::RoleTemplateHandler;

use pkg_constants::labels::GRANT_ROLE_TEMPLATE;
use pkg_state::Store;
use pkg_types::rbac::{ClusterRoleBinding, RoleBinding};
use std::time::Duration;

use crate::bindings::BindingReconciler;
use crate::cluster_indexed::ClusterIndexedRoles;
use crate::controller::{Controller, Kind, QueueKey};
use crate::inheritance::RoleInheritanceResolver;
use crate::legacy::LegacyCrbCleaner;
use crate::membership::MembershipBindingManager;
use crate::migration::LabelMigrator;
use crate::ownership::OwnershipTracker;
use crate::queue::WorkQueue;
use crate::resource_match::ResourceMatchRegistry;
use crate::roles::ClusterRoleSynchronizer;

/// Everything a handler needs, built once per controller.
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Store,
    pub queue: WorkQueue<QueueKey>,
    pub resolver: RoleInheritanceResolver,
    pub roles: ClusterRoleSynchronizer,
    pub ownership: OwnershipTracker,
    /// ClusterRoleBindings to role template ClusterRoles.
    pub crbs: BindingReconciler<ClusterRoleBinding>,
    /// RoleBindings to role template ClusterRoles in project namespaces.
    pub rbs: BindingReconciler<RoleBinding>,
    pub membership: MembershipBindingManager,
    pub cluster_indexed: ClusterIndexedRoles,
    pub registry: ResourceMatchRegistry,
    pub migrator: LabelMigrator,
    pub legacy: LegacyCrbCleaner,
    /// Delay before retrying a binding whose cluster or project is missing.
    pub dependency_delay: Duration,
}

impl HandlerContext {
    pub fn new(
        store: Store,
        queue: WorkQueue<QueueKey>,
        registry: ResourceMatchRegistry,
        dependency_delay: Duration,
    ) -> anyhow::Result<Self> {
        let resolver = RoleInheritanceResolver::new(&store);
        let ownership = OwnershipTracker::new(&store);
        Ok(Self {
            roles: ClusterRoleSynchronizer::new(&store, resolver.clone()),
            crbs: BindingReconciler::new(&store, ownership.clone(), GRANT_ROLE_TEMPLATE),
            rbs: BindingReconciler::new(&store, ownership.clone(), GRANT_ROLE_TEMPLATE),
            membership: MembershipBindingManager::new(&store, ownership.clone()),
            cluster_indexed: ClusterIndexedRoles::new(&store, ownership.clone(), registry.clone()),
            migrator: LabelMigrator::new(&store),
            legacy: LegacyCrbCleaner::new(&store, ownership.clone())?,
            resolver,
            ownership,
            registry,
            queue,
            store,
            dependency_delay,
        })
    }
}

/// Registers a handler for every watched kind.
pub fn register_all(controller: &mut Controller, ctx: &HandlerContext) {
    controller.register(Kind::RoleTemplate, RoleTemplateHandler::new(ctx.clone()));
    controller.register(Kind::ClusterRoleTemplateBinding, CrtbHandler::new(ctx.clone()));
    controller.register(Kind::ProjectRoleTemplateBinding, PrtbHandler::new(ctx.clone()));
    controller.register(Kind::Namespace, NamespaceHandler::new(ctx.clone()));
    controller.register(Kind::Project, ProjectHandler::new(ctx.clone()));
    controller.register(Kind::ClusterRoleBinding, ClusterRoleBindingHandler::new(ctx.clone()));
    controller.register(Kind::CustomResourceDefinition, CrdHandler::new(ctx.clone()));
}
