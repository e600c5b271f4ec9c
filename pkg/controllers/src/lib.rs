//! Compiles role templates and their bindings into native RBAC objects.

pub mod bindings;
pub mod cluster_indexed;
pub mod controller;
pub mod error;
pub mod handlers;
pub mod inheritance;
pub mod legacy;
pub mod membership;
pub mod migration;
pub mod naming;
pub mod ownership;
pub mod queue;
pub mod resource_match;
pub mod retry;
pub mod roles;
pub mod status;
pub mod subject;

#[cfg(test)]
mod testutil;

pub use controller::{Action, Controller, ControllerSettings, Handler, Kind, QueueKey};
pub use error::RbacError;
pub use handlers::HandlerContext;

use pkg_state::Store;
use resource_match::ResourceMatchRegistry;

/// Builds a controller with every handler registered. The cluster-indexed
/// registry is loaded from the stored CRDs before any binding is handled.
pub async fn build_controller(
    store: Store,
    settings: ControllerSettings,
) -> anyhow::Result<Controller> {
    settings.validate()?;
    let dependency_delay = settings.dependency_delay;
    let registry = ResourceMatchRegistry::load(&store).await?;
    let mut controller = Controller::new(store.clone(), settings);
    let ctx = HandlerContext::new(store, controller.queue(), registry, dependency_delay)?;
    handlers::register_all(&mut controller, &ctx);
    Ok(controller)
}
