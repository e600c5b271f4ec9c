use async_trait::async_trait;
use pkg_types::rbac::ClusterRoleBinding;
use tracing::debug;

use super::HandlerContext;
use crate::controller::{Action, Handler};
use crate::legacy::Cleanup;

/// Runs the legacy sweep over every observed ClusterRoleBinding.
pub struct ClusterRoleBindingHandler {
    ctx: HandlerContext,
}

impl ClusterRoleBindingHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler<ClusterRoleBinding> for ClusterRoleBindingHandler {
    async fn sync(&self, crb: ClusterRoleBinding) -> anyhow::Result<Action> {
        let name = crb.metadata.name.clone();
        match self.ctx.legacy.sync(crb).await? {
            Cleanup::Kept => {}
            outcome => debug!("Legacy sweep of clusterRoleBinding {}: {:?}", name, outcome),
        }
        Ok(Action::Done)
    }
}
