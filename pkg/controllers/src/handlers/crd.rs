use async_trait::async_trait;
use pkg_state::Api;
use pkg_types::binding::ClusterRoleTemplateBinding;
use pkg_types::crd::CustomResourceDefinition;
use tracing::info;

use super::HandlerContext;
use crate::controller::{Action, Handler, Kind, QueueKey};
use crate::resource_match::is_cluster_indexed;

/// Tracks which CRDs declare cluster-indexed resources. Any change
/// re-queues every CRTB so their cluster-indexed Roles follow.
pub struct CrdHandler {
    ctx: HandlerContext,
    crtbs: Api<ClusterRoleTemplateBinding>,
}

impl CrdHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            crtbs: ctx.store.api(),
            ctx,
        }
    }

    async fn enqueue_crtbs(&self) -> anyhow::Result<()> {
        for crtb in self.crtbs.list(None).await? {
            self.ctx
                .queue
                .add(QueueKey::for_object(Kind::ClusterRoleTemplateBinding, &crtb))
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<CustomResourceDefinition> for CrdHandler {
    async fn sync(&self, crd: CustomResourceDefinition) -> anyhow::Result<Action> {
        let changed = if is_cluster_indexed(&crd) {
            self.ctx.registry.register(&crd).await
        } else {
            self.ctx.registry.unregister(&crd.metadata.name).await
        };
        if changed {
            info!("Cluster-indexed resources changed by CRD {}", crd.metadata.name);
            self.enqueue_crtbs().await?;
        }
        Ok(Action::Done)
    }

    async fn remove(&self, crd: CustomResourceDefinition) -> anyhow::Result<Action> {
        if self.ctx.registry.unregister(&crd.metadata.name).await {
            info!("CRD {} removed, unregistering its resources", crd.metadata.name);
            self.enqueue_crtbs().await?;
        }
        Ok(Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::fixtures::{context, drain};
    use pkg_constants::labels::{CLUSTER_INDEXED_LABEL, CLUSTER_INDEXED_VALUE};
    use crate::testutil::{crtb, seed};
    use pkg_state::Store;

    fn indexed(crd: CustomResourceDefinition) -> CustomResourceDefinition {
        let mut crd = crd;
        crd.metadata
            .labels
            .insert(CLUSTER_INDEXED_LABEL.to_string(), CLUSTER_INDEXED_VALUE.to_string());
        crd
    }

    #[tokio::test]
    async fn labeled_crds_are_registered_once() {
        let store = Store::in_memory();
        let ctx = context(&store);
        let handler = CrdHandler::new(ctx.clone());
        seed(&store, crtb("c1", "crtb-1", "alice", "view")).await;
        let bundles = CustomResourceDefinition::new("fleet.cattle.io", "Bundle", "bundles");
        let crd = seed(&store, indexed(bundles)).await;

        handler.sync(crd.clone()).await.unwrap();
        assert_eq!(ctx.registry.snapshot().await.len(), 1);
        assert_eq!(drain(&ctx.queue).await.len(), 1);

        handler.sync(crd).await.unwrap();
        assert!(drain(&ctx.queue).await.is_empty());
    }

    #[tokio::test]
    async fn unlabeling_or_removal_unregisters() {
        let store = Store::in_memory();
        let ctx = context(&store);
        let handler = CrdHandler::new(ctx.clone());
        let crd = indexed(CustomResourceDefinition::new("fleet.cattle.io", "Bundle", "bundles"));
        handler.sync(crd.clone()).await.unwrap();

        let mut plain = crd.clone();
        plain.metadata.labels.clear();
        handler.sync(plain).await.unwrap();
        assert!(ctx.registry.snapshot().await.is_empty());

        handler.sync(crd.clone()).await.unwrap();
        handler.remove(crd).await.unwrap();
        assert!(ctx.registry.snapshot().await.is_empty());
    }
}
