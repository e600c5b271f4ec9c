use async_trait::async_trait;
use pkg_state::Api;
use pkg_types::binding::ProjectRoleTemplateBinding;
use pkg_types::cluster::parse_project_id;
use pkg_types::namespace::Namespace;
use tracing::{info, warn};

use super::HandlerContext;
use crate::controller::{Action, Handler, Kind, QueueKey};
use crate::ownership::OwnerIndex;

/// Keeps the role template RoleBindings of a namespace in line with the
/// project it belongs to.
pub struct NamespaceHandler {
    ctx: HandlerContext,
    prtbs: Api<ProjectRoleTemplateBinding>,
}

impl NamespaceHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            prtbs: ctx.store.api(),
            ctx,
        }
    }

    async fn release_all(&self, namespace: &str) -> anyhow::Result<()> {
        let released = self.ctx.rbs.retain_owners(Some(namespace), |_| false).await?;
        if released > 0 {
            info!("Released {} RoleBindings in namespace {}", released, namespace);
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<Namespace> for NamespaceHandler {
    async fn sync(&self, ns: Namespace) -> anyhow::Result<Action> {
        let name = ns.metadata.name.as_str();
        let Some(project_id) = ns.project_id() else {
            self.release_all(name).await?;
            return Ok(Action::Done);
        };
        let Some((_, project)) = parse_project_id(project_id) else {
            warn!("Namespace {} has malformed project id {:?}", name, project_id);
            return Ok(Action::Done);
        };

        let prtbs = self
            .prtbs
            .list_matching(Some(project), |prtb| prtb.project_name == project_id)
            .await?;

        let index = OwnerIndex::from_owners(prtbs.iter().map(|prtb| &prtb.metadata));
        let released = self.ctx.rbs.retain_owners(Some(name), |r| index.contains(r)).await?;
        if released > 0 {
            info!("Released {} RoleBindings of other projects in namespace {}", released, name);
        }

        for prtb in prtbs.iter().filter(|prtb| !prtb.metadata.is_deleting()) {
            self.ctx
                .queue
                .add(QueueKey::for_object(Kind::ProjectRoleTemplateBinding, prtb))
                .await;
        }
        Ok(Action::Done)
    }

    async fn remove(&self, ns: Namespace) -> anyhow::Result<Action> {
        self.release_all(&ns.metadata.name).await?;
        Ok(Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::PrtbHandler;
    use crate::handlers::fixtures::{context, drain};
    use crate::testutil::{prtb, project_template, seed};
    use pkg_state::Store;
    use pkg_types::cluster::{Cluster, Project};
    use pkg_types::rbac::RoleBinding;

    async fn role_bindings(store: &Store, namespace: &str) -> Vec<RoleBinding> {
        store.api::<RoleBinding>().list(Some(namespace)).await.unwrap()
    }

    #[tokio::test]
    async fn moving_namespace_releases_old_project_bindings() {
        let store = Store::in_memory();
        let ctx = context(&store);
        seed(&store, Cluster::new("c1")).await;
        seed(&store, Project::new("c1", "p1")).await;
        seed(&store, Project::new("c1", "p2")).await;
        seed(&store, project_template("deployer")).await;
        let ns = seed(&store, Namespace::in_project("ns-a", "c1:p1")).await;
        let old = seed(&store, prtb("c1", "p1", "prtb-old", "bob", "deployer")).await;
        let new = seed(&store, prtb("c1", "p2", "prtb-new", "carol", "deployer")).await;

        let prtbs = PrtbHandler::new(ctx.clone());
        prtbs.sync(old).await.unwrap();
        assert_eq!(role_bindings(&store, "ns-a").await.len(), 1);

        let mut moved = ns;
        moved.metadata.annotations.insert(
            pkg_types::namespace::PROJECT_ID_ANNOTATION.to_string(),
            "c1:p2".to_string(),
        );
        let moved = store.api::<Namespace>().update(&moved).await.unwrap();

        let handler = NamespaceHandler::new(ctx.clone());
        drain(&ctx.queue).await;
        handler.sync(moved).await.unwrap();
        assert!(role_bindings(&store, "ns-a").await.is_empty());

        let queued = drain(&ctx.queue).await;
        assert_eq!(queued, vec![QueueKey::for_object(Kind::ProjectRoleTemplateBinding, &new)]);

        prtbs.sync(new).await.unwrap();
        let bindings = role_bindings(&store, "ns-a").await;
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].subjects[0].name, "carol");
    }

    #[tokio::test]
    async fn namespace_without_project_holds_no_grants() {
        let store = Store::in_memory();
        let ctx = context(&store);
        seed(&store, Cluster::new("c1")).await;
        seed(&store, Project::new("c1", "p1")).await;
        seed(&store, project_template("deployer")).await;
        let ns = seed(&store, Namespace::in_project("ns-a", "c1:p1")).await;
        let binding = seed(&store, prtb("c1", "p1", "prtb-1", "bob", "deployer")).await;
        PrtbHandler::new(ctx.clone()).sync(binding).await.unwrap();

        let mut detached = ns;
        detached.metadata.annotations.clear();
        let detached = store.api::<Namespace>().update(&detached).await.unwrap();
        NamespaceHandler::new(ctx).sync(detached).await.unwrap();

        assert!(role_bindings(&store, "ns-a").await.is_empty());
        // membership bindings in the cluster namespace are another family
        assert_eq!(role_bindings(&store, "c1").await.len(), 1);
    }
}
