use async_trait::async_trait;
use pkg_state::Api;
use pkg_types::binding::ProjectRoleTemplateBinding;
use pkg_types::cluster::Project;
use tracing::info;

use super::HandlerContext;
use crate::controller::{Action, Handler, Kind, QueueKey};
use crate::error::join_errors;

pub struct ProjectHandler {
    ctx: HandlerContext,
    prtbs: Api<ProjectRoleTemplateBinding>,
}

impl ProjectHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            prtbs: ctx.store.api(),
            ctx,
        }
    }

    async fn bindings_of(
        &self,
        project: &Project,
    ) -> anyhow::Result<Vec<ProjectRoleTemplateBinding>> {
        let id = project.id();
        Ok(self
            .prtbs
            .list_matching(Some(&project.metadata.name), |prtb| prtb.project_name == id)
            .await?)
    }
}

#[async_trait]
impl Handler<Project> for ProjectHandler {
    /// Bindings waiting for this project are retried right away.
    async fn sync(&self, project: Project) -> anyhow::Result<Action> {
        for prtb in self.bindings_of(&project).await? {
            self.ctx
                .queue
                .add(QueueKey::for_object(Kind::ProjectRoleTemplateBinding, &prtb))
                .await;
        }
        Ok(Action::Done)
    }

    /// Deletes the membership Roles and the bindings of the project. Each
    /// binding runs its own cleanup before it goes away.
    async fn remove(&self, project: Project) -> anyhow::Result<Action> {
        let mut errors = Vec::new();
        if let Err(e) = self
            .ctx
            .membership
            .remove_project_roles(&project.cluster_name, &project.metadata.name)
            .await
        {
            errors.push(e);
        }
        for prtb in self.bindings_of(&project).await? {
            info!("Deleting {} of removed project {}", prtb.metadata.key(), project.id());
            match self.prtbs.delete(&prtb.metadata.namespace, &prtb.metadata.name).await {
                Err(e) if !e.is_not_found() => errors.push(e.into()),
                _ => {}
            }
        }
        join_errors(errors)?;
        Ok(Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::fixtures::{context, drain};
    use crate::membership::project_membership_role;
    use crate::testutil::{prtb, seed};
    use pkg_constants::labels::AUTHZ_FINALIZER;
    use pkg_state::Store;
    use pkg_types::rbac::{PolicyRule, Role};
    use pkg_types::ObjectMeta;

    #[tokio::test]
    async fn sync_queues_bindings_of_the_project() {
        let store = Store::in_memory();
        let ctx = context(&store);
        let project = seed(&store, Project::new("c1", "p1")).await;
        let ours = seed(&store, prtb("c1", "p1", "prtb-1", "bob", "view")).await;
        seed(&store, prtb("c1", "p2", "prtb-2", "bob", "view")).await;

        ProjectHandler::new(ctx.clone()).sync(project).await.unwrap();
        assert_eq!(
            drain(&ctx.queue).await,
            vec![QueueKey::for_object(Kind::ProjectRoleTemplateBinding, &ours)]
        );
    }

    #[tokio::test]
    async fn remove_deletes_roles_and_bindings() {
        let store = Store::in_memory();
        let ctx = context(&store);
        let project = seed(&store, Project::new("c1", "p1")).await;
        seed(
            &store,
            Role {
                metadata: ObjectMeta::namespaced("c1", project_membership_role("p1", false)),
                rules: vec![PolicyRule::new(&["management.cattle.io"], &["projects"], &["get"])],
            },
        )
        .await;
        let mut finalized = prtb("c1", "p1", "prtb-1", "bob", "view");
        finalized.metadata.finalizers.push(AUTHZ_FINALIZER.to_string());
        seed(&store, finalized).await;
        seed(&store, prtb("c1", "p1", "prtb-2", "carol", "view")).await;

        ProjectHandler::new(ctx).remove(project).await.unwrap();

        assert!(store.api::<Role>().list(Some("c1")).await.unwrap().is_empty());
        let prtbs = store.api::<ProjectRoleTemplateBinding>().list(Some("p1")).await.unwrap();
        assert_eq!(prtbs.len(), 1);
        assert!(prtbs[0].metadata.is_deleting());
    }
}
