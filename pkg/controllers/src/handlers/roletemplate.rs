use async_trait::async_trait;
use pkg_constants::labels::AUTHZ_FINALIZER;
use pkg_state::Api;
use pkg_types::binding::{ClusterRoleTemplateBinding, ProjectRoleTemplateBinding};
use pkg_types::roletemplate::RoleTemplate;
use pkg_types::status::Condition;
use tracing::{debug, info};

use super::HandlerContext;
use crate::controller::{Action, Handler, Kind, QueueKey};
use crate::error::is_permanent;
use crate::status::{ROLES_EXIST, write_status};

/// Keeps ClusterRoles in line with RoleTemplates and re-queues the
/// bindings that depend on a changed template.
pub struct RoleTemplateHandler {
    ctx: HandlerContext,
    templates: Api<RoleTemplate>,
    crtbs: Api<ClusterRoleTemplateBinding>,
    prtbs: Api<ProjectRoleTemplateBinding>,
}

impl RoleTemplateHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            templates: ctx.store.api(),
            crtbs: ctx.store.api(),
            prtbs: ctx.store.api(),
            ctx,
        }
    }

    async fn ensure(&self, rt: &RoleTemplate) -> anyhow::Result<()> {
        let roles = self.ctx.resolver.gather_roles(rt).await?;
        self.ctx.roles.ensure_roles(&roles).await?;
        let refreshed = self.ctx.roles.refresh_namespaced_roles(rt).await?;
        if refreshed > 0 {
            info!("Refreshed {} roles of role template {}", refreshed, rt.metadata.name);
        }
        Ok(())
    }

    /// Queues every binding whose template is `name` or inherits it.
    async fn enqueue_dependents(&self, name: &str) -> anyhow::Result<usize> {
        let dependents = self.ctx.resolver.dependents(name).await?;
        let mut queued = 0;
        for crtb in self.crtbs.list(None).await? {
            if dependents.contains(&crtb.role_template_name) {
                self.ctx
                    .queue
                    .add(QueueKey::for_object(Kind::ClusterRoleTemplateBinding, &crtb))
                    .await;
                queued += 1;
            }
        }
        for prtb in self.prtbs.list(None).await? {
            if dependents.contains(&prtb.role_template_name) {
                self.ctx
                    .queue
                    .add(QueueKey::for_object(Kind::ProjectRoleTemplateBinding, &prtb))
                    .await;
                queued += 1;
            }
        }
        debug!("Queued {} bindings depending on role template {}", queued, name);
        Ok(queued)
    }
}

#[async_trait]
impl Handler<RoleTemplate> for RoleTemplateHandler {
    async fn sync(&self, rt: RoleTemplate) -> anyhow::Result<Action> {
        let result = self.ensure(&rt).await;

        let mut status = rt.status.clone();
        match &result {
            Ok(()) => status.set_condition(Condition::ok(ROLES_EXIST)),
            Err(e) => status.set_condition(Condition::failed(
                ROLES_EXIST,
                "FailedToEnsureRoles",
                format!("{:#}", e),
            )),
        }
        status.summarize();
        write_status(&self.templates, &rt, status).await?;

        self.enqueue_dependents(&rt.metadata.name).await?;
        match result {
            Err(e) if !is_permanent(&e) => Err(e),
            _ => Ok(Action::Done),
        }
    }

    async fn remove(&self, rt: RoleTemplate) -> anyhow::Result<Action> {
        self.ctx.roles.remove_orphaned(&rt.metadata.name).await?;
        self.enqueue_dependents(&rt.metadata.name).await?;
        Ok(Action::Done)
    }

    fn finalizer(&self) -> Option<&'static str> {
        Some(AUTHZ_FINALIZER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::fixtures::{context, drain};
    use crate::testutil::{cluster_template, crtb, inheriting, prtb, seed};
    use pkg_state::Store;
    use pkg_types::rbac::ClusterRole;
    use pkg_types::status::Summary;

    #[tokio::test]
    async fn sync_creates_roles_and_queues_dependents() {
        let store = Store::in_memory();
        let ctx = context(&store);
        seed(&store, inheriting(cluster_template("edit"), &["view"])).await;
        let view = seed(&store, cluster_template("view")).await;
        seed(&store, crtb("c1", "crtb-edit", "alice", "edit")).await;
        seed(&store, prtb("c1", "p1", "prtb-view", "bob", "view")).await;
        seed(&store, crtb("c1", "crtb-other", "carol", "other")).await;

        let handler = RoleTemplateHandler::new(ctx.clone());
        assert_eq!(handler.sync(view).await.unwrap(), Action::Done);

        assert!(store.api::<ClusterRole>().get_opt("", "view").await.unwrap().is_some());
        let stored = store.api::<RoleTemplate>().get("", "view").await.unwrap();
        assert_eq!(stored.status.summary, Summary::Completed);

        let mut queued: Vec<String> = drain(&ctx.queue).await.into_iter().map(|k| k.name).collect();
        queued.sort();
        assert_eq!(queued, vec!["crtb-edit", "prtb-view"]);
    }

    #[tokio::test]
    async fn cycles_are_reported_in_status() {
        let store = Store::in_memory();
        let ctx = context(&store);
        let a = seed(&store, inheriting(cluster_template("a"), &["a"])).await;

        let handler = RoleTemplateHandler::new(ctx);
        assert_eq!(handler.sync(a).await.unwrap(), Action::Done);

        let stored = store.api::<RoleTemplate>().get("", "a").await.unwrap();
        assert_eq!(stored.status.summary, Summary::Error);
        let cond = stored.status.condition(ROLES_EXIST).unwrap();
        assert!(cond.message.contains("circular dependency"));
    }

    #[tokio::test]
    async fn remove_deletes_owned_cluster_roles() {
        let store = Store::in_memory();
        let ctx = context(&store);
        let view = seed(&store, cluster_template("view")).await;
        let handler = RoleTemplateHandler::new(ctx);
        handler.sync(view.clone()).await.unwrap();

        handler.remove(view).await.unwrap();
        assert!(store.api::<ClusterRole>().list(None).await.unwrap().is_empty());
    }
}
