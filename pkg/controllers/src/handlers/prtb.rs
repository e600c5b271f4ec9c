use async_trait::async_trait;
use pkg_constants::labels::AUTHZ_FINALIZER;
use pkg_state::Api;
use pkg_types::binding::ProjectRoleTemplateBinding;
use pkg_types::cluster::Project;
use pkg_types::namespace::Namespace;
use pkg_types::rbac::{RoleRefKind, Subject};
use pkg_types::roletemplate::RoleTemplateContext;
use pkg_types::status::{Condition, ReconcileStatus};
use tracing::{debug, info};

use super::HandlerContext;
use crate::controller::{Action, Handler};
use crate::error::{RbacError, is_permanent, join_errors};
use crate::inheritance::RoleSet;
use crate::status::{
    BINDINGS_EXIST, MEMBERSHIP_BINDING_EXISTS, ROLES_EXIST, SUBJECT_EXISTS, write_status,
};
use crate::subject::build_subject;

/// Grants a role template within a project: project and cluster
/// membership plus one RoleBinding per gathered role in every namespace of
/// the project.
pub struct PrtbHandler {
    ctx: HandlerContext,
    prtbs: Api<ProjectRoleTemplateBinding>,
    projects: Api<Project>,
    namespaces: Api<Namespace>,
}

impl PrtbHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            prtbs: ctx.store.api(),
            projects: ctx.store.api(),
            namespaces: ctx.store.api(),
            ctx,
        }
    }

    async fn reconcile(
        &self,
        prtb: &ProjectRoleTemplateBinding,
        cluster: &str,
        project: &str,
        status: &mut ReconcileStatus,
    ) -> anyhow::Result<()> {
        let subject = match build_subject(
            "ProjectRoleTemplateBinding",
            &prtb.metadata.name,
            prtb.subject_fields(),
        ) {
            Ok(subject) => {
                status.set_condition(Condition::ok(SUBJECT_EXISTS));
                subject
            }
            Err(e) => {
                status.set_condition(Condition::failed(
                    SUBJECT_EXISTS,
                    "FailedToBuildSubject",
                    e.to_string(),
                ));
                return Err(e.into());
            }
        };

        let gathered = async {
            let rt = self.ctx.resolver.get(&prtb.role_template_name).await?;
            let roles = self.ctx.resolver.gather_roles(&rt).await?;
            self.ctx.roles.ensure_roles(&roles).await?;
            anyhow::Ok(roles)
        }
        .await;
        let roles = match gathered {
            Ok(roles) => {
                status.set_condition(Condition::ok(ROLES_EXIST));
                roles
            }
            Err(e) => {
                status.set_condition(Condition::failed(
                    ROLES_EXIST,
                    "FailedToEnsureRoles",
                    format!("{:#}", e),
                ));
                return Err(e);
            }
        };

        let mut errors = Vec::new();

        let membership = async {
            let is_owner = self
                .ctx
                .resolver
                .is_owner_role(&prtb.role_template_name, RoleTemplateContext::Project)
                .await?;
            self.ctx
                .membership
                .ensure_project_membership(cluster, project, &prtb.metadata, &subject, is_owner)
                .await
        }
        .await;
        match membership {
            Ok(_) => status.set_condition(Condition::ok(MEMBERSHIP_BINDING_EXISTS)),
            Err(e) => {
                status.set_condition(Condition::failed(
                    MEMBERSHIP_BINDING_EXISTS,
                    "FailedToEnsureMembershipBinding",
                    format!("{:#}", e),
                ));
                errors.push(e);
            }
        }

        match self.ensure_namespace_bindings(prtb, &roles, &subject).await {
            Ok(()) => status.set_condition(Condition::ok(BINDINGS_EXIST)),
            Err(e) => {
                status.set_condition(Condition::failed(
                    BINDINGS_EXIST,
                    "FailedToCreateBindings",
                    format!("{:#}", e),
                ));
                errors.push(e);
            }
        }

        join_errors(errors)
    }

    async fn ensure_namespace_bindings(
        &self,
        prtb: &ProjectRoleTemplateBinding,
        roles: &RoleSet,
        subject: &Subject,
    ) -> anyhow::Result<()> {
        let namespaces = self
            .namespaces
            .list_matching(None, |ns| ns.project_id() == Some(prtb.project_name.as_str()))
            .await?;
        let mut errors = Vec::new();
        for ns in &namespaces {
            match self
                .ctx
                .rbs
                .ensure_bindings(
                    &ns.metadata.name,
                    RoleRefKind::ClusterRole,
                    roles.keys(),
                    &prtb.metadata,
                    subject,
                )
                .await
            {
                Ok(changes) if !changes.is_empty() => {
                    debug!(
                        "RoleBindings of {} in {}: {:?}",
                        prtb.metadata.key(),
                        ns.metadata.name,
                        changes
                    );
                }
                Ok(_) => {}
                Err(e) => errors.push(e.context(format!("namespace {}", ns.metadata.name))),
            }
        }
        join_errors(errors)
    }
}

#[async_trait]
impl Handler<ProjectRoleTemplateBinding> for PrtbHandler {
    async fn sync(&self, prtb: ProjectRoleTemplateBinding) -> anyhow::Result<Action> {
        let prtb = self.ctx.migrator.migrate(&self.prtbs, prtb).await?;

        let Some((cluster, project)) = prtb.project_id() else {
            let err = RbacError::InvalidProjectName {
                name: prtb.metadata.key(),
                value: prtb.project_name.clone(),
            };
            let mut status = prtb.status.clone();
            status.set_condition(Condition::failed(
                BINDINGS_EXIST,
                "InvalidProjectName",
                err.to_string(),
            ));
            status.summarize();
            write_status(&self.prtbs, &prtb, status).await?;
            return Ok(Action::Done);
        };

        if self.projects.get_opt(cluster, project).await?.is_none() {
            info!(
                "Project {} of {} not found, retrying in {:?}",
                prtb.project_name,
                prtb.metadata.key(),
                self.ctx.dependency_delay
            );
            return Ok(Action::RequeueAfter(self.ctx.dependency_delay));
        }

        let mut status = prtb.status.clone();
        let result = self.reconcile(&prtb, cluster, project, &mut status).await;
        status.summarize();
        write_status(&self.prtbs, &prtb, status).await?;

        match result {
            Err(e) if !is_permanent(&e) => Err(e),
            _ => Ok(Action::Done),
        }
    }

    async fn remove(&self, prtb: ProjectRoleTemplateBinding) -> anyhow::Result<Action> {
        let errors = [
            self.ctx.membership.remove_owner(&prtb.metadata).await,
            self.ctx.rbs.remove_owner(None, &prtb.metadata).await,
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();
        join_errors(errors)?;
        info!("Removed bindings of {}", prtb.metadata.key());
        Ok(Action::Done)
    }

    fn finalizer(&self) -> Option<&'static str> {
        Some(AUTHZ_FINALIZER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::fixtures::context;
    use crate::membership::{cluster_membership_role, project_membership_role};
    use crate::testutil::{prtb, project_template, seed, user};
    use pkg_constants::labels::{GRANT_LABEL, GRANT_MEMBERSHIP};
    use pkg_state::Store;
    use pkg_types::cluster::Cluster;
    use pkg_types::rbac::{ClusterRoleBinding, RoleBinding};
    use pkg_types::status::Summary;

    async fn seed_project(store: &Store) {
        seed(store, Cluster::new("c1")).await;
        seed(store, Project::new("c1", "p1")).await;
        seed(store, Namespace::in_project("ns-a", "c1:p1")).await;
        seed(store, Namespace::in_project("ns-b", "c1:p1")).await;
        seed(store, Namespace::in_project("ns-other", "c1:p2")).await;
    }

    #[tokio::test]
    async fn binds_every_namespace_of_the_project() {
        let store = Store::in_memory();
        let handler = PrtbHandler::new(context(&store));
        seed_project(&store).await;
        seed(&store, project_template("deployer")).await;
        let binding = seed(&store, prtb("c1", "p1", "prtb-1", "bob", "deployer")).await;

        assert_eq!(handler.sync(binding).await.unwrap(), Action::Done);

        let rbs = store.api::<RoleBinding>().list(None).await.unwrap();
        let mut granted: Vec<&str> = rbs
            .iter()
            .filter(|rb| rb.role_ref.name == "deployer")
            .map(|rb| rb.metadata.namespace.as_str())
            .collect();
        granted.sort();
        assert_eq!(granted, vec!["ns-a", "ns-b"]);
        assert!(rbs.iter().all(|rb| rb.subjects == vec![user("bob")]));

        let project_member = rbs
            .iter()
            .find(|rb| {
                rb.metadata.labels.get(GRANT_LABEL).map(String::as_str) == Some(GRANT_MEMBERSHIP)
            })
            .unwrap();
        assert_eq!(project_member.metadata.namespace, "c1");
        assert_eq!(project_member.role_ref.name, project_membership_role("p1", false));

        let crbs = store.api::<ClusterRoleBinding>().list(None).await.unwrap();
        assert_eq!(crbs.len(), 1);
        assert_eq!(crbs[0].role_ref.name, cluster_membership_role("c1", false));

        let stored = store.api::<ProjectRoleTemplateBinding>().get("p1", "prtb-1").await.unwrap();
        assert_eq!(stored.status.summary, Summary::Completed);
    }

    #[tokio::test]
    async fn malformed_project_name_is_recorded() {
        let store = Store::in_memory();
        let handler = PrtbHandler::new(context(&store));
        seed_project(&store).await;
        seed(&store, project_template("deployer")).await;
        let mut binding = prtb("c1", "p1", "prtb-1", "bob", "deployer");
        binding.project_name = "p1".to_string();
        let binding = seed(&store, binding).await;

        assert_eq!(handler.sync(binding).await.unwrap(), Action::Done);

        let stored = store.api::<ProjectRoleTemplateBinding>().get("p1", "prtb-1").await.unwrap();
        assert_eq!(stored.status.summary, Summary::Error);
        assert_eq!(stored.status.condition(BINDINGS_EXIST).unwrap().reason, "InvalidProjectName");
        assert!(store.api::<RoleBinding>().list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_project_is_retried_later() {
        let store = Store::in_memory();
        let ctx = context(&store);
        let delay = ctx.dependency_delay;
        let handler = PrtbHandler::new(ctx);
        seed(&store, Cluster::new("c1")).await;
        seed(&store, project_template("deployer")).await;
        let binding = seed(&store, prtb("c1", "p1", "prtb-1", "bob", "deployer")).await;

        assert_eq!(handler.sync(binding).await.unwrap(), Action::RequeueAfter(delay));
    }

    #[tokio::test]
    async fn invalid_service_account_is_not_retried() {
        let store = Store::in_memory();
        let handler = PrtbHandler::new(context(&store));
        seed_project(&store).await;
        seed(&store, project_template("deployer")).await;
        let mut binding = prtb("c1", "p1", "prtb-1", "", "deployer");
        binding.service_account = "no-namespace".to_string();
        let binding = seed(&store, binding).await;

        assert_eq!(handler.sync(binding).await.unwrap(), Action::Done);
        let stored = store.api::<ProjectRoleTemplateBinding>().get("p1", "prtb-1").await.unwrap();
        assert_eq!(stored.status.summary, Summary::Error);
    }

    #[tokio::test]
    async fn remove_releases_everything() {
        let store = Store::in_memory();
        let handler = PrtbHandler::new(context(&store));
        seed_project(&store).await;
        seed(&store, project_template("deployer")).await;
        let binding = seed(&store, prtb("c1", "p1", "prtb-1", "bob", "deployer")).await;
        handler.sync(binding.clone()).await.unwrap();

        handler.remove(binding).await.unwrap();
        assert!(store.api::<RoleBinding>().list(None).await.unwrap().is_empty());
        assert!(store.api::<ClusterRoleBinding>().list(None).await.unwrap().is_empty());
    }
}
