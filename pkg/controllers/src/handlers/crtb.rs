use async_trait::async_trait;
use pkg_constants::labels::AUTHZ_FINALIZER;
use pkg_state::Api;
use pkg_types::binding::ClusterRoleTemplateBinding;
use pkg_types::cluster::Cluster;
use pkg_types::rbac::RoleRefKind;
use pkg_types::roletemplate::RoleTemplateContext;
use pkg_types::status::{Condition, ReconcileStatus};
use tracing::{debug, info};

use super::HandlerContext;
use crate::controller::{Action, Handler};
use crate::error::{is_permanent, join_errors};
use crate::status::{
    BINDINGS_EXIST, CLUSTER_INDEXED_ROLES_EXIST, MEMBERSHIP_BINDING_EXISTS, ROLES_EXIST,
    SUBJECT_EXISTS, write_status,
};
use crate::subject::build_subject;

/// Grants a role template across a cluster: membership, one
/// ClusterRoleBinding per gathered role and the cluster-indexed Role.
pub struct CrtbHandler {
    ctx: HandlerContext,
    crtbs: Api<ClusterRoleTemplateBinding>,
    clusters: Api<Cluster>,
}

impl CrtbHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            crtbs: ctx.store.api(),
            clusters: ctx.store.api(),
            ctx,
        }
    }

    async fn reconcile(
        &self,
        crtb: &ClusterRoleTemplateBinding,
        status: &mut ReconcileStatus,
    ) -> anyhow::Result<()> {
        let subject = match build_subject(
            "ClusterRoleTemplateBinding",
            &crtb.metadata.name,
            crtb.subject_fields(),
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
            let rt = self.ctx.resolver.get(&crtb.role_template_name).await?;
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

        let cluster = crtb.cluster_name.as_str();
        let mut errors = Vec::new();

        let membership = async {
            let is_owner = self
                .ctx
                .resolver
                .is_owner_role(&crtb.role_template_name, RoleTemplateContext::Cluster)
                .await?;
            self.ctx
                .membership
                .ensure_cluster_membership(cluster, &crtb.metadata, &subject, is_owner)
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

        match self
            .ctx
            .crbs
            .ensure_bindings("", RoleRefKind::ClusterRole, roles.keys(), &crtb.metadata, &subject)
            .await
        {
            Ok(changes) => {
                if !changes.is_empty() {
                    debug!("ClusterRoleBindings of {}: {:?}", crtb.metadata.key(), changes);
                }
                status.set_condition(Condition::ok(BINDINGS_EXIST));
            }
            Err(e) => {
                status.set_condition(Condition::failed(
                    BINDINGS_EXIST,
                    "FailedToCreateBindings",
                    format!("{:#}", e),
                ));
                errors.push(e);
            }
        }

        match self
            .ctx
            .cluster_indexed
            .ensure(cluster, &crtb.role_template_name, &roles, &crtb.metadata, &subject)
            .await
        {
            Ok(_) => status.set_condition(Condition::ok(CLUSTER_INDEXED_ROLES_EXIST)),
            Err(e) => {
                status.set_condition(Condition::failed(
                    CLUSTER_INDEXED_ROLES_EXIST,
                    "FailedToEnsureClusterIndexedRoles",
                    format!("{:#}", e),
                ));
                errors.push(e);
            }
        }

        join_errors(errors)
    }
}

#[async_trait]
impl Handler<ClusterRoleTemplateBinding> for CrtbHandler {
    async fn sync(&self, crtb: ClusterRoleTemplateBinding) -> anyhow::Result<Action> {
        let crtb = self.ctx.migrator.migrate(&self.crtbs, crtb).await?;

        if self.clusters.get_opt("", &crtb.cluster_name).await?.is_none() {
            info!(
                "Cluster {} of {} not found, retrying in {:?}",
                crtb.cluster_name,
                crtb.metadata.key(),
                self.ctx.dependency_delay
            );
            return Ok(Action::RequeueAfter(self.ctx.dependency_delay));
        }

        let mut status = crtb.status.clone();
        let result = self.reconcile(&crtb, &mut status).await;
        status.summarize();
        write_status(&self.crtbs, &crtb, status).await?;

        match result {
            Err(e) if !is_permanent(&e) => Err(e),
            _ => Ok(Action::Done),
        }
    }

    async fn remove(&self, crtb: ClusterRoleTemplateBinding) -> anyhow::Result<Action> {
        let errors = [
            self.ctx.membership.remove_owner(&crtb.metadata).await,
            self.ctx.crbs.remove_owner(None, &crtb.metadata).await,
            self.ctx.cluster_indexed.remove_owner(&crtb.metadata).await,
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();
        join_errors(errors)?;
        info!("Removed bindings of {}", crtb.metadata.key());
        Ok(Action::Done)
    }

    fn finalizer(&self) -> Option<&'static str> {
        Some(AUTHZ_FINALIZER)
    }
}
