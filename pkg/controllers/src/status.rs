use pkg_state::Api;
use pkg_types::Resource;
use pkg_types::binding::{ClusterRoleTemplateBinding, ProjectRoleTemplateBinding};
use pkg_types::roletemplate::RoleTemplate;
use pkg_types::status::ReconcileStatus;
use tracing::debug;

pub const SUBJECT_EXISTS: &str = "SubjectExists";
pub const ROLES_EXIST: &str = "RolesExist";
pub const BINDINGS_EXIST: &str = "BindingsExist";
pub const MEMBERSHIP_BINDING_EXISTS: &str = "MembershipBindingExists";
pub const CLUSTER_INDEXED_ROLES_EXIST: &str = "ClusterIndexedRolesExist";

pub trait HasStatus: Resource {
    fn status(&self) -> &ReconcileStatus;
    fn status_mut(&mut self) -> &mut ReconcileStatus;
}

macro_rules! impl_has_status {
    ($($ty:ty),*) => {
        $(impl HasStatus for $ty {
            fn status(&self) -> &ReconcileStatus {
                &self.status
            }

            fn status_mut(&mut self) -> &mut ReconcileStatus {
                &mut self.status
            }
        })*
    };
}

impl_has_status!(RoleTemplate, ClusterRoleTemplateBinding, ProjectRoleTemplateBinding);

/// Stores `status` on `obj` unless it is already in that state. A conflict
/// is retried once against the stored object.
pub async fn write_status<K: HasStatus>(
    api: &Api<K>,
    obj: &K,
    status: ReconcileStatus,
) -> anyhow::Result<()> {
    if obj.status().same_state(&status) {
        return Ok(());
    }
    let mut current = obj.clone();
    let mut retried = false;
    loop {
        *current.status_mut() = status.clone();
        match api.update_status(&current).await {
            Ok(_) => {
                debug!("Updated status of {} {}: {:?}", K::KIND, obj.meta().key(), status.summary);
                return Ok(());
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) if e.is_conflict() && !retried => {
                retried = true;
                match api.get_opt(obj.namespace(), obj.name()).await? {
                    Some(fresh) if fresh.status().same_state(&status) => return Ok(()),
                    Some(fresh) => current = fresh,
                    None => return Ok(()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}
