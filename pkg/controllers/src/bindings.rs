use pkg_constants::labels::{GRANT_LABEL, OWNER_LABEL_VALUE, RBAC_API_GROUP};
use pkg_state::{Api, Store};
use pkg_types::rbac::{ClusterRoleBinding, RoleBinding, RoleRef, RoleRefKind, Subject};
use pkg_types::{ObjectMeta, Resource};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::join_errors;
use crate::naming::{
    cluster_role_binding_name, owner_label_key, role_binding_name, role_subject_key,
};
use crate::ownership::{
    OwnerRef, OwnershipTracker, claim, grant_family, owned_by, owner_refs, retain_owner_labels,
};
use crate::retry::update_with_retry;

/// What the reconciler needs to know about a native binding kind.
pub trait NativeBinding: Resource {
    fn role_ref(&self) -> &RoleRef;

    fn subjects(&self) -> &[Subject];

    fn role_ref_name(&self) -> &str {
        &self.role_ref().name
    }

    fn from_parts(metadata: ObjectMeta, role_ref: RoleRef, subject: Subject) -> Self;

    /// Deterministic name of the binding granting `role_ref` to `subject`.
    fn binding_name(namespace: &str, role_ref: &RoleRef, subject: &Subject) -> String;
}

impl NativeBinding for ClusterRoleBinding {
    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    fn from_parts(metadata: ObjectMeta, role_ref: RoleRef, subject: Subject) -> Self {
        Self {
            metadata,
            role_ref,
            subjects: vec![subject],
        }
    }

    fn binding_name(_namespace: &str, role_ref: &RoleRef, subject: &Subject) -> String {
        cluster_role_binding_name(role_ref, subject)
    }
}

impl NativeBinding for RoleBinding {
    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    fn from_parts(metadata: ObjectMeta, role_ref: RoleRef, subject: Subject) -> Self {
        Self {
            metadata,
            role_ref,
            subjects: vec![subject],
        }
    }

    fn binding_name(namespace: &str, role_ref: &RoleRef, subject: &Subject) -> String {
        role_binding_name(namespace, role_ref, subject)
    }
}

/// Builds the labeled native binding `owner` needs for `role_ref`.
pub fn desired_binding<B: NativeBinding>(
    namespace: &str,
    role_ref: RoleRef,
    subject: &Subject,
    owner: &ObjectMeta,
    grant: &str,
) -> B {
    let name = B::binding_name(namespace, &role_ref, subject);
    let mut metadata = if B::NAMESPACED {
        ObjectMeta::namespaced(namespace, name)
    } else {
        ObjectMeta::named(name)
    };
    metadata
        .labels
        .insert(owner_label_key(owner), OWNER_LABEL_VALUE.to_string());
    metadata
        .labels
        .insert(GRANT_LABEL.to_string(), grant.to_string());
    B::from_parts(metadata, role_ref, subject.clone())
}

pub fn rbac_role_ref(kind: RoleRefKind, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind,
        name: name.to_string(),
    }
}

/// Writes performed by one `ensure_bindings` pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BindingChanges {
    pub created: usize,
    pub adopted: usize,
    pub released: usize,
}

impl BindingChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Keeps the set of native bindings owned by one role template binding in
/// step with the roles it resolves to.
///
/// Every reconciler works on one grant family, so reconcilers for different
/// purposes never release each other's objects.
pub struct BindingReconciler<B> {
    api: Api<B>,
    ownership: OwnershipTracker,
    grant: &'static str,
}

impl<B> Clone for BindingReconciler<B> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            ownership: self.ownership.clone(),
            grant: self.grant,
        }
    }
}

impl<B: NativeBinding> BindingReconciler<B> {
    pub fn new(store: &Store, ownership: OwnershipTracker, grant: &'static str) -> Self {
        Self {
            api: store.api(),
            ownership,
            grant,
        }
    }

    pub fn api(&self) -> &Api<B> {
        &self.api
    }

    fn scope(namespace: &str) -> Option<&str> {
        if B::NAMESPACED { Some(namespace) } else { None }
    }

    /// Objects of this family that name `owner` in any label scheme.
    pub async fn owned(
        &self,
        namespace: Option<&str>,
        owner: &ObjectMeta,
    ) -> anyhow::Result<Vec<B>> {
        let grant = self.grant;
        Ok(self
            .api
            .list_matching(namespace, |b| {
                grant_family(b.meta()) == grant && owned_by(b.meta(), owner)
            })
            .await?)
    }

    /// Makes the bindings owned by `owner` in `namespace` exactly one per
    /// role in `role_names`, each granting that role to `subject`.
    ///
    /// Existing objects that already grant a wanted (role, subject) pair are
    /// kept and relabeled if needed. Owned objects that grant anything else,
    /// or more than one subject, are released. Every create and release is
    /// attempted; failures are joined.
    pub async fn ensure_bindings<I, S>(
        &self,
        namespace: &str,
        role_kind: RoleRefKind,
        role_names: I,
        owner: &ObjectMeta,
        subject: &Subject,
    ) -> anyhow::Result<BindingChanges>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut desired: BTreeMap<String, B> = role_names
            .into_iter()
            .map(|role| {
                let role = role.as_ref();
                let key = role_subject_key(role, subject);
                let role_ref = rbac_role_ref(role_kind, role);
                let binding = desired_binding(namespace, role_ref, subject, owner, self.grant);
                (key, binding)
            })
            .collect();

        let mut changes = BindingChanges::default();
        let mut stale = Vec::new();
        let mut errors = Vec::new();

        for existing in self.owned(Self::scope(namespace), owner).await? {
            let satisfies = match existing.subjects() {
                [only] if existing.role_ref().kind == role_kind => {
                    desired.remove(&role_subject_key(existing.role_ref_name(), only))
                }
                _ => None,
            };
            if satisfies.is_none() {
                stale.push(existing);
                continue;
            }
            match self.adopt(existing, owner).await {
                Ok(true) => changes.adopted += 1,
                Ok(false) => {}
                Err(e) => errors.push(e),
            }
        }

        for (_, binding) in desired {
            match self.create(binding, owner).await {
                Ok(true) => changes.created += 1,
                Ok(false) => changes.adopted += 1,
                Err(e) => errors.push(e),
            }
        }

        for binding in stale {
            let key = binding.meta().key();
            match self.ownership.release(&self.api, binding, owner).await {
                Ok(()) => changes.released += 1,
                Err(e) => errors.push(e.context(format!("couldn't release {} {}", B::KIND, key))),
            }
        }

        join_errors(errors)?;
        if changes.is_empty() {
            debug!("{} bindings of {} are up to date", B::KIND, owner.key());
        }
        Ok(changes)
    }

    /// Relabels an object found by a legacy label with the current scheme.
    async fn adopt(&self, existing: B, owner: &ObjectMeta) -> anyhow::Result<bool> {
        let mut probe = existing.meta().clone();
        if !claim(&mut probe, owner, self.grant) {
            return Ok(false);
        }
        info!("Adding owner {} to {} {}", owner.key(), B::KIND, existing.meta().key());
        let grant = self.grant;
        update_with_retry(&self.api, existing, |b| claim(b.meta_mut(), owner, grant)).await?;
        Ok(true)
    }

    /// Creates `binding`. If it already exists with the same grant, `owner`
    /// joins its owners. Returns false when an existing object was shared.
    async fn create(&self, binding: B, owner: &ObjectMeta) -> anyhow::Result<bool> {
        let key = binding.meta().key();
        match self.api.create(&binding).await {
            Ok(_) => {
                info!("Creating {} {} for {}", B::KIND, key, owner.key());
                return Ok(true);
            }
            Err(e) if !e.is_already_exists() => {
                return Err(anyhow::Error::from(e)
                    .context(format!("couldn't create {} {}", B::KIND, key)));
            }
            Err(_) => {}
        }

        let ns = binding.meta().namespace.clone();
        let name = binding.meta().name.clone();
        let Some(existing) = self.api.get_opt(&ns, &name).await? else {
            // Deleted between the create and the get; the next pass recreates it.
            anyhow::bail!("{} {} disappeared while being created", B::KIND, key);
        };
        if existing.role_ref() != binding.role_ref() || existing.subjects() != binding.subjects() {
            anyhow::bail!("{} {} exists with a different role or subject", B::KIND, key);
        }
        if let Some(grant) = existing.meta().labels.get(GRANT_LABEL) {
            if grant != self.grant {
                anyhow::bail!(
                    "{} {} belongs to the {} grant, not {}",
                    B::KIND,
                    key,
                    grant,
                    self.grant
                );
            }
        }
        self.adopt(existing, owner).await?;
        Ok(false)
    }

    /// Releases every object of this family that `owner` holds.
    pub async fn remove_owner(
        &self,
        namespace: Option<&str>,
        owner: &ObjectMeta,
    ) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        for binding in self.owned(namespace, owner).await? {
            if let Err(e) = self.ownership.release(&self.api, binding, owner).await {
                errors.push(e);
            }
        }
        join_errors(errors)
    }

    /// Drops every owner label for which `keep` is false from objects of this
    /// family in `namespace`. Objects left without owners are deleted.
    pub async fn retain_owners<F>(&self, namespace: Option<&str>, keep: F) -> anyhow::Result<usize>
    where
        F: Fn(&OwnerRef) -> bool,
    {
        let grant = self.grant;
        let candidates = self
            .api
            .list_matching(namespace, |b| {
                grant_family(b.meta()) == grant && !owner_refs(&b.meta().labels).iter().all(&keep)
            })
            .await?;

        let mut touched = 0;
        let mut errors = Vec::new();
        for binding in candidates {
            let key = binding.meta().key();
            let mut stripped = binding.meta().clone();
            retain_owner_labels(&mut stripped, &keep);
            let result = if owner_refs(&stripped.labels).is_empty() {
                info!("Deleting {} {}, none of its owners apply here", B::KIND, key);
                match self.api.delete(&binding.meta().namespace, &binding.meta().name).await {
                    Err(e) if !e.is_not_found() => Err(e.into()),
                    _ => Ok(()),
                }
            } else {
                info!("Removing foreign owners from {} {}", B::KIND, key);
                update_with_retry(&self.api, binding, |b| retain_owner_labels(b.meta_mut(), &keep))
                    .await
                    .map(|_| ())
            };
            match result {
                Ok(()) => touched += 1,
                Err(e) => errors.push(e),
            }
        }
        join_errors(errors)?;
        Ok(touched)
    }
}
