use anyhow::Context;
use pkg_constants::labels::{RTB_CRB_RB_LABELS_UPDATED, RTB_LABEL_UPDATED};
use pkg_state::{Api, Store};
use pkg_types::rbac::{ClusterRoleBinding, RoleBinding};
use pkg_types::{ObjectMeta, Resource};
use tracing::info;

use crate::error::join_errors;
use crate::ownership::{claim, grant_family, has_owner_label, owned_by};
use crate::retry::update_with_retry;

/// Rewrites legacy owner labels of a role template binding's native
/// bindings into the current scheme, once per binding.
#[derive(Clone)]
pub struct LabelMigrator {
    crbs: Api<ClusterRoleBinding>,
    rbs: Api<RoleBinding>,
}

async fn relabel<B: Resource>(api: &Api<B>, owner: &ObjectMeta) -> anyhow::Result<usize> {
    let stale = api
        .list_matching(None, |b| owned_by(b.meta(), owner) && !has_owner_label(b.meta(), owner))
        .await?;
    let mut relabeled = 0;
    let mut errors = Vec::new();
    for binding in stale {
        let key = binding.meta().key();
        let grant = grant_family(binding.meta()).to_string();
        let result = update_with_retry(api, binding, |b| {
            let mut changed = claim(b.meta_mut(), owner, &grant);
            if b.meta().labels.get(RTB_LABEL_UPDATED).map(String::as_str) != Some("true") {
                b.meta_mut()
                    .labels
                    .insert(RTB_LABEL_UPDATED.to_string(), "true".to_string());
                changed = true;
            }
            changed
        })
        .await;
        match result {
            Ok(_) => {
                info!("Migrated owner labels of {} {} for {}", B::KIND, key, owner.key());
                relabeled += 1;
            }
            Err(e) => {
                errors.push(e.context(format!("couldn't migrate labels of {} {}", B::KIND, key)))
            }
        }
    }
    join_errors(errors)?;
    Ok(relabeled)
}

impl LabelMigrator {
    pub fn new(store: &Store) -> Self {
        Self {
            crbs: store.api(),
            rbs: store.api(),
        }
    }

    pub fn is_migrated(owner: &ObjectMeta) -> bool {
        owner.labels.get(RTB_CRB_RB_LABELS_UPDATED).map(String::as_str) == Some("true")
    }

    /// Relabels the native bindings of `owner` and marks it migrated.
    /// Returns the stored owner.
    pub async fn migrate<K: Resource>(&self, owners: &Api<K>, owner: K) -> anyhow::Result<K> {
        if Self::is_migrated(owner.meta()) {
            return Ok(owner);
        }
        let meta = owner.meta().clone();
        let relabeled = relabel(&self.crbs, &meta).await? + relabel(&self.rbs, &meta).await?;
        if relabeled > 0 {
            info!("Migrated {} native bindings of {} {}", relabeled, K::KIND, meta.key());
        }

        let updated = update_with_retry(owners, owner, |o| {
            if Self::is_migrated(o.meta()) {
                return false;
            }
            o.meta_mut()
                .labels
                .insert(RTB_CRB_RB_LABELS_UPDATED.to_string(), "true".to_string());
            true
        })
        .await
        .with_context(|| format!("couldn't mark {} {} as migrated", K::KIND, meta.key()))?;
        updated.ok_or_else(|| {
            anyhow::anyhow!("{} {} disappeared during label migration", K::KIND, meta.key())
        })
    }
}
