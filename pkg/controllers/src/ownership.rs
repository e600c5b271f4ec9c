//! Multi-owner bookkeeping on native objects.
//!
//! A native object records every role template binding that depends on it
//! as a label `<namespace>_<name>=true`. Objects written by older releases
//! carry one of the legacy shapes instead:
//!
//! * `RTB_OWNER_LABEL=<namespace>_<name>`
//! * `RTB_OWNER_LABEL_LEGACY=<uid>`
//! * `<uid or namespace_name>=<membership-binding-owner | owner-user | ...>`
//!
//! All shapes are read; only the first is written.

use pkg_constants::labels::{
    CRTB_IN_PROJECT_BINDING_OWNER, GRANT_LABEL, GRANT_MEMBERSHIP, GRANT_ROLE_TEMPLATE,
    MEMBERSHIP_BINDING_OWNER, MEMBERSHIP_BINDING_OWNER_LEGACY, OWNER_LABEL_VALUE, OWNER_USER,
    RTB_OWNER_LABEL, RTB_OWNER_LABEL_LEGACY,
};
use pkg_state::{Api, Store};
use pkg_types::binding::{ClusterRoleTemplateBinding, ProjectRoleTemplateBinding};
use pkg_types::{ObjectMeta, Resource};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use crate::naming::owner_label_key;

/// One owner reference parsed from an object's labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerRef {
    /// Sanitized `<namespace>_<name>` of the owning binding.
    NsName(String),
    Uid(String),
    /// Legacy per-owner key that may hold either form.
    Either(String),
}

const LEGACY_OWNER_VALUES: [&str; 4] = [
    MEMBERSHIP_BINDING_OWNER,
    MEMBERSHIP_BINDING_OWNER_LEGACY,
    OWNER_USER,
    CRTB_IN_PROJECT_BINDING_OWNER,
];

fn parse_owner_label(key: &str, value: &str) -> Option<OwnerRef> {
    if key == RTB_OWNER_LABEL {
        return Some(OwnerRef::NsName(value.to_string()));
    }
    if key == RTB_OWNER_LABEL_LEGACY {
        return Some(OwnerRef::Uid(value.to_string()));
    }
    // Owner keys never contain a prefix; every other label of ours does.
    if key.contains('/') {
        return None;
    }
    if value == OWNER_LABEL_VALUE {
        return Some(OwnerRef::NsName(key.to_string()));
    }
    if LEGACY_OWNER_VALUES.contains(&value) {
        return Some(OwnerRef::Either(key.to_string()));
    }
    None
}

/// Every owner referenced by `labels`, in any scheme.
pub fn owner_refs(labels: &BTreeMap<String, String>) -> Vec<OwnerRef> {
    labels
        .iter()
        .filter_map(|(k, v)| parse_owner_label(k, v))
        .collect()
}

fn refers_to(owner_ref: &OwnerRef, key: &str, uid: &str) -> bool {
    match owner_ref {
        OwnerRef::NsName(n) => n == key,
        OwnerRef::Uid(u) => !uid.is_empty() && u == uid,
        OwnerRef::Either(x) => x == key || (!uid.is_empty() && x == uid),
    }
}

/// Whether any label on `meta` names `owner`.
pub fn owned_by(meta: &ObjectMeta, owner: &ObjectMeta) -> bool {
    let key = owner_label_key(owner);
    meta.labels.iter().any(|(k, v)| {
        parse_owner_label(k, v).is_some_and(|r| refers_to(&r, &key, &owner.uid))
    })
}

/// Whether `meta` carries the current-scheme label of `owner`.
pub fn has_owner_label(meta: &ObjectMeta, owner: &ObjectMeta) -> bool {
    meta.labels.get(&owner_label_key(owner)).map(String::as_str) == Some(OWNER_LABEL_VALUE)
}

/// Removes every label that names `owner`. Returns whether anything changed.
pub fn strip_owner(meta: &mut ObjectMeta, owner: &ObjectMeta) -> bool {
    let key = owner_label_key(owner);
    retain_owner_labels(meta, |r| !refers_to(r, &key, &owner.uid))
}

/// Drops owner labels whose reference fails `keep`; other labels stay.
/// Returns whether anything changed.
pub fn retain_owner_labels<F>(meta: &mut ObjectMeta, keep: F) -> bool
where
    F: Fn(&OwnerRef) -> bool,
{
    let before = meta.labels.len();
    meta.labels
        .retain(|k, v| parse_owner_label(k, v).is_none_or(|r| keep(&r)));
    before != meta.labels.len()
}

/// Copies every owner label of `from` onto `to`, in whatever scheme it was
/// written. Returns whether anything was added.
pub fn carry_owner_labels(from: &ObjectMeta, to: &mut ObjectMeta) -> bool {
    let mut changed = false;
    for (k, v) in &from.labels {
        if parse_owner_label(k, v).is_some() && !to.labels.contains_key(k) {
            to.labels.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// Adds the current-scheme label of `owner` and the grant family label.
/// Returns whether anything changed.
pub fn claim(meta: &mut ObjectMeta, owner: &ObjectMeta, grant: &str) -> bool {
    let mut changed = false;
    let key = owner_label_key(owner);
    if meta.labels.get(&key).map(String::as_str) != Some(OWNER_LABEL_VALUE) {
        meta.labels.insert(key, OWNER_LABEL_VALUE.to_string());
        changed = true;
    }
    if meta.labels.get(GRANT_LABEL).map(String::as_str) != Some(grant) {
        meta.labels.insert(GRANT_LABEL.to_string(), grant.to_string());
        changed = true;
    }
    changed
}

/// Grant family an object belongs to. Objects written before families
/// existed are assigned by the shape of their owner labels.
pub fn grant_family(meta: &ObjectMeta) -> &str {
    if let Some(grant) = meta.labels.get(GRANT_LABEL) {
        return grant;
    }
    let membership = meta.labels.values().any(|v| {
        v == MEMBERSHIP_BINDING_OWNER || v == MEMBERSHIP_BINDING_OWNER_LEGACY
    });
    if membership {
        GRANT_MEMBERSHIP
    } else {
        GRANT_ROLE_TEMPLATE
    }
}

/// Snapshot of the role template bindings that currently exist.
/// Bindings that are being deleted no longer count as owners.
#[derive(Debug, Default)]
pub struct OwnerIndex {
    uids: HashSet<String>,
    keys: HashSet<String>,
}

impl OwnerIndex {
    pub fn from_owners<'a>(owners: impl IntoIterator<Item = &'a ObjectMeta>) -> Self {
        let mut index = Self::default();
        for meta in owners {
            index.insert(meta);
        }
        index
    }

    fn insert(&mut self, meta: &ObjectMeta) {
        if meta.is_deleting() {
            return;
        }
        self.uids.insert(meta.uid.clone());
        self.keys.insert(owner_label_key(meta));
    }

    pub fn contains(&self, owner_ref: &OwnerRef) -> bool {
        match owner_ref {
            OwnerRef::NsName(key) => self.keys.contains(key),
            OwnerRef::Uid(uid) => self.uids.contains(uid),
            OwnerRef::Either(x) => self.keys.contains(x) || self.uids.contains(x),
        }
    }
}

/// Answers "does any owner of this object still exist" and releases owners.
#[derive(Clone)]
pub struct OwnershipTracker {
    crtbs: Api<ClusterRoleTemplateBinding>,
    prtbs: Api<ProjectRoleTemplateBinding>,
}

impl OwnershipTracker {
    pub fn new(store: &Store) -> Self {
        Self {
            crtbs: store.api(),
            prtbs: store.api(),
        }
    }

    pub async fn index(&self) -> anyhow::Result<OwnerIndex> {
        let mut index = OwnerIndex::default();
        for crtb in self.crtbs.list(None).await? {
            index.insert(&crtb.metadata);
        }
        for prtb in self.prtbs.list(None).await? {
            index.insert(&prtb.metadata);
        }
        Ok(index)
    }

    /// True when none of the owners referenced by `meta` exist, including
    /// when it references none at all.
    pub async fn no_remaining_owner_labels(&self, meta: &ObjectMeta) -> anyhow::Result<bool> {
        let refs = owner_refs(&meta.labels);
        if refs.is_empty() {
            return Ok(true);
        }
        let index = self.index().await?;
        Ok(!refs.iter().any(|r| index.contains(r)))
    }

    /// Drops `owner` from `obj`. The object is deleted once no referenced
    /// owner remains, otherwise it is updated with the owner's labels
    /// removed. Objects that don't reference `owner` are left alone.
    pub async fn release<K: Resource>(
        &self,
        api: &Api<K>,
        obj: K,
        owner: &ObjectMeta,
    ) -> anyhow::Result<()> {
        let namespace = obj.namespace().to_string();
        let name = obj.name().to_string();
        let mut current = obj;
        let mut retried = false;
        loop {
            if !strip_owner(current.meta_mut(), owner) {
                return Ok(());
            }
            if self.no_remaining_owner_labels(current.meta()).await? {
                info!(
                    "Deleting {} {}, no owners remain after releasing {}",
                    K::KIND,
                    current.meta().key(),
                    owner.key()
                );
                return match api.delete(&namespace, &name).await {
                    Err(e) if !e.is_not_found() => Err(e.into()),
                    _ => Ok(()),
                };
            }
            match api.update(&current).await {
                Ok(_) => {
                    info!(
                        "Removed owner {} from {} {}",
                        owner.key(),
                        K::KIND,
                        current.meta().key()
                    );
                    return Ok(());
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if e.is_conflict() && !retried => {
                    debug!(
                        "Conflict releasing {} {}, retrying once",
                        K::KIND,
                        current.meta().key()
                    );
                    retried = true;
                    match api.get_opt(&namespace, &name).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{crb, crtb, seed, user};
    use pkg_types::rbac::ClusterRoleBinding;

    #[test]
    fn every_label_shape_is_read() {
        let labels: BTreeMap<String, String> = [
            ("c1_crtb-a", "true"),
            (RTB_OWNER_LABEL, "c1_crtb-b"),
            (RTB_OWNER_LABEL_LEGACY, "uid-c"),
            ("uid-d", MEMBERSHIP_BINDING_OWNER_LEGACY),
            (GRANT_LABEL, GRANT_ROLE_TEMPLATE),
            ("unrelated", "value"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let refs = owner_refs(&labels);
        assert_eq!(refs.len(), 4);
        assert!(refs.contains(&OwnerRef::NsName("c1_crtb-a".into())));
        assert!(refs.contains(&OwnerRef::NsName("c1_crtb-b".into())));
        assert!(refs.contains(&OwnerRef::Uid("uid-c".into())));
        assert!(refs.contains(&OwnerRef::Either("uid-d".into())));
    }

    #[test]
    fn strip_removes_all_shapes_of_one_owner() {
        let owner = ObjectMeta {
            uid: "uid-a".into(),
            ..ObjectMeta::namespaced("c1", "crtb-a")
        };
        let mut meta = ObjectMeta::named("crb-x")
            .with_label("c1_crtb-a", "true")
            .with_label(RTB_OWNER_LABEL_LEGACY, "uid-a")
            .with_label("uid-a", MEMBERSHIP_BINDING_OWNER)
            .with_label("c1_crtb-b", "true");

        assert!(owned_by(&meta, &owner));
        assert!(strip_owner(&mut meta, &owner));
        assert!(!owned_by(&meta, &owner));
        assert_eq!(meta.labels.len(), 1);
        assert!(!strip_owner(&mut meta, &owner));
    }

    #[test]
    fn legacy_objects_fall_into_families() {
        let membership = ObjectMeta::named("m").with_label("uid-a", MEMBERSHIP_BINDING_OWNER);
        assert_eq!(grant_family(&membership), GRANT_MEMBERSHIP);
        let rtb = ObjectMeta::named("r").with_label(RTB_OWNER_LABEL, "c1_a");
        assert_eq!(grant_family(&rtb), GRANT_ROLE_TEMPLATE);
        let labeled = ObjectMeta::named("l").with_label(GRANT_LABEL, "cluster-indexed");
        assert_eq!(grant_family(&labeled), "cluster-indexed");
    }

    #[tokio::test]
    async fn owners_are_looked_up_by_key_and_uid() {
        let store = Store::in_memory();
        let a = seed(&store, crtb("c1", "crtb-a", "alice", "view")).await;
        let tracker = OwnershipTracker::new(&store);

        let by_key = ObjectMeta::named("x").with_label("c1_crtb-a", "true");
        assert!(!tracker.no_remaining_owner_labels(&by_key).await.unwrap());
        let by_uid =
            ObjectMeta::named("x").with_label(RTB_OWNER_LABEL_LEGACY, a.metadata.uid.as_str());
        assert!(!tracker.no_remaining_owner_labels(&by_uid).await.unwrap());
        let either = ObjectMeta::named("x").with_label(a.metadata.uid.as_str(), OWNER_USER);
        assert!(!tracker.no_remaining_owner_labels(&either).await.unwrap());

        let gone = ObjectMeta::named("x").with_label("c1_crtb-gone", "true");
        assert!(tracker.no_remaining_owner_labels(&gone).await.unwrap());
        assert!(tracker.no_remaining_owner_labels(&ObjectMeta::named("x")).await.unwrap());
    }

    #[tokio::test]
    async fn shared_binding_survives_until_last_owner_is_released() {
        let store = Store::in_memory();
        let a = seed(&store, crtb("c1", "crtb-a", "alice", "view")).await;
        let b = seed(&store, crtb("c1", "crtb-b", "alice", "view")).await;
        let crbs = store.api::<ClusterRoleBinding>();
        let shared = seed(
            &store,
            crb("crb-shared", "view", user("alice"), &["c1_crtb-a", "c1_crtb-b"]),
        )
        .await;
        let tracker = OwnershipTracker::new(&store);

        store.api::<ClusterRoleTemplateBinding>().delete("c1", "crtb-a").await.unwrap();
        tracker.release(&crbs, shared, &a.metadata).await.unwrap();
        let remaining = crbs.get("", "crb-shared").await.unwrap();
        assert!(!remaining.metadata.labels.contains_key("c1_crtb-a"));
        assert!(remaining.metadata.labels.contains_key("c1_crtb-b"));

        store.api::<ClusterRoleTemplateBinding>().delete("c1", "crtb-b").await.unwrap();
        tracker.release(&crbs, remaining, &b.metadata).await.unwrap();
        assert!(crbs.get_opt("", "crb-shared").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_of_a_stranger_is_a_no_op() {
        let store = Store::in_memory();
        let a = seed(&store, crtb("c1", "crtb-a", "alice", "view")).await;
        let crbs = store.api::<ClusterRoleBinding>();
        let other = seed(&store, crb("crb-other", "view", user("bob"), &["c1_crtb-z"])).await;
        let seq = store.event_log.current_seq().await;

        OwnershipTracker::new(&store)
            .release(&crbs, other, &a.metadata)
            .await
            .unwrap();
        assert_eq!(store.event_log.current_seq().await, seq);
    }

    #[tokio::test]
    async fn release_retries_a_stale_copy() {
        let store = Store::in_memory();
        let a = seed(&store, crtb("c1", "crtb-a", "alice", "view")).await;
        seed(&store, crtb("c1", "crtb-b", "alice", "view")).await;
        let crbs = store.api::<ClusterRoleBinding>();
        let stale = seed(
            &store,
            crb("crb-shared", "view", user("alice"), &["c1_crtb-a", "c1_crtb-b"]),
        )
        .await;

        let mut concurrent = stale.clone();
        concurrent.metadata.annotations.insert("touched".into(), "yes".into());
        crbs.update(&concurrent).await.unwrap();

        OwnershipTracker::new(&store)
            .release(&crbs, stale, &a.metadata)
            .await
            .unwrap();
        let current = crbs.get("", "crb-shared").await.unwrap();
        assert!(!current.metadata.labels.contains_key("c1_crtb-a"));
        assert_eq!(current.metadata.annotations.get("touched").map(String::as_str), Some("yes"));
    }
}
