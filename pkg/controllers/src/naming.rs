//! Deterministic names for generated objects and ownership labels.

use pkg_constants::limits::MAX_NAME_LENGTH;
use pkg_types::ObjectMeta;
use pkg_types::rbac::{RoleRef, Subject};
use sha2::{Digest, Sha256};

/// Joins `parts` with `-`. Results longer than 63 characters are truncated
/// and suffixed with a short hash of the full name so they stay unique.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LENGTH {
        return full;
    }
    let digest = hex::encode(Sha256::digest(full.as_bytes()));
    let bytes = full.as_bytes();
    // A cut that would leave a trailing separator drops one more character.
    let cut = if bytes[56].is_ascii_lowercase() || bytes[56].is_ascii_digit() {
        57
    } else {
        56
    };
    let prefix = String::from_utf8_lossy(&bytes[..cut]);
    format!("{}-{}", prefix, &digest[..5])
}

/// Ownership label key identifying one role template binding:
/// the sanitized `<namespace>_<name>`.
pub fn owner_label_key(meta: &ObjectMeta) -> String {
    safe_concat_name(&[&format!("{}_{}", meta.namespace, meta.name)])
}

/// Identity of a (role, subject) pair inside one reconcile pass.
pub fn role_subject_key(role_name: &str, subject: &Subject) -> String {
    format!("{} {} Role {}", subject.kind, subject.name, role_name)
}

/// Hex digits of the binding hash kept in the name (52 bits).
const BINDING_HASH_LEN: usize = 13;

/// Parts are NUL-separated so no pair of role and subject names can shift
/// characters between fields.
fn binding_hash(namespace: &str, role_ref: &RoleRef, subject: &Subject) -> String {
    let input = [
        namespace.to_string(),
        role_ref.kind.to_string(),
        role_ref.name.clone(),
        subject.kind.to_string(),
        subject.name.clone(),
    ]
    .join("\0");
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest[..BINDING_HASH_LEN].to_string()
}

/// Name of the ClusterRoleBinding granting `role_ref` to `subject`.
pub fn cluster_role_binding_name(role_ref: &RoleRef, subject: &Subject) -> String {
    format!("crb-{}", binding_hash("", role_ref, subject))
}

/// Name of the RoleBinding granting `role_ref` to `subject`. `namespace`
/// is mixed into the hash.
pub fn role_binding_name(namespace: &str, role_ref: &RoleRef, subject: &Subject) -> String {
    format!("rb-{}", binding_hash(namespace, role_ref, subject))
}
