//! Label and annotation keys written onto native RBAC objects.
//!
//! These keys are read by other components (and by older releases of this
//! controller), so changing any value here is a breaking change.

// ─── Ownership ────────────────────────────────────────────────────────────

/// Value of a current-scheme ownership label. The key is the sanitized
/// `<namespace>_<name>` of the owning binding.
pub const OWNER_LABEL_VALUE: &str = "true";

/// Single-owner label whose value is the sanitized `<namespace>_<name>` of the
/// owning binding. Written by the previous binding scheme; still read.
pub const RTB_OWNER_LABEL: &str = "authz.cluster.cattle.io/rtb-owner-updated";

/// Single-owner label whose value is the UID of the owning binding.
/// Written before bindings were addressed by namespace and name.
pub const RTB_OWNER_LABEL_LEGACY: &str = "authz.cluster.cattle.io/rtb-owner";

/// Value of a per-UID membership owner label (`<uid>=<value>`), legacy scheme.
/// The misspelling is what older releases wrote.
pub const MEMBERSHIP_BINDING_OWNER_LEGACY: &str = "memberhsip-binding-owner";

/// Value of a membership owner label written by the intermediate scheme.
pub const MEMBERSHIP_BINDING_OWNER: &str = "membership-binding-owner";

/// Value of a per-UID owner label written for promoted-role bindings.
pub const OWNER_USER: &str = "owner-user";

/// Value of a per-UID owner label on RoleBindings a cluster binding created
/// in project namespaces, legacy scheme.
pub const CRTB_IN_PROJECT_BINDING_OWNER: &str = "crtb-in-project-binding-owner";

/// Marks a native binding whose legacy labels were already rewritten.
pub const RTB_LABEL_UPDATED: &str = "authz.cluster.cattle.io/rtb-label-updated";

/// Marks a logical binding whose native bindings were already migrated.
pub const RTB_CRB_RB_LABELS_UPDATED: &str = "authz.cluster.cattle.io/crb-rb-labels-updated";

// ─── Grant families ───────────────────────────────────────────────────────

/// Distinguishes the families of native bindings this controller writes so
/// one family's reconcile never touches another family's objects.
pub const GRANT_LABEL: &str = "authz.cluster.cattle.io/grant";

/// Bindings to the ClusterRoles generated from RoleTemplates.
pub const GRANT_ROLE_TEMPLATE: &str = "role-template";

/// Bindings to cluster/project membership roles.
pub const GRANT_MEMBERSHIP: &str = "membership";

/// Bindings to per-cluster roles over cluster-indexed resources.
pub const GRANT_CLUSTER_INDEXED: &str = "cluster-indexed";

// ─── Annotations ──────────────────────────────────────────────────────────

/// Maps a generated ClusterRole back to the RoleTemplate that produced it.
pub const CLUSTER_ROLE_OWNER_ANNOTATION: &str = "authz.cluster.cattle.io/clusterrole-owner";

/// Cluster a membership ClusterRole / ClusterRoleBinding belongs to.
pub const CLUSTER_NAME_ANNOTATION: &str = "cluster.cattle.io/name";

/// Result of the one-time global admin check on an admin ClusterRoleBinding.
pub const ADMIN_GLOBAL_ROLE_CHECKED_ANNOTATION: &str =
    "authz.cluster.cattle.io/admin-globalrole-checked";

// ─── Registry ─────────────────────────────────────────────────────────────

/// CRD label that marks a resource kind as indexed per downstream cluster.
pub const CLUSTER_INDEXED_LABEL: &str = "auth.cattle.io/cluster-indexed";

/// Value of `CLUSTER_INDEXED_LABEL` that enables registration.
pub const CLUSTER_INDEXED_VALUE: &str = "true";

// ─── API groups and resources ─────────────────────────────────────────────

/// API group of the platform's own objects.
pub const MANAGEMENT_API_GROUP: &str = "management.cattle.io";

/// API group subjects of kind User and Group live in.
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

pub const CLUSTERS_RESOURCE: &str = "clusters";
pub const PROJECTS_RESOURCE: &str = "projects";

/// Builtin native ClusterRole that grants full administrative access.
pub const CLUSTER_ADMIN_ROLE: &str = "cluster-admin";

/// Builtin owner RoleTemplates.
pub const CLUSTER_OWNER_TEMPLATE: &str = "cluster-owner";
pub const PROJECT_OWNER_TEMPLATE: &str = "project-owner";

/// Role-ref of the legacy namespace-creation ClusterRole.
pub const CREATE_NS_ROLE: &str = "create-ns";

// ─── Finalizers ───────────────────────────────────────────────────────────

/// Holds RoleTemplates and role template bindings until their native
/// objects have been cleaned up.
pub const AUTHZ_FINALIZER: &str = "authz.cluster.cattle.io/cleanup";
