//! Bounds on role template inheritance traversal.

/// After this many traversal steps a warning is logged but traversal continues.
pub const ROLES_CIRCULAR_SOFT_LIMIT: usize = 100;

/// After this many traversal steps the traversal aborts with a
/// circular dependency error.
pub const ROLES_CIRCULAR_HARD_LIMIT: usize = 500;

/// Maximum length of a generated object or label name.
pub const MAX_NAME_LENGTH: usize = 63;
