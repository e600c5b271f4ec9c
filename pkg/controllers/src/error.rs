use thiserror::Error;

/// Failures specific to compiling role templates into native RBAC.
#[derive(Error, Debug)]
pub enum RbacError {
    #[error("role template {template:?}: {detail}, possible circular dependency")]
    CircularDependency { template: String, detail: String },

    #[error("{kind} {name} has more than one subject field set")]
    AmbiguousSubject { kind: &'static str, name: String },

    #[error("{kind} {name} doesn't have any subject fields set")]
    MissingSubject { kind: &'static str, name: String },

    #[error("service account {value:?} of {name} is not of the form namespace:name")]
    InvalidServiceAccount { name: String, value: String },

    #[error("project name {value:?} of {name} is not of the form cluster:project")]
    InvalidProjectName { name: String, value: String },

    #[error("couldn't get role template {name:?}")]
    RoleTemplateNotFound { name: String },

    #[error("{} operations failed: {}", .0.len(), .0.join("; "))]
    Aggregate(Vec<String>),
}

impl RbacError {
    /// Errors that only a change to the binding or its templates can fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RbacError::CircularDependency { .. }
                | RbacError::AmbiguousSubject { .. }
                | RbacError::MissingSubject { .. }
                | RbacError::InvalidServiceAccount { .. }
                | RbacError::InvalidProjectName { .. }
        )
    }
}

/// True if `err` wraps a permanent [`RbacError`].
pub fn is_permanent(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RbacError>()
        .is_some_and(RbacError::is_permanent)
}

/// Collects the outcome of independent operations: `Ok` if all succeeded,
/// the error itself if exactly one failed, `Aggregate` otherwise.
pub fn join_errors(errors: Vec<anyhow::Error>) -> anyhow::Result<()> {
    let mut errors = errors;
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(RbacError::Aggregate(errors.iter().map(|e| format!("{:#}", e)).collect()).into()),
    }
}
