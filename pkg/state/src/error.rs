use thiserror::Error;

/// Errors returned by typed [`crate::Api`] operations.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("conflict writing {kind} {name:?}: resource version {expected} is stale (current {current})")]
    Conflict {
        kind: &'static str,
        name: String,
        expected: u64,
        current: u64,
    },

    #[error("invalid {kind} {name:?}: {reason}")]
    Invalid {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("failed to encode or decode {kind} {name:?}: {source}")]
    Serialization {
        kind: &'static str,
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }
}

/// True if `err` wraps an [`ApiError::NotFound`], context layers included.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .is_some_and(ApiError::is_not_found)
}

pub fn is_already_exists(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .is_some_and(ApiError::is_already_exists)
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .is_some_and(ApiError::is_conflict)
}
