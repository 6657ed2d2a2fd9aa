use thiserror::Error;

use crate::store::StoreError;

/// SafeNest core error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafeNestError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("A monitored person ({existing_name}) is already registered with this code")]
    Conflict { existing_name: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already linked to household {0}")]
    AlreadyLinked(String),

    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Signal source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SafeNestError {
    /// Validation and conflict errors are meant for the user; everything else is diagnostic.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            SafeNestError::InvalidInput(_)
                | SafeNestError::Conflict { .. }
                | SafeNestError::NotFound(_)
                | SafeNestError::AlreadyLinked(_)
        )
    }
}

impl From<StoreError> for SafeNestError {
    fn from(err: StoreError) -> Self {
        SafeNestError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for SafeNestError {
    fn from(err: serde_json::Error) -> Self {
        SafeNestError::Serialization(err.to_string())
    }
}

/// Result type for core operations
pub type SResult<T> = Result<T, SafeNestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_occupant() {
        let err = SafeNestError::Conflict {
            existing_name: "Alice".to_string(),
        };
        assert!(err.to_string().contains("Alice"));
        assert!(err.is_user_facing());
    }

    #[test]
    fn test_store_error_maps_to_unavailable() {
        let err: SafeNestError = StoreError::Offline.into();
        assert!(matches!(err, SafeNestError::StoreUnavailable(_)));
        assert!(!err.is_user_facing());
    }
}
