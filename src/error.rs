//! Error taxonomy for section, approval and signature operations
use super::types::SectionStatus;
use std::fmt;

/// Why an electronic signature did not authorize an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureFailure {
    NotFound,
    UserMismatch,
    HashMismatch,
    Expired,
    AlreadyConsumed,
}

impl SignatureFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureFailure::NotFound => "NOT_FOUND",
            SignatureFailure::UserMismatch => "USER_MISMATCH",
            SignatureFailure::HashMismatch => "HASH_MISMATCH",
            SignatureFailure::Expired => "EXPIRED",
            SignatureFailure::AlreadyConsumed => "ALREADY_CONSUMED",
        }
    }
}

impl fmt::Display for SignatureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Section '{section_id}' is locked ({status}); changes require an approved change request")]
    SectionLocked {
        section_id: String,
        status: SectionStatus,
    },
    #[error("Section '{section_id}' already has a pending approval request")]
    PendingApprovalExists { section_id: String },
    #[error("{message}")]
    DependencyUnmet {
        section_id: String,
        source_section_id: String,
        message: String,
    },
    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: SectionStatus,
        to: SectionStatus,
    },
    #[error("Electronic signature rejected: {0}")]
    SignatureInvalid(SignatureFailure),
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Concurrent modification of section '{section_id}': {detail}")]
    ConcurrencyConflict { section_id: String, detail: String },
    #[error("Stored record could not be decoded: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Storage(#[from] sled::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Client-facing classification of a [`RecordError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    LockConflict,
    DependencyUnmet,
    SignatureInvalid,
    NotFound,
    ConcurrencyConflict,
    Internal,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Validation | ErrorKind::LockConflict | ErrorKind::DependencyUnmet => 400,
            ErrorKind::SignatureInvalid => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::ConcurrencyConflict | ErrorKind::Internal => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::LockConflict => "LOCK_CONFLICT",
            ErrorKind::DependencyUnmet => "DEPENDENCY_UNMET",
            ErrorKind::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl RecordError {
    pub fn validation(message: impl Into<String>) -> Self {
        RecordError::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        RecordError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RecordError::Validation(_) | RecordError::IllegalTransition { .. } => {
                ErrorKind::Validation
            }
            RecordError::SectionLocked { .. } | RecordError::PendingApprovalExists { .. } => {
                ErrorKind::LockConflict
            }
            RecordError::DependencyUnmet { .. } => ErrorKind::DependencyUnmet,
            RecordError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            RecordError::NotFound { .. } => ErrorKind::NotFound,
            RecordError::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            RecordError::Corrupt(_) | RecordError::Storage(_) | RecordError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        let locked = RecordError::SectionLocked {
            section_id: "S1".into(),
            status: SectionStatus::Completed,
        };
        assert_eq!(locked.kind().status_code(), 400);
        assert_eq!(
            RecordError::SignatureInvalid(SignatureFailure::Expired)
                .kind()
                .status_code(),
            401
        );
        assert_eq!(RecordError::not_found("Section", "S1").kind().status_code(), 404);
        let conflict = RecordError::ConcurrencyConflict {
            section_id: "S1".into(),
            detail: "active version moved".into(),
        };
        assert_eq!(conflict.kind().status_code(), 500);
    }

    #[test]
    fn locked_message_names_section() {
        let err = RecordError::SectionLocked {
            section_id: "weighing".into(),
            status: SectionStatus::Completed,
        };
        assert!(err.to_string().contains("weighing"));
        assert!(err.to_string().contains("COMPLETED"));
    }
}
