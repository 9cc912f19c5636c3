use thiserror::Error;

use crate::kv::KvError;
use crate::ports::RepositoryError;

/// Stable classification of every failure the engine can return.
///
/// Transport layers map these onto protocol codes; the set does not change
/// when new error variants are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyCompleted,
    PermissionDenied,
    NotOnDuty,
    ModeForbidsAction,
    NoJobsSpecified,
    BackingStoreFailure,
    DuplicateKey,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::AlreadyCompleted => write!(f, "already_completed"),
            ErrorKind::PermissionDenied => write!(f, "permission_denied"),
            ErrorKind::NotOnDuty => write!(f, "not_on_duty"),
            ErrorKind::ModeForbidsAction => write!(f, "mode_forbids_action"),
            ErrorKind::NoJobsSpecified => write!(f, "no_jobs_specified"),
            ErrorKind::BackingStoreFailure => write!(f, "backing_store_failure"),
            ErrorKind::DuplicateKey => write!(f, "duplicate_key"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CentrumError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Dispatch {0} is already completed")]
    AlreadyCompleted(u64),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("User {0} is not on duty")]
    NotOnDuty(u64),

    #[error("Centrum mode for job {0} does not allow this action")]
    ModeForbidsAction(String),

    #[error("Dispatch has no jobs specified")]
    NoJobsSpecified,

    #[error("Backing store failure during {op}: {message}")]
    BackingStore { op: String, message: String },

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
}

impl CentrumError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CentrumError::NotFound { .. } => ErrorKind::NotFound,
            CentrumError::AlreadyCompleted(_) => ErrorKind::AlreadyCompleted,
            CentrumError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            CentrumError::NotOnDuty(_) => ErrorKind::NotOnDuty,
            CentrumError::ModeForbidsAction(_) => ErrorKind::ModeForbidsAction,
            CentrumError::NoJobsSpecified => ErrorKind::NoJobsSpecified,
            CentrumError::BackingStore { .. } => ErrorKind::BackingStoreFailure,
            CentrumError::DuplicateKey(_) => ErrorKind::DuplicateKey,
        }
    }

    pub fn dispatch_not_found(id: u64) -> Self {
        CentrumError::NotFound {
            entity: "dispatch",
            id: id.to_string(),
        }
    }

    pub fn unit_not_found(id: u64) -> Self {
        CentrumError::NotFound {
            entity: "unit",
            id: id.to_string(),
        }
    }

    /// Wrap a storage failure with the operation and entity it happened on.
    pub fn backing(op: impl Into<String>, err: impl std::fmt::Display) -> Self {
        CentrumError::BackingStore {
            op: op.into(),
            message: err.to_string(),
        }
    }
}

impl From<KvError> for CentrumError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::NotFound(key) => CentrumError::NotFound { entity: "record", id: key },
            other => CentrumError::backing("kv", other),
        }
    }
}

impl From<RepositoryError> for CentrumError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => CentrumError::NotFound {
                entity,
                id: id.to_string(),
            },
            RepositoryError::DuplicateKey(key) => CentrumError::DuplicateKey(key),
            RepositoryError::Backend(message) => CentrumError::BackingStore {
                op: "repository".to_string(),
                message,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, CentrumError>;
