use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error(
        "the object has been modified; please apply your changes to the latest version of {kind} `{name}` and try again"
    )]
    ObjectModified { kind: &'static str, name: String },

    #[error("invalid Kubernetes version `{0}`")]
    InvalidVersion(String),

    #[error("cluster phase cannot change from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }

    /// Already-exists and object-modified both mean another writer got there first.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoreError::AlreadyExists { .. } | CoreError::ObjectModified { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
