//! Sakura Cloud provider error types

use fleetforge_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SakuraError {
    #[error("usacloud not found. Please install: brew install usacloud")]
    UsacloudNotFound,

    #[error("usacloud command failed: {0}")]
    CommandFailed(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid provider id: {0}")]
    InvalidProviderId(String),

    #[error("Sakura Cloud credential is missing `{0}`")]
    MissingCredential(&'static str),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl From<SakuraError> for CloudError {
    fn from(err: SakuraError) -> Self {
        match err {
            SakuraError::Cloud(e) => e,
            SakuraError::CommandFailed(msg) => CloudError::CommandFailed(msg),
            SakuraError::JsonError(e) => CloudError::Json(e),
            SakuraError::IoError(e) => CloudError::Io(e),
            SakuraError::InvalidPlan(_)
            | SakuraError::InvalidProviderId(_)
            | SakuraError::MissingCredential(_) => CloudError::Validation(err.to_string()),
            other => CloudError::CommandFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SakuraError>;
