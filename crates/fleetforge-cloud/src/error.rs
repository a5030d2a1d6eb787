//! Engine error types

use fleetforge_core::CoreError;
use thiserror::Error;

/// Errors raised while reconciling a cluster
#[derive(Error, Debug)]
pub enum CloudError {
    /// Store, validation and phase errors from the core crate
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("Cluster `{0}` is in unknown phase")]
    UnknownPhase(String),

    #[error("Cluster `{0}` is upgrading. Retry after Cluster returns to Ready state")]
    Upgrading(String),

    #[error("Kubernetes API error: {0}")]
    Kube(String),

    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Ambiguous cluster layout; needs an operator, never retried
    #[error("{0}")]
    Topology(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("failed to drain {} node(s): {}", .failed.len(), summarize(.failed))]
    PartialDrain {
        removed: Vec<String>,
        failed: Vec<(String, String)>,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<CloudError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn summarize(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(node, reason)| format!("{node}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl CloudError {
    fn root(&self) -> &CloudError {
        match self {
            CloudError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Already-exists or object-modified store error, surfaced for the caller to retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), CloudError::Core(e) if e.is_conflict())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), CloudError::Core(e) if e.is_not_found())
    }
}

/// Wraps errors with the operation that produced them
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<CloudError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| CloudError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| CloudError::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_survives_context() {
        let err: Result<()> = Err(CoreError::ObjectModified {
            kind: "cluster",
            name: "demo".to_string(),
        }
        .into());
        let wrapped = err.context("failed to update cluster demo").unwrap_err();

        assert!(wrapped.is_conflict());
        assert!(!wrapped.is_not_found());
        assert!(wrapped.to_string().starts_with("failed to update cluster demo: "));
    }

    #[test]
    fn test_partial_drain_message() {
        let err = CloudError::PartialDrain {
            removed: vec!["a".to_string()],
            failed: vec![("b".to_string(), "evict timed out".to_string())],
        };
        assert_eq!(err.to_string(), "failed to drain 1 node(s): b: evict timed out");
    }
}
