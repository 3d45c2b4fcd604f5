//! Error Taxonomy
//!
//! Every fallible operation in the control plane returns [`OpsResult`].
//! Collaborator adapters translate their own failures into one of these
//! variants at the trait boundary so the orchestrators can decide between
//! retrying, rejecting up front, and failing the owning entity.

use thiserror::Error;

use crate::model::FailureContext;

#[derive(Debug, Error)]
pub enum OpsError {
    /// Reasoning-service timeout, metrics endpoint unreachable, executor hiccup.
    #[error("transient failure in {service}: {message}")]
    Transient { service: String, message: String },

    /// Malformed collaborator output. Never silently applied.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Rejected before any work began.
    #[error("resource limit reached: {0}")]
    ResourceLimit(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("terminal failure in phase {}: {}", .0.phase, .0.error)]
    Terminal(FailureContext),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("repository error: {0}")]
    Repository(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type OpsResult<T> = Result<T, OpsError>;

impl OpsError {
    pub fn transient(service: impl Into<String>, message: impl ToString) -> Self {
        OpsError::Transient {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        OpsError::NotFound { kind, id: id.into() }
    }

    /// Only transient failures are eligible for a phase-scoped retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, OpsError::Transient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OpsError::Cancelled)
    }
}

impl From<rusqlite::Error> for OpsError {
    fn from(e: rusqlite::Error) -> Self {
        OpsError::Repository(e.to_string())
    }
}

impl From<tokio::task::JoinError> for OpsError {
    fn from(e: tokio::task::JoinError) -> Self {
        OpsError::Repository(format!("blocking task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(OpsError::transient("reasoning", "timeout").is_transient());
        assert!(!OpsError::Validation("blank file".into()).is_transient());
        assert!(!OpsError::ResourceLimit("too many".into()).is_transient());
        assert!(!OpsError::Cancelled.is_transient());
    }

    #[test]
    fn test_messages_carry_context() {
        let e = OpsError::not_found("incident", "abc");
        assert_eq!(e.to_string(), "incident not found: abc");

        let e = OpsError::InvalidTransition {
            entity: "evolution",
            from: "applied".into(),
            to: "pending".into(),
        };
        assert!(e.to_string().contains("applied -> pending"));
    }
}
