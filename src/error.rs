use crate::acme::AcmeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PkiError>;

#[derive(Error, Debug)]
pub enum PkiError {
    /// Caller-visible failure; reported as a 4xx with the message as body.
    #[error("{0}")]
    User(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    NotFound(String),

    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PkiError {
    pub fn user(msg: impl Into<String>) -> Self {
        PkiError::User(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        PkiError::Internal(msg.into())
    }

    pub fn is_user_error(&self) -> bool {
        match self {
            PkiError::User(_) | PkiError::NotFound(_) => true,
            PkiError::Acme(e) => e.status_code() < 500,
            _ => false,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            PkiError::User(_) => 400,
            PkiError::NotFound(_) => 404,
            PkiError::Acme(e) => e.status_code(),
            _ => 500,
        }
    }

    /// Prefixes the message while keeping the user/internal classification.
    pub fn context(self, prefix: &str) -> Self {
        match self {
            PkiError::User(msg) => PkiError::User(format!("{prefix}: {msg}")),
            PkiError::NotFound(msg) => PkiError::NotFound(format!("{prefix}: {msg}")),
            PkiError::Acme(e) => PkiError::Acme(e),
            other => PkiError::Internal(format!("{prefix}: {other}")),
        }
    }
}

impl From<config::ConfigError> for PkiError {
    fn from(e: config::ConfigError) -> Self {
        PkiError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::AcmeErrorType;

    #[test]
    fn test_classification() {
        assert!(PkiError::user("bad ttl").is_user_error());
        assert_eq!(PkiError::user("bad ttl").status_code(), 400);
        assert_eq!(PkiError::NotFound("role".into()).status_code(), 404);
        assert!(!PkiError::internal("disk").is_user_error());
        assert_eq!(PkiError::Storage("disk".into()).status_code(), 500);

        let acme = PkiError::from(AcmeError::new(AcmeErrorType::RateLimited, "slow down"));
        assert_eq!(acme.status_code(), 429);
        assert!(acme.is_user_error());
    }

    #[test]
    fn test_context_keeps_kind() {
        let e = PkiError::user("no such role").context("issue failed");
        assert!(e.is_user_error());
        assert_eq!(e.to_string(), "issue failed: no such role");

        let e = PkiError::Storage("eio".into()).context("reading ca");
        assert!(!e.is_user_error());
    }
}
