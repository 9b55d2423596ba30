//! Bootstrap error types.

use thiserror::Error;

pub type AdminResult<T> = Result<T, AdminError>;

pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// Failures reported by the administrative connection, classified by what
/// the bootstrap procedure needs to decide.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("role already exists: {0}")]
    RoleExists(String),

    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    /// A concurrent transaction touched the same catalogue row; retryable.
    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

impl AdminError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdminError::Conflict(_))
    }

    /// Replace any occurrence of `secret` in the error text.
    pub fn redact(self, secret: &str) -> Self {
        if secret.is_empty() {
            return self;
        }
        let scrub = |s: String| s.replace(secret, "********");
        match self {
            AdminError::RoleExists(s) => AdminError::RoleExists(scrub(s)),
            AdminError::DatabaseExists(s) => AdminError::DatabaseExists(scrub(s)),
            AdminError::InsufficientPrivilege(s) => AdminError::InsufficientPrivilege(scrub(s)),
            AdminError::Conflict(s) => AdminError::Conflict(scrub(s)),
            AdminError::Other(s) => AdminError::Other(scrub(s)),
        }
    }
}

/// Errors reading from a secret store.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("invalid secret name: {0:?}")]
    InvalidName(String),

    #[error("failed to read secret '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that end a bootstrap attempt with status `ERROR`.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("request must contain a 'secretName' stating the secret with the database password")]
    MissingSecretName,

    #[error("missing secret string from secret '{0}'")]
    MissingSecret(String),

    #[error("invalid identifier for {field}: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("{step} failed: {source}")]
    Admin {
        step: &'static str,
        #[source]
        source: AdminError,
    },

    #[error("failed to connect to admin database: {0}")]
    Connect(String),
}
