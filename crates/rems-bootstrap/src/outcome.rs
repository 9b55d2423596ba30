//! Request and result types for one bootstrap invocation.

use serde::{Deserialize, Serialize};

/// Which of the three end states an invocation reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapStatus {
    #[serde(rename = "OK DB CREATED")]
    DbCreated,
    #[serde(rename = "OK DB ALREADY EXISTS")]
    DbAlreadyExists,
    #[serde(rename = "ERROR")]
    Error,
}

impl BootstrapStatus {
    pub fn is_ok(&self) -> bool {
        !matches!(self, BootstrapStatus::Error)
    }
}

/// Structured result of a bootstrap attempt; `message` is set only on `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapOutcome {
    pub status: BootstrapStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BootstrapOutcome {
    pub fn created() -> Self {
        Self {
            status: BootstrapStatus::DbCreated,
            message: None,
        }
    }

    pub fn already_exists() -> Self {
        Self {
            status: BootstrapStatus::DbAlreadyExists,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: BootstrapStatus::Error,
            message: Some(message.into()),
        }
    }
}

/// Invocation payload: `{ "secretName": "..." }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    #[serde(default)]
    pub secret_name: Option<String>,
}

impl BootstrapRequest {
    pub fn new(secret_name: &str) -> Self {
        Self {
            secret_name: Some(secret_name.to_string()),
        }
    }
}

/// The service role's login identity.
///
/// Built from the secret at invocation time and dropped with the invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct RoleCredential {
    pub username: String,
    pub password: String,
}

impl RoleCredential {
    /// Build a credential from a raw secret value.
    ///
    /// Managed database secrets are JSON documents with a `password` field;
    /// anything else is taken verbatim as the password.
    pub fn from_secret(username: &str, secret: &str) -> Self {
        let password = serde_json::from_str::<serde_json::Value>(secret)
            .ok()
            .and_then(|v| v.get("password")?.as_str().map(str::to_string))
            .unwrap_or_else(|| secret.to_string());

        Self {
            username: username.to_string(),
            password,
        }
    }
}

impl std::fmt::Debug for RoleCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleCredential")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}
