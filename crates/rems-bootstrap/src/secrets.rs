//! Secret store seam.
//!
//! The bootstrap procedure only ever reads the current value of a secret;
//! rotation happens out-of-band and is applied by re-running bootstrap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::SecretError;

/// Fetches secret values by identifier at invocation time.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Current value of `secret_name`, or `None` if the store has no value.
    async fn fetch(&self, secret_name: &str) -> Result<Option<String>, SecretError>;
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads secrets from environment variables.
///
/// `RemsDatabaseSecret` with prefix `SECRET_` is read from
/// `SECRET_REMSDATABASESECRET`; non-alphanumerics become `_`.
#[derive(Clone)]
pub struct EnvSecretStore {
    prefix: String,
    lookup: EnvLookup,
}

impl EnvSecretStore {
    pub fn new(prefix: Option<&str>) -> Self {
        Self::with_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Use a custom lookup instead of the process environment.
    pub fn with_lookup<F>(prefix: Option<&str>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            prefix: prefix.unwrap_or_default().to_string(),
            lookup: Arc::new(lookup),
        }
    }

    pub fn var_name(&self, secret_name: &str) -> String {
        let mangled: String = secret_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{mangled}", self.prefix)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch(&self, secret_name: &str) -> Result<Option<String>, SecretError> {
        if secret_name.trim().is_empty() {
            return Err(SecretError::InvalidName(secret_name.to_string()));
        }
        let var = self.var_name(secret_name);
        debug!(%secret_name, %var, "reading secret from environment");
        Ok((self.lookup)(&var).filter(|v| !v.is_empty()))
    }
}

/// Reads secrets from files named after the secret in one directory
/// (mounted-secret layout).
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, secret_name: &str) -> Result<PathBuf, SecretError> {
        let is_plain = !secret_name.is_empty()
            && secret_name != "."
            && secret_name != ".."
            && !secret_name.contains(['/', '\\']);
        if !is_plain {
            return Err(SecretError::InvalidName(secret_name.to_string()));
        }
        Ok(self.dir.join(secret_name))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn fetch(&self, secret_name: &str) -> Result<Option<String>, SecretError> {
        let path = self.path_for(secret_name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let value = content.trim_end_matches(['\r', '\n']).to_string();
                Ok(Some(value).filter(|v| !v.is_empty()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "secret file not found");
                Ok(None)
            }
            Err(e) => Err(SecretError::Io {
                name: secret_name.to_string(),
                source: e,
            }),
        }
    }
}

/// In-process secrets; values can be rotated with [`StaticSecretStore::set`].
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, name: &str, value: &str) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&self, name: &str, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values.insert(name.to_string(), value.to_string());
        }
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn fetch(&self, secret_name: &str) -> Result<Option<String>, SecretError> {
        Ok(self
            .values
            .read()
            .ok()
            .and_then(|values| values.get(secret_name).cloned()))
    }
}
