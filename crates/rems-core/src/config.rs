//! rems.toml configuration parser.
//!
//! The file provides defaults; the environment values injected by the
//! deployment (`DATABASE_URL`, `CLUSTER_ARN`, `SUBNETS`, ...) take precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult};
use crate::types::{LogLocation, NetworkPlacement, is_valid_identifier, split_list};

/// Upper bound for `dispatch.timeout`: the dispatcher runs inside a host
/// invocation limited to 15 minutes.
pub const MAX_DISPATCH_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemsConfig {
    pub bootstrap: BootstrapSettings,
    pub dispatch: DispatchSettings,
    pub server: ServerSettings,
}

/// How the bootstrap procedure gets a database owned by the service role.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OwnershipMode {
    /// Temporarily grant the service role to the admin role around
    /// `CREATE DATABASE ... OWNER`. Needed on managed engines whose admin
    /// account is not a real superuser.
    #[default]
    GrantMembership,
    /// Plain `CREATE DATABASE ... OWNER`.
    Direct,
}

/// Where role secrets are read from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SecretSource {
    #[default]
    Env,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    /// Connection string for the administrative account.
    pub database_url: Option<String>,
    pub role_name: String,
    pub database_name: String,
    pub ownership: OwnershipMode,
    /// Admin role to grant membership to; `CURRENT_USER` when unset.
    pub admin_role: Option<String>,
    pub secret_source: SecretSource,
    pub secret_dir: Option<PathBuf>,
    pub secret_env_prefix: Option<String>,
    pub connect_timeout: String,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            role_name: "rems".to_string(),
            database_name: "rems".to_string(),
            ownership: OwnershipMode::default(),
            admin_role: None,
            secret_source: SecretSource::default(),
            secret_dir: None,
            secret_env_prefix: None,
            connect_timeout: "10s".to_string(),
        }
    }
}

impl BootstrapSettings {
    /// Check that every mandatory setting is present and well-formed.
    pub fn validate(&self) -> ConfigResult<()> {
        match self.database_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {}
            _ => return Err(ConfigError::Missing("bootstrap.database_url")),
        }
        check_identifier("bootstrap.role_name", &self.role_name)?;
        check_identifier("bootstrap.database_name", &self.database_name)?;
        if let Some(admin) = &self.admin_role {
            check_identifier("bootstrap.admin_role", admin)?;
        }
        if self.secret_source == SecretSource::File && self.secret_dir.is_none() {
            return Err(ConfigError::Missing("bootstrap.secret_dir"));
        }
        self.connect_timeout()?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> ConfigResult<Duration> {
        duration_field("bootstrap.connect_timeout", &self.connect_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub cluster: Option<String>,
    pub task_definition: Option<String>,
    pub container_name: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub log_group: Option<String>,
    pub log_stream_prefix: String,
    /// Overall time budget for one dispatch.
    pub timeout: String,
    pub poll_interval: String,
    pub max_poll_interval: String,
    /// Container runtime CLI used by the local runner.
    pub runtime_binary: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            cluster: None,
            task_definition: None,
            container_name: "rems".to_string(),
            subnets: Vec::new(),
            security_groups: Vec::new(),
            log_group: None,
            log_stream_prefix: "rems".to_string(),
            timeout: "14m".to_string(),
            poll_interval: "5s".to_string(),
            max_poll_interval: "30s".to_string(),
            runtime_binary: "docker".to_string(),
        }
    }
}

impl DispatchSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        non_blank("dispatch.cluster", self.cluster.as_deref())?;
        non_blank("dispatch.task_definition", self.task_definition.as_deref())?;
        non_blank("dispatch.container_name", Some(self.container_name.as_str()))?;
        if !self.placement().has_subnet() {
            return Err(ConfigError::Invalid {
                field: "dispatch.subnets",
                reason: "network placement must name at least one subnet".to_string(),
            });
        }

        let poll = self.poll_interval()?;
        let max_poll = self.max_poll_interval()?;
        let timeout = self.timeout()?;
        if poll.is_zero() {
            return Err(ConfigError::Invalid {
                field: "dispatch.poll_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if max_poll < poll {
            return Err(ConfigError::Invalid {
                field: "dispatch.max_poll_interval",
                reason: format!("{max_poll:?} is shorter than poll_interval {poll:?}"),
            });
        }
        if timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "dispatch.timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if timeout > MAX_DISPATCH_TIMEOUT {
            return Err(ConfigError::Invalid {
                field: "dispatch.timeout",
                reason: format!(
                    "{}s exceeds the {}s limit",
                    timeout.as_secs(),
                    MAX_DISPATCH_TIMEOUT.as_secs()
                ),
            });
        }
        Ok(())
    }

    pub fn placement(&self) -> NetworkPlacement {
        NetworkPlacement::new(self.subnets.clone(), self.security_groups.clone())
    }

    /// Awslogs layout for task output, only when a log group is configured.
    pub fn log_location(&self) -> Option<LogLocation> {
        self.log_group
            .as_deref()
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .map(|group| LogLocation::new(group, &self.log_stream_prefix, &self.container_name))
    }

    pub fn timeout(&self) -> ConfigResult<Duration> {
        duration_field("dispatch.timeout", &self.timeout)
    }

    pub fn poll_interval(&self) -> ConfigResult<Duration> {
        duration_field("dispatch.poll_interval", &self.poll_interval)
    }

    pub fn max_poll_interval(&self) -> ConfigResult<Duration> {
        duration_field("dispatch.max_poll_interval", &self.max_poll_interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

impl RemsConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Overlay values injected by the deployment.
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`. Blank values are
    /// ignored so an empty variable never clears a file setting.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("DATABASE_URL") {
            self.bootstrap.database_url = Some(url);
        }
        if let Some(cluster) = get("CLUSTER_ARN") {
            self.dispatch.cluster = Some(cluster);
        }
        if let Some(task_def) = get("TASK_DEFINITION_ARN") {
            self.dispatch.task_definition = Some(task_def);
        }
        if let Some(container) = get("CONTAINER_NAME") {
            self.dispatch.container_name = container;
        }
        if let Some(subnets) = get("SUBNETS") {
            self.dispatch.subnets = split_list(&subnets);
        }
        if let Some(groups) = get("SECURITY_GROUPS") {
            self.dispatch.security_groups = split_list(&groups);
        }
        if let Some(log_group) = get("CLUSTER_LOG_GROUP_NAME") {
            self.dispatch.log_group = Some(log_group);
        }
    }
}

fn duration_field(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::Invalid {
        field,
        reason: format!("not a duration: {value:?}"),
    })
}

fn non_blank(field: &'static str, value: Option<&str>) -> ConfigResult<()> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(ConfigError::Missing(field)),
    }
}

fn check_identifier(field: &'static str, value: &str) -> ConfigResult<()> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{value:?} is not a plain SQL identifier"),
        })
    }
}
