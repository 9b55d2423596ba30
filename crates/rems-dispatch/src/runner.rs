//! Execution environment seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rems_core::NetworkPlacement;

use crate::error::RunnerError;

/// Everything the execution environment needs to launch one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTaskSpec {
    pub cluster: String,
    pub task_definition: String,
    pub container_name: String,
    /// Replaces the task template's command.
    pub command: Vec<String>,
    pub placement: NetworkPlacement,
    /// Free-form tag identifying who launched the run.
    pub started_by: String,
}

/// Provider-side status of an execution as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    /// Accepted but not yet running (provisioning, pulling, ...).
    Pending,
    Running,
    /// Reached the provider's terminal state.
    Stopped {
        exit_code: Option<i32>,
        reason: Option<String>,
    },
}

/// Launches executions and reports their status.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Launch one execution and return its opaque handle.
    async fn submit(&self, spec: &RunTaskSpec) -> Result<String, RunnerError>;

    /// Look up the current status of a previously submitted execution.
    async fn describe(&self, execution_id: &str) -> Result<ProviderStatus, RunnerError>;

    /// Where the output of a submitted execution can be read.
    fn log_location(&self, execution_id: &str) -> String;
}
