//! Command dispatcher — one execution per call, tracked to a terminal state.
//!
//! The `CommandDispatcher`:
//! - Submits a single run of the fixed task template with the caller's command
//! - Polls its status until it stops or the time budget runs out
//! - Leaves a timed-out execution running; only reports where its logs are
//! - Returns a `DispatchOutcome` on every path, never an error

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use rems_core::{ConfigResult, DispatchSettings, MAX_DISPATCH_TIMEOUT, NetworkPlacement};

use crate::error::{DispatchError, DispatchResult};
use crate::execution::{DispatchOutcome, TaskExecution};
use crate::poll::{PollPolicy, PollResult, PollTracker};
use crate::runner::{ProviderStatus, RunTaskSpec, TaskRunner};

const STARTED_BY: &str = "rems-dispatch";

/// A request to run one admin command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Overrides the task template's command. Must not be empty.
    pub command: Vec<String>,
    /// Optional tighter time budget for this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl CommandRequest {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            timeout_seconds: None,
        }
    }
}

/// Static execution context, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub cluster: String,
    pub task_definition: String,
    pub container_name: String,
    pub placement: NetworkPlacement,
}

impl DispatchTarget {
    pub fn from_settings(settings: &DispatchSettings) -> ConfigResult<Self> {
        settings.validate()?;
        Ok(Self {
            cluster: settings.cluster.clone().unwrap_or_default(),
            task_definition: settings.task_definition.clone().unwrap_or_default(),
            container_name: settings.container_name.clone(),
            placement: settings.placement(),
        })
    }

    fn validate(&self) -> DispatchResult<()> {
        for (field, value) in [
            ("cluster", &self.cluster),
            ("task_definition", &self.task_definition),
            ("container_name", &self.container_name),
        ] {
            if value.trim().is_empty() {
                return Err(DispatchError::InvalidTarget(format!("{field} is empty")));
            }
        }
        if !self.placement.has_subnet() {
            return Err(DispatchError::InvalidTarget(
                "network placement must name at least one subnet".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs admin commands as single ephemeral executions.
pub struct CommandDispatcher {
    runner: Arc<dyn TaskRunner>,
    target: DispatchTarget,
    policy: PollPolicy,
}

impl CommandDispatcher {
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        target: DispatchTarget,
        policy: PollPolicy,
    ) -> DispatchResult<Self> {
        target.validate()?;
        if policy.interval.is_zero() || policy.budget.is_zero() {
            return Err(DispatchError::InvalidTarget(
                "poll interval and time budget must be non-zero".to_string(),
            ));
        }
        if policy.budget > MAX_DISPATCH_TIMEOUT {
            return Err(DispatchError::InvalidTarget(format!(
                "time budget {}s exceeds the {}s limit",
                policy.budget.as_secs(),
                MAX_DISPATCH_TIMEOUT.as_secs()
            )));
        }
        Ok(Self {
            runner,
            target,
            policy,
        })
    }

    pub fn target(&self) -> &DispatchTarget {
        &self.target
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Run one command to a terminal state within the time budget.
    pub async fn dispatch(&self, request: &CommandRequest) -> DispatchOutcome {
        let started = Instant::now();
        let policy = match request.timeout_seconds {
            Some(secs) if secs > 0 => self.policy.with_budget(Duration::from_secs(secs)),
            _ => self.policy,
        };

        let mut execution = TaskExecution::new();
        if let Err(e) = self.drive(request, &policy, started, &mut execution).await {
            error!(error = %e, "dispatch aborted");
            execution.abort(e.to_string());
        }

        let outcome = execution.into_outcome(started.elapsed());
        info!(
            state = %outcome.state,
            execution_id = outcome.execution_id.as_deref().unwrap_or("-"),
            exit_code = ?outcome.exit_code,
            elapsed_ms = outcome.elapsed_ms,
            "dispatch finished"
        );
        outcome
    }

    async fn drive(
        &self,
        request: &CommandRequest,
        policy: &PollPolicy,
        started: Instant,
        execution: &mut TaskExecution,
    ) -> DispatchResult<()> {
        if request.command.is_empty() {
            return execution.submit_failed("command must not be empty".to_string());
        }
        // Checked before submitting so nothing is left orphaned.
        let Some(deadline) = started.checked_add(policy.budget) else {
            return execution.submit_failed(format!(
                "time budget {}s is out of range",
                policy.budget.as_secs()
            ));
        };

        let spec = RunTaskSpec {
            cluster: self.target.cluster.clone(),
            task_definition: self.target.task_definition.clone(),
            container_name: self.target.container_name.clone(),
            command: request.command.clone(),
            placement: self.target.placement.clone(),
            started_by: STARTED_BY.to_string(),
        };

        // Submission is not retried: refusals here are not transient.
        let execution_id = match self.runner.submit(&spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!(cluster = %spec.cluster, error = %e, "task submission failed");
                return execution.submit_failed(e.to_string());
            }
        };

        let log_location = self.runner.log_location(&execution_id);
        info!(%execution_id, %log_location, command = ?spec.command, "task submitted");
        execution.mark_running(&execution_id, log_location)?;

        self.poll_until_terminal(&execution_id, policy, deadline, execution)
            .await
    }

    async fn poll_until_terminal(
        &self,
        execution_id: &str,
        policy: &PollPolicy,
        deadline: Instant,
        execution: &mut TaskExecution,
    ) -> DispatchResult<()> {
        let mut tracker = PollTracker::new(policy);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(tracker.next_interval().min(remaining)).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.runner.describe(execution_id)).await {
                Ok(Ok(ProviderStatus::Stopped { exit_code, reason })) => {
                    debug!(%execution_id, ?exit_code, ?reason, "execution stopped");
                    return execution.finish(exit_code, reason);
                }
                Ok(Ok(status)) => {
                    tracker.record(PollResult::Observed);
                    debug!(%execution_id, ?status, polls = tracker.polls(), "execution not finished");
                }
                Ok(Err(e)) => {
                    let next = tracker.record(PollResult::LookupFailed);
                    debug!(%execution_id, error = %e, ?next, "status lookup failed, retrying");
                }
                Err(_) => {
                    tracker.record(PollResult::LookupFailed);
                    debug!(%execution_id, "status lookup outlived the time budget");
                }
            }
        }

        warn!(
            %execution_id,
            budget_secs = policy.budget.as_secs(),
            "time budget exhausted; execution left running"
        );
        execution.time_out(policy.budget)
    }
}
