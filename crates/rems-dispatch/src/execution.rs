//! Execution tracking state and the outcome reported to callers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};

/// Lifecycle of one dispatched execution.
///
/// `SUBMITTED → RUNNING → (SUCCEEDED | FAILED | TIMED_OUT)`, or
/// `SUBMITTED → SUBMIT_ERROR` when the run request is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    SubmitError,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::SubmitError
        )
    }

    /// Whether re-invoking is considered safe. `FAILED` needs judgement: the
    /// command ran and may have partially applied.
    pub fn safe_to_retry(&self) -> bool {
        matches!(self, ExecutionState::SubmitError | ExecutionState::TimedOut)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionState::Submitted => "SUBMITTED",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Succeeded => "SUCCEEDED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::TimedOut => "TIMED_OUT",
            ExecutionState::SubmitError => "SUBMIT_ERROR",
        };
        f.write_str(s)
    }
}

/// Result returned to the caller once a terminal state is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub elapsed_ms: u64,
}

/// The dispatcher's tracking state for one run. Lives only for the duration
/// of a single `dispatch` call.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    state: ExecutionState,
    execution_id: Option<String>,
    exit_code: Option<i32>,
    log_location: Option<String>,
    message: Option<String>,
}

impl Default for TaskExecution {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecution {
    pub fn new() -> Self {
        Self {
            state: ExecutionState::Submitted,
            execution_id: None,
            exit_code: None,
            log_location: None,
            message: None,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id.as_deref()
    }

    pub fn log_location(&self) -> Option<&str> {
        self.log_location.as_deref()
    }

    /// The run request was accepted.
    pub fn mark_running(&mut self, execution_id: &str, log_location: String) -> DispatchResult<()> {
        self.transition(ExecutionState::Submitted, ExecutionState::Running)?;
        self.execution_id = Some(execution_id.to_string());
        self.log_location = Some(log_location);
        Ok(())
    }

    /// The run request was refused; no execution exists.
    pub fn submit_failed(&mut self, message: String) -> DispatchResult<()> {
        self.transition(ExecutionState::Submitted, ExecutionState::SubmitError)?;
        self.message = Some(message);
        Ok(())
    }

    /// The execution stopped. Exit code 0 succeeds; anything else, including
    /// a missing exit code, fails.
    pub fn finish(&mut self, exit_code: Option<i32>, reason: Option<String>) -> DispatchResult<()> {
        let to = match exit_code {
            Some(0) => ExecutionState::Succeeded,
            _ => ExecutionState::Failed,
        };
        self.transition(ExecutionState::Running, to)?;
        self.exit_code = exit_code;
        if to == ExecutionState::Failed {
            self.message = reason;
        }
        Ok(())
    }

    /// The time budget ran out while the execution was still going.
    pub fn time_out(&mut self, budget: Duration) -> DispatchResult<()> {
        self.transition(ExecutionState::Running, ExecutionState::TimedOut)?;
        self.message = Some(format!(
            "execution still running after {}s; it was left running, check its logs",
            budget.as_secs()
        ));
        Ok(())
    }

    /// Force a terminal state after an internal error.
    pub fn abort(&mut self, message: String) {
        self.state = match self.state {
            ExecutionState::Submitted => ExecutionState::SubmitError,
            ExecutionState::Running => ExecutionState::Failed,
            terminal => terminal,
        };
        self.message = Some(message);
    }

    pub fn into_outcome(self, elapsed: Duration) -> DispatchOutcome {
        DispatchOutcome {
            state: self.state,
            execution_id: self.execution_id,
            exit_code: self.exit_code,
            log_location: self.log_location,
            message: self.message,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    fn transition(&mut self, from: ExecutionState, to: ExecutionState) -> DispatchResult<()> {
        if self.state != from {
            return Err(DispatchError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> TaskExecution {
        let mut exec = TaskExecution::new();
        exec.mark_running("task-1", "/logs/task-1".to_string()).unwrap();
        exec
    }

    #[test]
    fn new_execution_is_submitted() {
        let exec = TaskExecution::new();
        assert_eq!(exec.state(), ExecutionState::Submitted);
        assert!(!exec.state().is_terminal());
        assert_eq!(exec.execution_id(), None);
    }

    #[test]
    fn exit_zero_succeeds() {
        let mut exec = running();
        exec.finish(Some(0), None).unwrap();
        let outcome = exec.into_outcome(Duration::from_millis(1500));
        assert_eq!(outcome.state, ExecutionState::Succeeded);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.log_location.as_deref(), Some("/logs/task-1"));
        assert_eq!(outcome.elapsed_ms, 1500);
    }

    #[test]
    fn nonzero_exit_fails_with_code() {
        let mut exec = running();
        exec.finish(Some(1), Some("Essential container exited".into())).unwrap();
        let outcome = exec.into_outcome(Duration::ZERO);
        assert_eq!(outcome.state, ExecutionState::Failed);
        assert_eq!(outcome.exit_code, Some(1));
        assert_eq!(outcome.message.as_deref(), Some("Essential container exited"));
    }

    #[test]
    fn missing_exit_code_fails_without_code() {
        let mut exec = running();
        exec.finish(None, Some("CannotPullContainerError".into())).unwrap();
        let outcome = exec.into_outcome(Duration::ZERO);
        assert_eq!(outcome.state, ExecutionState::Failed);
        assert_eq!(outcome.exit_code, None);
    }

    #[test]
    fn time_out_keeps_log_location_and_no_exit_code() {
        let mut exec = running();
        exec.time_out(Duration::from_secs(840)).unwrap();
        let outcome = exec.into_outcome(Duration::from_secs(840));
        assert_eq!(outcome.state, ExecutionState::TimedOut);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.log_location.is_some());
        assert!(outcome.message.unwrap().contains("840s"));
    }

    #[test]
    fn submit_error_has_no_log_location() {
        let mut exec = TaskExecution::new();
        exec.submit_failed("AccessDenied".into()).unwrap();
        let outcome = exec.into_outcome(Duration::ZERO);
        assert_eq!(outcome.state, ExecutionState::SubmitError);
        assert_eq!(outcome.log_location, None);
        assert_eq!(outcome.execution_id, None);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut exec = TaskExecution::new();
        assert!(matches!(
            exec.finish(Some(0), None),
            Err(DispatchError::IllegalTransition {
                from: ExecutionState::Submitted,
                to: ExecutionState::Succeeded
            })
        ));

        let mut exec = running();
        assert!(exec.mark_running("again", String::new()).is_err());
        exec.finish(Some(0), None).unwrap();
        assert!(exec.time_out(Duration::from_secs(1)).is_err());
    }

    #[test]
    fn abort_forces_terminal_state() {
        let mut exec = TaskExecution::new();
        exec.abort("boom".into());
        assert_eq!(exec.state(), ExecutionState::SubmitError);

        let mut exec = running();
        exec.abort("boom".into());
        assert_eq!(exec.state(), ExecutionState::Failed);
    }

    #[test]
    fn outcome_wire_format() {
        let mut exec = running();
        exec.finish(Some(1), None).unwrap();
        let json = serde_json::to_value(exec.into_outcome(Duration::from_millis(7))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "state": "FAILED",
                "executionId": "task-1",
                "exitCode": 1,
                "logLocation": "/logs/task-1",
                "elapsedMs": 7
            })
        );
    }

    #[test]
    fn retry_safety() {
        assert!(ExecutionState::SubmitError.safe_to_retry());
        assert!(ExecutionState::TimedOut.safe_to_retry());
        assert!(!ExecutionState::Failed.safe_to_retry());
        assert_eq!(ExecutionState::TimedOut.to_string(), "TIMED_OUT");
    }
}
