//! rems-dispatch — bounded single-task scheduler for admin commands.
//!
//! Launches exactly one execution of a fixed task template with an
//! overridden command, polls it until it reaches a terminal state or the
//! time budget runs out, and reports `{ state, exitCode?, logLocation }`.
//!
//! # Architecture
//!
//! ```text
//! CommandDispatcher::dispatch(request)
//!   ├── TaskRunner::submit(RunTaskSpec)     → SUBMIT_ERROR on failure
//!   ├── TaskExecution: SUBMITTED → RUNNING  (log location resolved)
//!   └── poll loop
//!       ├── PollTracker (interval, backoff on lookup errors)
//!       ├── TaskRunner::describe(id)        → SUCCEEDED | FAILED
//!       └── budget exhausted                → TIMED_OUT (task left running)
//! ```
//!
//! Nothing outlives a `dispatch` call: no queue, no persistence, no resume.

pub mod container;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod poll;
pub mod runner;

pub use container::ContainerCliRunner;
pub use dispatcher::{CommandDispatcher, CommandRequest, DispatchTarget};
pub use error::{DispatchError, DispatchResult, RunnerError};
pub use execution::{DispatchOutcome, ExecutionState, TaskExecution};
pub use poll::{PollPolicy, PollResult, PollTracker};
pub use runner::{ProviderStatus, RunTaskSpec, TaskRunner};
