//! Task runner backed by a local container runtime CLI.
//!
//! Mirrors the deployed run-task flow closely enough for local work: the task
//! definition is the image, the cluster and security groups become labels, and
//! each subnet is a container network.
//!
//! Output stays with the runtime (`docker logs <name>`) unless an awslogs
//! location is configured, in which case the container ships it there.

use std::process::Output;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use rems_core::LogLocation;

use crate::error::RunnerError;
use crate::runner::{ProviderStatus, RunTaskSpec, TaskRunner};

const INSPECT_FORMAT: &str = "{{.State.Status}}|{{.State.ExitCode}}|{{.State.Error}}";

/// Drives `docker` (or a compatible CLI such as `podman`).
#[derive(Debug, Clone)]
pub struct ContainerCliRunner {
    binary: String,
    awslogs: Option<LogLocation>,
}

impl ContainerCliRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            awslogs: None,
        }
    }

    /// Ship container output to the given awslogs group and stream layout.
    pub fn with_awslogs(mut self, location: LogLocation) -> Self {
        self.awslogs = Some(location);
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn exec(&self, args: &[String]) -> Result<Output, RunnerError> {
        debug!(binary = %self.binary, ?args, "running container cli");
        // Status lookups are cancelled by the dispatcher's timeout; the child
        // must not outlive them.
        Ok(Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?)
    }

    async fn remove(&self, id: &str) {
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];
        match self.exec(&args).await {
            Ok(out) if out.status.success() => {}
            Ok(out) => warn!(container = %id, stderr = %stderr(&out), "cleanup failed"),
            Err(e) => warn!(container = %id, error = %e, "cleanup failed"),
        }
    }
}

impl Default for ContainerCliRunner {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Unique container name for one run: `{container}-{nanos}{seq}` in hex.
pub fn container_name(spec: &RunTaskSpec) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let base: String = spec
        .container_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let base = base.trim_start_matches(['-', '.', '_']);
    let base = if base.is_empty() { "rems" } else { base };
    format!("{base}-{nanos:x}{seq:04x}")
}

/// Arguments for `create`; the first subnet is the primary network.
pub fn create_args(spec: &RunTaskSpec, name: &str, awslogs: Option<&LogLocation>) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    let labels = [
        ("rems.cluster", spec.cluster.clone()),
        ("rems.task-definition", spec.task_definition.clone()),
        ("rems.container", spec.container_name.clone()),
        (
            "rems.security-groups",
            spec.placement.security_groups.join(","),
        ),
        ("rems.started-by", spec.started_by.clone()),
    ];
    for (key, value) in labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    if let Some(location) = awslogs {
        args.push("--log-driver".to_string());
        args.push("awslogs".to_string());
        args.push("--log-opt".to_string());
        args.push(format!("awslogs-group={}", location.log_group));
        args.push("--log-opt".to_string());
        args.push(format!("awslogs-stream={}", location.stream_name(name)));
    }
    if let Some(primary) = spec.placement.subnets.first() {
        args.push("--network".to_string());
        args.push(primary.clone());
    }
    args.push(spec.task_definition.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Parse the `inspect --format` line into a provider status.
pub fn parse_inspect(line: &str) -> Result<ProviderStatus, RunnerError> {
    let mut parts = line.trim().splitn(3, '|');
    let status = parts.next().unwrap_or_default();
    let exit_code = parts.next().unwrap_or_default();
    let error = parts.next().unwrap_or_default().trim();

    match status {
        "created" => Ok(ProviderStatus::Pending),
        "running" | "restarting" | "paused" => Ok(ProviderStatus::Running),
        "exited" | "dead" => Ok(ProviderStatus::Stopped {
            exit_code: exit_code.trim().parse().ok(),
            reason: (!error.is_empty()).then(|| error.to_string()),
        }),
        other => Err(RunnerError::Lookup(format!(
            "unrecognised container status '{other}'"
        ))),
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl TaskRunner for ContainerCliRunner {
    async fn submit(&self, spec: &RunTaskSpec) -> Result<String, RunnerError> {
        let id = container_name(spec);
        let created = self
            .exec(&create_args(spec, &id, self.awslogs.as_ref()))
            .await?;
        if !created.status.success() {
            return Err(RunnerError::Rejected(stderr(&created)));
        }

        let mut steps: Vec<Vec<String>> = spec
            .placement
            .subnets
            .iter()
            .skip(1)
            .map(|net| {
                vec![
                    "network".to_string(),
                    "connect".to_string(),
                    net.clone(),
                    id.clone(),
                ]
            })
            .collect();
        steps.push(vec!["start".to_string(), id.clone()]);

        for args in steps {
            let out = match self.exec(&args).await {
                Ok(out) => out,
                Err(e) => {
                    self.remove(&id).await;
                    return Err(e);
                }
            };
            if !out.status.success() {
                let detail = stderr(&out);
                self.remove(&id).await;
                return Err(RunnerError::Rejected(detail));
            }
        }
        Ok(id)
    }

    async fn describe(&self, execution_id: &str) -> Result<ProviderStatus, RunnerError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            INSPECT_FORMAT.to_string(),
            execution_id.to_string(),
        ];
        let out = self
            .exec(&args)
            .await
            .map_err(|e| RunnerError::Lookup(e.to_string()))?;
        if !out.status.success() {
            return Err(RunnerError::Lookup(stderr(&out)));
        }
        parse_inspect(&String::from_utf8_lossy(&out.stdout))
    }

    fn log_location(&self, execution_id: &str) -> String {
        match &self.awslogs {
            Some(location) => location.resolve(execution_id),
            None => format!("{} logs {execution_id}", self.binary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rems_core::NetworkPlacement;

    fn spec() -> RunTaskSpec {
        RunTaskSpec {
            cluster: "rems-cluster".into(),
            task_definition: "rems:latest".into(),
            container_name: "rems".into(),
            command: vec!["bin/rems".into(), "migrate".into()],
            placement: NetworkPlacement::new(
                vec!["net-a".into(), "net-b".into()],
                vec!["sg-1".into(), "sg-2".into()],
            ),
            started_by: "rems-dispatch".into(),
        }
    }

    #[test]
    fn create_args_layout() {
        let args = create_args(&spec(), "rems-1", None);
        assert_eq!(args[..3], ["create", "--name", "rems-1"]);
        assert!(!args.contains(&"--log-driver".to_string()));
        assert!(args.contains(&"rems.cluster=rems-cluster".to_string()));
        assert!(args.contains(&"rems.security-groups=sg-1,sg-2".to_string()));
        let net = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[net + 1], "net-a");
        assert!(!args.contains(&"net-b".to_string()));
        assert_eq!(&args[args.len() - 3..], ["rems:latest", "bin/rems", "migrate"]);
    }

    #[test]
    fn create_args_ship_logs_to_awslogs() {
        let location = LogLocation::new("/ecs/rems", "rems", "rems");
        let args = create_args(&spec(), "rems-1", Some(&location));
        let driver = args.iter().position(|a| a == "--log-driver").unwrap();
        assert_eq!(args[driver + 1], "awslogs");
        assert!(args.contains(&"awslogs-group=/ecs/rems".to_string()));
        assert!(args.contains(&"awslogs-stream=rems/rems/rems-1".to_string()));
    }

    #[test]
    fn container_names_are_unique_and_safe() {
        let mut s = spec();
        s.container_name = "rems app".into();
        let a = container_name(&s);
        let b = container_name(&s);
        assert_ne!(a, b);
        assert!(a.starts_with("rems-app-"));
        assert!(!a.contains(' '));
    }

    #[test]
    fn log_location_follows_where_output_goes() {
        let local = ContainerCliRunner::new("podman");
        assert_eq!(local.log_location("rems-1"), "podman logs rems-1");

        let shipped = ContainerCliRunner::new("docker")
            .with_awslogs(LogLocation::new("/ecs/rems", "rems", "rems"));
        assert_eq!(shipped.log_location("rems-1"), "/ecs/rems/rems/rems/rems-1");
    }

    #[test]
    fn inspect_pending_and_running() {
        assert_eq!(parse_inspect("created|0|").unwrap(), ProviderStatus::Pending);
        assert_eq!(parse_inspect("running|0|\n").unwrap(), ProviderStatus::Running);
        assert_eq!(parse_inspect("restarting|0|").unwrap(), ProviderStatus::Running);
    }

    #[test]
    fn inspect_exited() {
        assert_eq!(
            parse_inspect("exited|3|").unwrap(),
            ProviderStatus::Stopped {
                exit_code: Some(3),
                reason: None
            }
        );
        assert_eq!(
            parse_inspect("dead||oom killed").unwrap(),
            ProviderStatus::Stopped {
                exit_code: None,
                reason: Some("oom killed".into())
            }
        );
    }

    #[test]
    fn inspect_unknown_status_is_lookup_error() {
        assert!(matches!(parse_inspect("weird|0|"), Err(RunnerError::Lookup(_))));
        assert!(matches!(parse_inspect(""), Err(RunnerError::Lookup(_))));
    }

    #[tokio::test]
    async fn missing_binary_surfaces_io_error() {
        let runner = ContainerCliRunner::new("/nonexistent/rems-container-cli");
        assert!(matches!(runner.submit(&spec()).await, Err(RunnerError::Io(_))));
        assert!(matches!(
            runner.describe("abc").await,
            Err(RunnerError::Lookup(_))
        ));
    }

    #[cfg(unix)]
    fn fake_runtime(dir: &std::path::Path, inspect: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        let script = format!(
            "#!/bin/sh\n\
             echo \"$@\" >> \"{log}\"\n\
             case \"$1\" in\n\
               create) echo c0ffee1234 ;;\n\
               inspect) {inspect} ;;\n\
             esac\n",
            log = dir.join("calls").display(),
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dispatch_through_cli_reports_runtime_logs() {
        use crate::dispatcher::{CommandDispatcher, CommandRequest, DispatchTarget};
        use crate::execution::ExecutionState;
        use crate::poll::PollPolicy;
        use std::sync::Arc;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let binary = fake_runtime(dir.path(), "echo 'exited|0|'");
        let target = DispatchTarget {
            cluster: "arn:aws:ecs:ap-southeast-2:1:cluster/rems".into(),
            task_definition: "rems:latest".into(),
            container_name: "rems".into(),
            placement: NetworkPlacement::new(vec!["net-a".into()], vec![]),
        };
        let policy = PollPolicy {
            interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(20),
            budget: Duration::from_secs(10),
        };
        let dispatcher = CommandDispatcher::new(
            Arc::new(ContainerCliRunner::new(binary.clone())),
            target,
            policy,
        )
        .unwrap();

        let outcome = dispatcher.dispatch(&CommandRequest::new(["migrate"])).await;
        assert_eq!(outcome.state, ExecutionState::Succeeded);
        let name = outcome.execution_id.unwrap();
        assert!(name.starts_with("rems-"));
        let log_location = outcome.log_location.unwrap();
        assert_eq!(log_location, format!("{binary} logs {name}"));
        assert!(!log_location.contains("arn:"));

        let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
        assert!(calls.contains(&format!("--name {name}")));
        assert!(calls.contains(&format!("start {name}")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_lookup_kills_the_cli() {
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let binary = fake_runtime(
            dir.path(),
            &format!("sleep 1; touch \"{}\"", marker.display()),
        );
        let runner = ContainerCliRunner::new(binary);

        let lookup = tokio::time::timeout(Duration::from_millis(100), runner.describe("rems-1"));
        assert!(lookup.await.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
