//! Shared types used across REMS ops crates.

use serde::{Deserialize, Serialize};

/// Longest identifier Postgres accepts without truncation (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Whether `name` is a plain SQL identifier we are willing to splice into DDL.
///
/// Quoting still happens at the point of use; this check keeps role and
/// database names to a boring, predictable shape.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

// ── Network placement ──────────────────────────────────────────────

/// Where a dispatched execution is attached on the network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkPlacement {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
}

impl NetworkPlacement {
    pub fn new(subnets: Vec<String>, security_groups: Vec<String>) -> Self {
        Self {
            subnets,
            security_groups,
        }
    }

    /// A placement must resolve to at least one subnet.
    pub fn has_subnet(&self) -> bool {
        self.subnets.iter().any(|s| !s.trim().is_empty())
    }
}

// ── Log location ───────────────────────────────────────────────────

/// Resolves where an execution's output can be read.
///
/// Follows the awslogs stream layout:
/// `{log_group}/{stream_prefix}/{container_name}/{task_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLocation {
    pub log_group: String,
    pub stream_prefix: String,
    pub container_name: String,
}

impl LogLocation {
    pub fn new(log_group: &str, stream_prefix: &str, container_name: &str) -> Self {
        Self {
            log_group: log_group.to_string(),
            stream_prefix: stream_prefix.to_string(),
            container_name: container_name.to_string(),
        }
    }

    /// Stream name for one execution: `{prefix}/{container}/{task-id}`.
    ///
    /// Execution handles may be full resource names (`.../task/cluster/abc`);
    /// only the final path segment names the stream.
    pub fn stream_name(&self, execution_id: &str) -> String {
        let task_id = execution_id
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(execution_id);
        join_non_empty(&[
            self.stream_prefix.as_str(),
            self.container_name.as_str(),
            task_id,
        ])
    }

    /// Full log reference for one execution: group plus stream.
    pub fn resolve(&self, execution_id: &str) -> String {
        join_non_empty(&[self.log_group.as_str(), &self.stream_name(execution_id)])
    }
}

fn join_non_empty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Split a comma-separated list, trimming items and dropping empties.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
