//! Core data model: tasks, servers, projects, records, and console messages.
//!
//! These types mirror the shapes persisted by the [`crate::store`] and consumed
//! by [`crate::task`] and [`crate::engine`]. Field names match the external
//! contract documented for the record and console-message schemas.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a release's source is pinned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Checkout an exact tag.
    Tag(String),
    /// Checkout a specific commit on a branch.
    Branch { branch: String, commit: String },
}

/// Source control system backing a [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoKind {
    Git,
    Svn,
}

/// Whether `Project::excludes` names files to keep or files to skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// `excludes` lists exact filenames to include in the archive.
    Include,
    /// `excludes` lists regular expressions of paths to skip (default).
    #[default]
    Exclude,
}

/// The five shell-hook slots a project can configure.
///
/// Each field is a text blob; see [`crate::task::parse_hook_lines`] for the
/// comment/blank-line skipping rules applied when a hook runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectHooks {
    #[serde(default)]
    pub prev_deploy: String,
    #[serde(default)]
    pub post_deploy: String,
    #[serde(default)]
    pub prev_release: String,
    #[serde(default)]
    pub post_release: String,
    #[serde(default)]
    pub task_vars: String,
}

/// A project: immutable for the duration of a task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub repo_kind: RepoKind,
    pub repo_url: String,
    /// The activation symlink path on each target server.
    pub target_root: String,
    /// Directory on each target server that holds versioned release dirs.
    pub target_releases: String,
    /// Number of past releases to retain under `target_releases`.
    #[serde(default = "default_keep_version")]
    pub keep_version: u32,
    #[serde(default)]
    pub filter_mode: FilterMode,
    #[serde(default)]
    pub excludes: String,
    #[serde(default)]
    pub hooks: ProjectHooks,
    /// Whether starting a task against this project requires a prior audit.
    #[serde(default)]
    pub task_audit: bool,
    #[serde(default)]
    pub enabled: bool,
}

fn default_keep_version() -> u32 {
    5
}

/// A deployment target. Pool identity is `(user, password, host, port)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub user: String,
    /// Empty string means key-based auth only.
    #[serde(default)]
    pub password: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

impl Server {
    /// Stable key identifying this server's slot in the [`crate::sshpool::ExecutorPool`].
    pub fn pool_key(&self) -> String {
        format!("{}:{}@{}:{}", self.user, self.password, self.host, self.port)
    }
}

/// A deployment environment (e.g. staging, production). Only its `enabled`
/// flag and identity participate in task validation (§4.5 `check()`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Stable integer task-status lattice. See spec §4.5: no back-transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum TaskStatus {
    Waiting = 0,
    Audit = 1,
    Reject = 2,
    Release = 3,
    Finish = 4,
    ReleaseFail = 5,
    ReleasePartFail = 6,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Reject
                | TaskStatus::Finish
                | TaskStatus::ReleaseFail
                | TaskStatus::ReleasePartFail
        )
    }
}

/// The release unit submitted to the [`crate::engine::Engine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskModel {
    pub id: i64,
    pub space_id: i64,
    pub project_id: i64,
    pub environment_id: i64,
    pub name: String,
    pub selector: Selector,
    /// Non-empty set of target server ids.
    pub servers: Vec<i64>,
    pub status: TaskStatus,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub prev_version: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Exit-status classification for [`crate::record::CommandRecord`].
///
/// Preserves the three-way classification from spec §4.2 uniformly for local
/// and remote execution; 254 is reserved for [`crate::record::CommandRecord::save`]
/// completions that never ran a shell command.
pub const STATUS_OK: i32 = 0;
pub const STATUS_TRANSPORT_OR_PACKAGING: i32 = 254;
pub const STATUS_UNKNOWN: i32 = 255;
pub const STATUS_PENDING: i32 = -1;

/// One executed command: captures cmd, env, server, status, runtime, output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub task_id: i64,
    pub user_id: i64,
    /// 0 = local.
    pub server_id: i64,
    pub command: String,
    pub envs: Vec<String>,
    pub status: i32,
    pub output: String,
    pub run_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Per-(task, server) outcome, upserted at task completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskServerStatus {
    Pending,
    Success,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskServer {
    pub task_id: i64,
    pub server_id: i64,
    pub status: TaskServerStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Running/terminal status carried on every [`ConsoleMsg`]. Serializes as a
/// bare integer (spec §6 Console protocol: `"status": int`), not the default
/// string tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
#[serde(into = "i32", try_from = "i32")]
pub enum StepStatus {
    Running = 0,
    Success = 1,
    Failed = 2,
}

impl From<StepStatus> for i32 {
    fn from(status: StepStatus) -> Self {
        status as i32
    }
}

impl TryFrom<i32> for StepStatus {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StepStatus::Running),
            1 => Ok(StepStatus::Success),
            2 => Ok(StepStatus::Failed),
            other => Err(format!("invalid step status: {other}")),
        }
    }
}

/// The live-stream / replay element. `server_id = 0` denotes local stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleMsg {
    #[serde(rename = "serverId")]
    pub server_id: i64,
    /// 0..=6.
    pub step: u8,
    pub status: StepStatus,
    pub data: String,
}

/// Engine-wide tunables; see [`crate::config`] for the file format that fills these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Hard cap on concurrently live tasks (§4.6, §5 admission control).
    pub max_deploy: usize,
    /// Per-task wall-clock budget, starting at `Start` (§4.5 Cancellation).
    #[serde(with = "humantime_serde")]
    pub max_release_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_deploy: 5,
            max_release_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_matches_identity_tuple() {
        let s = Server {
            id: 1,
            name: "web-1".into(),
            user: "deploy".into(),
            password: "hunter2".into(),
            host: "10.0.0.1".into(),
            port: 22,
        };
        assert_eq!(s.pool_key(), "deploy:hunter2@10.0.0.1:22");
    }

    #[test]
    fn step_status_serializes_as_bare_int() {
        assert_eq!(serde_json::to_string(&StepStatus::Running).unwrap(), "0");
        assert_eq!(serde_json::to_string(&StepStatus::Success).unwrap(), "1");
        assert_eq!(serde_json::to_string(&StepStatus::Failed).unwrap(), "2");
        let back: StepStatus = serde_json::from_str("2").unwrap();
        assert_eq!(back, StepStatus::Failed);
        assert!(serde_json::from_str::<StepStatus>("9").is_err());
    }

    #[test]
    fn task_status_terminal_classification() {
        assert!(!TaskStatus::Waiting.is_terminal());
        assert!(!TaskStatus::Audit.is_terminal());
        assert!(!TaskStatus::Release.is_terminal());
        assert!(TaskStatus::Reject.is_terminal());
        assert!(TaskStatus::Finish.is_terminal());
        assert!(TaskStatus::ReleaseFail.is_terminal());
        assert!(TaskStatus::ReleasePartFail.is_terminal());
    }

    #[test]
    fn task_model_roundtrips_through_json() {
        let t = TaskModel {
            id: 1,
            space_id: 1,
            project_id: 7,
            environment_id: 2,
            name: "deploy web".into(),
            selector: Selector::Branch {
                branch: "main".into(),
                commit: "abc123".into(),
            },
            servers: vec![1, 2],
            status: TaskStatus::Audit,
            version: None,
            prev_version: None,
            last_error: None,
        };
        let json = serde_json::to_string(&t).unwrap();
        let back: TaskModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back.servers, vec![1, 2]);
        assert_eq!(back.selector, t.selector);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn record_status_roundtrips(status in -1i32..=255) {
                let rec = Record {
                    id: 1,
                    task_id: 1,
                    user_id: 1,
                    server_id: 0,
                    command: "echo hi".into(),
                    envs: vec!["A=1".into()],
                    status,
                    output: "hi\n".into(),
                    run_time_ms: 12,
                    created_at: Utc::now(),
                };
                let json = serde_json::to_string(&rec).unwrap();
                let back: Record = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(back.status, status);
            }

            #[test]
            fn console_msg_step_roundtrips(step in 0u8..=6) {
                let msg = ConsoleMsg {
                    server_id: 3,
                    step,
                    status: StepStatus::Running,
                    data: "partial output".into(),
                };
                let json = serde_json::to_string(&msg).unwrap();
                let back: ConsoleMsg = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(back.step, step);
                prop_assert_eq!(back.server_id, 3);
            }
        }
    }
}
