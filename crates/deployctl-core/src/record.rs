//! Command Record: execute one shell command, locally or on a server, and
//! persist the outcome.
//!
//! Grounded on the local-execution polling/timeout loop in the upstream
//! `process.rs` helper and on the exit-status classification and dual
//! `run`/`save` completion paths of the original `record.go`.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::buffer::OverflowBuffer;
use crate::sshpool::PooledSession;
use crate::types::{
    Record, STATUS_OK, STATUS_PENDING, STATUS_TRANSPORT_OR_PACKAGING, STATUS_UNKNOWN,
};

/// Where a [`CommandRecord`] executes.
enum Target {
    Local { cwd: std::path::PathBuf },
    Remote { session: Arc<PooledSession> },
}

/// One command execution in flight. Captures output into both a private
/// buffer (returned by [`CommandRecord::output`]) and the per-target
/// [`OverflowBuffer`] passed in at construction.
pub struct CommandRecord {
    task_id: i64,
    user_id: i64,
    server_id: i64,
    command: String,
    envs: Vec<String>,
    live_sink: Arc<OverflowBuffer>,
    target: Target,
    status: i32,
    captured: Vec<u8>,
    run_time_ms: u64,
}

impl CommandRecord {
    pub fn new_local(
        task_id: i64,
        user_id: i64,
        cmd: impl Into<String>,
        envs: Vec<String>,
        cwd: impl Into<std::path::PathBuf>,
        live_sink: Arc<OverflowBuffer>,
    ) -> Self {
        Self {
            task_id,
            user_id,
            server_id: 0,
            command: cmd.into(),
            envs,
            live_sink,
            target: Target::Local { cwd: cwd.into() },
            status: STATUS_PENDING,
            captured: Vec::new(),
            run_time_ms: 0,
        }
    }

    pub fn new_remote(
        task_id: i64,
        user_id: i64,
        cmd: impl Into<String>,
        server_id: i64,
        envs: Vec<String>,
        session: Arc<PooledSession>,
        live_sink: Arc<OverflowBuffer>,
    ) -> Self {
        Self {
            task_id,
            user_id,
            server_id,
            command: cmd.into(),
            envs,
            live_sink,
            target: Target::Remote { session },
            status: STATUS_PENDING,
            captured: Vec::new(),
            run_time_ms: 0,
        }
    }

    /// Runs the command, teeing combined output into the private buffer and
    /// the live sink, then classifies and persists the result.
    ///
    /// Classification (spec §4.2):
    /// - success -> `STATUS_OK`
    /// - exit-status error (local process or remote shell) -> that exit code
    /// - any other failure (connect, signal, transport) -> `STATUS_UNKNOWN`
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<i32> {
        let start = Instant::now();
        let rendered = self.render_command();

        let (status, output) = match &self.target {
            Target::Local { cwd } => run_local(&rendered, cwd, cancel)?,
            Target::Remote { session } => {
                let mut collected = Vec::new();
                let code = session
                    .run_streaming(&rendered, cancel, |chunk| {
                        collected.extend_from_slice(chunk);
                        let _ = self.live_sink.write(chunk);
                    })
                    .unwrap_or(-1);
                (classify_exit_code(Some(code)), collected)
            }
        };

        if let Target::Local { .. } = &self.target {
            let _ = self.live_sink.write(&output);
        }

        self.captured = output;
        self.status = status;
        self.run_time_ms = start.elapsed().as_millis() as u64;
        Ok(self.status)
    }

    /// Alternative completion for work that isn't a direct shell command
    /// (archive creation, upload). Writes a human-readable summary line into
    /// the live sink and records the given status and elapsed time.
    pub fn save(&mut self, status: i32, output_text: impl Into<String>, elapsed: Duration) {
        let output_text = output_text.into();
        let summary = format!("{}\n", output_text);
        let _ = self.live_sink.write(summary.as_bytes());
        self.captured = output_text.into_bytes();
        self.status = status;
        self.run_time_ms = elapsed.as_millis() as u64;
    }

    /// The privately captured output, e.g. for reading a previous symlink
    /// target out of a `readlink` record.
    pub fn output(&self) -> &[u8] {
        &self.captured
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    /// Renders the command with its environment prefix. Remote execution
    /// prepends `K=V K=V ... && cmd` (spec §4.2 rationale: many SSH servers
    /// do not honor per-session env). Local execution passes the real
    /// process environment instead, matching the upstream's
    /// `local_exec.go`/`remote_exec.go` split.
    fn render_command(&self) -> String {
        match &self.target {
            Target::Local { .. } => self.command.clone(),
            Target::Remote { .. } => render_with_env_prefix(&self.envs, &self.command),
        }
    }

    /// Converts this record into a persistable [`Record`] row. Must be
    /// called after `run`/`save` (status will otherwise be `STATUS_PENDING`,
    /// which the Record Store should reject as "not yet terminated").
    pub fn into_record(self, id: i64) -> Record {
        Record {
            id,
            task_id: self.task_id,
            user_id: self.user_id,
            server_id: self.server_id,
            command: self.command,
            envs: self.envs,
            status: self.status,
            output: String::from_utf8_lossy(&self.captured).into_owned(),
            run_time_ms: self.run_time_ms,
            created_at: Utc::now(),
        }
    }
}

fn render_with_env_prefix(envs: &[String], cmd: &str) -> String {
    if envs.is_empty() {
        cmd.to_string()
    } else {
        format!("{} && {}", envs.join(" "), cmd)
    }
}

fn classify_exit_code(code: Option<i32>) -> i32 {
    match code {
        Some(0) => STATUS_OK,
        Some(n) => n,
        None => STATUS_UNKNOWN,
    }
}

fn run_local(cmd: &str, cwd: &Path, cancel: &AtomicBool) -> Result<(i32, Vec<u8>)> {
    use std::sync::atomic::Ordering;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn local command")?;

    // Drain stdout/stderr on their own threads as the process runs: a
    // command that writes more than the pipe buffer would otherwise block
    // on write() forever, since nothing reads from the pipe until after
    // try_wait() reports exit.
    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");
    let stdout_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let status = loop {
        if cancel.load(Ordering::Relaxed) {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        match child.try_wait().context("failed to poll local command")? {
            Some(status) => break Some(status),
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    };

    let mut combined = stdout_thread.join().unwrap_or_default();
    combined.extend_from_slice(&stderr_thread.join().unwrap_or_default());

    match status {
        Some(status) => Ok((classify_exit_code(status.code()), combined)),
        None => Ok((STATUS_UNKNOWN, Vec::new())),
    }
}

/// Status used by callers that bypass `run` entirely (packaging/upload
/// failures detected before a shell command could even be attempted).
pub const TRANSPORT_OR_PACKAGING_FAILURE: i32 = STATUS_TRANSPORT_OR_PACKAGING;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_success_classifies_as_ok() {
        let sink = Arc::new(OverflowBuffer::new());
        let cancel = AtomicBool::new(false);
        let mut rec = CommandRecord::new_local(1, 1, "echo hi", vec![], ".", Arc::clone(&sink));
        let status = rec.run(&cancel).unwrap();
        assert_eq!(status, STATUS_OK);
        assert!(String::from_utf8_lossy(rec.output()).contains("hi"));
    }

    #[test]
    fn local_failure_reports_exact_exit_code() {
        let sink = Arc::new(OverflowBuffer::new());
        let cancel = AtomicBool::new(false);
        let mut rec = CommandRecord::new_local(1, 1, "exit 7", vec![], ".", sink);
        let status = rec.run(&cancel).unwrap();
        assert_eq!(status, 7);
    }

    #[test]
    fn output_is_teed_into_live_sink() {
        let sink = Arc::new(OverflowBuffer::new());
        let cancel = AtomicBool::new(false);
        let mut rec = CommandRecord::new_local(1, 1, "echo teed", vec![], ".", Arc::clone(&sink));
        rec.run(&cancel).unwrap();
        let mut dst = [0u8; 64];
        let out = sink.read_at(&mut dst, 0);
        assert!(String::from_utf8_lossy(&dst[..out.n]).contains("teed"));
    }

    #[test]
    fn save_completion_sets_status_and_writes_summary() {
        let sink = Arc::new(OverflowBuffer::new());
        let mut rec = CommandRecord::new_local(1, 1, "n/a", vec![], ".", Arc::clone(&sink));
        rec.save(
            TRANSPORT_OR_PACKAGING_FAILURE,
            "sftp upload failed: connection reset",
            Duration::from_millis(42),
        );
        assert_eq!(rec.status(), STATUS_TRANSPORT_OR_PACKAGING);
        let mut dst = [0u8; 128];
        let out = sink.read_at(&mut dst, 0);
        assert!(String::from_utf8_lossy(&dst[..out.n]).contains("sftp upload failed"));
    }

    #[test]
    fn render_with_env_prefix_matches_shell_contract() {
        let rendered = render_with_env_prefix(
            &["PROJECT_ID=7".to_string(), "TASK_ID=3".to_string()],
            "./deploy.sh",
        );
        assert_eq!(rendered, "PROJECT_ID=7 TASK_ID=3 && ./deploy.sh");
    }

    #[test]
    fn render_with_env_prefix_no_envs_is_bare_command() {
        assert_eq!(render_with_env_prefix(&[], "./deploy.sh"), "./deploy.sh");
    }

    #[test]
    fn into_record_captures_lossy_utf8_output() {
        let sink = Arc::new(OverflowBuffer::new());
        let cancel = AtomicBool::new(false);
        let mut rec = CommandRecord::new_local(9, 2, "echo record-me", vec![], ".", sink);
        rec.run(&cancel).unwrap();
        let record = rec.into_record(100);
        assert_eq!(record.id, 100);
        assert_eq!(record.task_id, 9);
        assert_eq!(record.status, STATUS_OK);
        assert!(record.output.contains("record-me"));
    }
}
