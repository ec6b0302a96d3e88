//! Task: the release state machine. Validates preconditions, assigns a
//! version, and drives the six-stage pipeline (local checkout/build/package,
//! then a per-server parallel release fan-out), maintaining live progress and
//! a terminal, composite outcome.
//!
//! Grounded on the stage table and exact path/record contracts of the
//! upstream `task.go`, translated from its goroutine/WaitGroup fan-out into
//! a `std::thread::scope` fan-out, matching the thread-based concurrency
//! model used elsewhere in this crate (e.g. `engine_parallel.rs`) without
//! needing `unsafe` to share `&self` across the spawned threads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::{instrument, warn};

use crate::buffer::OverflowBuffer;
use crate::console::LiveConsole;
use crate::record::{CommandRecord, TRANSPORT_OR_PACKAGING_FAILURE};
use crate::repo::{Repo, RepositoryProvider};
use crate::sshpool::{ExecutorPool, ServerConfig};
use crate::store::RecordStore;
use crate::types::{
    Environment, FilterMode, Project, Record, Selector, Server, TaskModel, TaskServer,
    TaskServerStatus, TaskStatus, STATUS_OK, StepStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task is not awaiting audit")]
    NotAudited,
    #[error("environment is disabled")]
    EnvironmentDisabled,
    #[error("project is disabled")]
    ProjectDisabled,
    #[error("no target servers selected")]
    NoServers,
    #[error("发布分支选取错误")]
    BadSelector,
    #[error("deploy stopped")]
    StopDeploy,
    #[error("{0}")]
    Other(String),
}

/// Splits a hook/task-vars text blob into runnable lines (spec §6 "Command
/// hooks format"): empty lines, `#`-comments, and `//`-comments are dropped.
pub fn parse_hook_lines(blob: &str) -> Vec<String> {
    blob.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("//"))
        .map(str::to_string)
        .collect()
}

/// `TaskVars` uses the same comment rules as hooks; each surviving line is an
/// already-formed `K=V` entry.
pub fn parse_task_vars(blob: &str) -> Vec<String> {
    parse_hook_lines(blob)
}

/// `<projectId>_<taskId>_<YYYYMMDD_HHMMSS>` in local time (spec §6).
fn format_version(project_id: i64, task_id: i64, now: chrono::DateTime<Local>) -> String {
    format!(
        "{}_{}_{}",
        project_id,
        task_id,
        now.format("%Y%m%d_%H%M%S")
    )
}

/// Bit-exact path constants derived from a version string (spec §6).
#[derive(Debug, Clone)]
pub struct DeployDirs {
    pub local_warehouse_dir: PathBuf,
    pub local_code_package: PathBuf,
    pub remote_release_dir: String,
    pub remote_release_package: String,
    pub remote_root_link: String,
}

impl DeployDirs {
    fn compute(repo_root: &std::path::Path, version: &str, project: &Project) -> Self {
        Self {
            local_warehouse_dir: repo_root.join(version),
            local_code_package: repo_root.join(format!("{version}.tar.gz")),
            remote_release_dir: format!(
                "{}/{version}/",
                project.target_releases.trim_end_matches('/')
            ),
            remote_release_package: format!(
                "{}/{version}.tar.gz",
                project.target_releases.trim_end_matches('/')
            ),
            remote_root_link: project.target_root.clone(),
        }
    }
}

/// `steps[targetId]`: monotonically non-decreasing stage progress plus
/// current status, surfaced on every `ConsoleMsg` (spec §4.5, testable
/// property 2).
#[derive(Debug, Clone, Copy)]
struct StepEntry {
    step: u8,
    status: StepStatus,
}

pub struct Task {
    model: Mutex<TaskModel>,
    project: Project,
    environment: Environment,
    servers: Vec<Server>,
    user_id: i64,
    repo_provider: Arc<RepositoryProvider>,
    pool: Arc<ExecutorPool>,
    store: Arc<dyn RecordStore>,
    console: Arc<LiveConsole>,
    buffers: Mutex<HashMap<i64, Arc<OverflowBuffer>>>,
    steps: Mutex<HashMap<i64, StepEntry>>,
    next_record_id: AtomicI64,
    cancel: Arc<AtomicBool>,
    server_errors: Mutex<HashMap<i64, Option<String>>>,
    last_dirs: Mutex<Option<DeployDirs>>,
    identity_file: Option<String>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: TaskModel,
        project: Project,
        environment: Environment,
        servers: Vec<Server>,
        user_id: i64,
        repo_provider: Arc<RepositoryProvider>,
        pool: Arc<ExecutorPool>,
        store: Arc<dyn RecordStore>,
        identity_file: Option<String>,
    ) -> Self {
        Self {
            model: Mutex::new(model),
            project,
            environment,
            servers,
            user_id,
            repo_provider,
            pool,
            store,
            console: Arc::new(LiveConsole::new()),
            buffers: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            next_record_id: AtomicI64::new(1),
            cancel: Arc::new(AtomicBool::new(false)),
            server_errors: Mutex::new(HashMap::new()),
            last_dirs: Mutex::new(None),
            identity_file,
        }
    }

    pub fn id(&self) -> i64 {
        self.model.lock().expect("task model lock poisoned").id
    }

    pub fn console(&self) -> Arc<LiveConsole> {
        Arc::clone(&self.console)
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Preconditions from spec §4.5: status must be `Audit`, environment and
    /// project must be enabled, and the server set must be non-empty.
    pub fn check(&self) -> Result<(), TaskError> {
        let model = self.model.lock().expect("task model lock poisoned");
        if model.status != TaskStatus::Audit {
            return Err(TaskError::NotAudited);
        }
        if !self.environment.enabled {
            return Err(TaskError::EnvironmentDisabled);
        }
        if !self.project.enabled {
            return Err(TaskError::ProjectDisabled);
        }
        if model.servers.is_empty() || self.servers.is_empty() {
            return Err(TaskError::NoServers);
        }
        Ok(())
    }

    fn buffer_for(&self, target: i64) -> Arc<OverflowBuffer> {
        let mut buffers = self.buffers.lock().expect("buffer map lock poisoned");
        Arc::clone(
            buffers
                .entry(target)
                .or_insert_with(|| Arc::new(OverflowBuffer::new())),
        )
    }

    fn set_step(&self, target: i64, step: u8, status: StepStatus) {
        self.steps
            .lock()
            .expect("steps lock poisoned")
            .insert(target, StepEntry { step, status });
        let buf = self.buffer_for(target);
        self.console.register(target, buf, step);
        self.console.set_step(target, step);
    }

    fn env_for_task(&self, version: &str) -> Vec<String> {
        let mut envs = parse_task_vars(&self.project.hooks.task_vars);
        let model = self.model.lock().expect("task model lock poisoned");
        envs.push(format!("PROJECT_ID={}", self.project.id));
        envs.push(format!("PROJECT_NAME={}", self.project.name));
        envs.push(format!("TASK_ID={}", model.id));
        envs.push(format!("TASK_NAME={}", model.name));
        envs.push(format!("RELEASE_PATH={version}"));
        envs
    }

    fn next_id(&self) -> i64 {
        self.next_record_id.fetch_add(1, Ordering::SeqCst)
    }

    fn persist(&self, record: CommandRecord) {
        let id = self.next_id();
        let rec: Record = record.into_record(id);
        if let Err(err) = self.store.save_record(&rec) {
            warn!(?err, task_id = rec.task_id, "failed to persist command record");
        }
    }

    /// Runs each non-comment line of `blob` as a local shell command with
    /// `cwd` and `envs`, persisting one Record per line. Stops at the first
    /// failure.
    fn run_local_hook(&self, blob: &str, cwd: &std::path::Path, envs: &[String]) -> Result<(), String> {
        for line in parse_hook_lines(blob) {
            let mut rec = CommandRecord::new_local(
                self.id(),
                self.user_id,
                line.clone(),
                envs.to_vec(),
                cwd,
                self.buffer_for(0),
            );
            let status = rec.run(&self.cancel).map_err(|e| e.to_string())?;
            self.persist(rec);
            if status != STATUS_OK {
                return Err(format!("hook command failed: {line} (status {status})"));
            }
        }
        Ok(())
    }

    fn run_remote_hook(
        &self,
        blob: &str,
        server: &Server,
        envs: &[String],
        cwd: &str,
    ) -> Result<(), String> {
        for line in parse_hook_lines(blob) {
            let cmd = format!("cd {} && {line}", shell_quote(cwd));
            let status = self.run_remote_command(server, &cmd, envs)?;
            if status != STATUS_OK {
                return Err(format!("hook command failed: {line} (status {status})"));
            }
        }
        Ok(())
    }

    fn run_remote_command(&self, server: &Server, cmd: &str, envs: &[String]) -> Result<i32, String> {
        let session = self
            .pool
            .get(&ServerConfig::from_server(server, self.identity_file.clone()))
            .map_err(|e| e.to_string())?;
        let mut rec = CommandRecord::new_remote(
            self.id(),
            self.user_id,
            cmd,
            server.id,
            envs.to_vec(),
            Arc::new(session),
            self.buffer_for(server.id),
        );
        let status = rec.run(&self.cancel).map_err(|e| e.to_string())?;
        self.persist(rec);
        Ok(status)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Drives the full pipeline. Blocking; the Engine runs this on a
    /// dedicated thread. Returns the terminal task status and, on success or
    /// partial success, leaves `TaskServer` rows upserted.
    #[instrument(skip(self), fields(task_id = self.id()))]
    pub fn run(&self) -> TaskStatus {
        let result = self.run_inner();
        let final_status = match result {
            Ok(status) => status,
            Err(err) => {
                warn!(?err, "task pipeline failed before server fan-out");
                {
                    let mut model = self.model.lock().expect("task model lock poisoned");
                    model.last_error = Some(err.to_string());
                }
                TaskStatus::ReleaseFail
            }
        };

        {
            let mut model = self.model.lock().expect("task model lock poisoned");
            model.status = final_status;
        }
        if let Err(err) = self
            .store
            .save_task_model(&self.model.lock().expect("task model lock poisoned"))
        {
            warn!(?err, "failed to persist terminal task status");
        }

        for buf in self.buffers.lock().expect("buffer map lock poisoned").values() {
            buf.seal();
        }
        self.cleanup_local_temp_files();
        final_status
    }

    fn cleanup_local_temp_files(&self) {
        // Best-effort: dirs only exist if stage 1/2 reached far enough to
        // create them.
        if let Some(dirs) = self.last_dirs.lock().expect("dirs lock poisoned").clone() {
            let _ = std::fs::remove_dir_all(&dirs.local_warehouse_dir);
            let _ = std::fs::remove_file(&dirs.local_code_package);
        }
    }

    fn run_inner(&self) -> Result<TaskStatus, TaskError> {
        self.check()?;

        let version = format_version(self.project.id, self.id(), Local::now());
        {
            let mut model = self.model.lock().expect("task model lock poisoned");
            model.status = TaskStatus::Release;
            model.version = Some(version.clone());
        }
        if let Err(err) = self
            .store
            .save_task_model(&self.model.lock().expect("task model lock poisoned"))
        {
            warn!(?err, "failed to persist release-start task status");
        }

        let selector = self.model.lock().expect("task model lock poisoned").selector.clone();
        let local_key = format!("project-{}", self.project.id);
        let repo = self
            .repo_provider
            .open(self.project.repo_kind, &self.project.repo_url, &local_key)
            .map_err(|e| TaskError::Other(e.to_string()))?;

        let dirs = DeployDirs::compute(repo.path(), &version, &self.project);
        *self.last_dirs.lock().expect("dirs lock poisoned") = Some(dirs.clone());
        let envs = self.env_for_task(&version);

        self.set_step(0, 1, StepStatus::Running);
        self.run_local_hook(&self.project.hooks.prev_deploy, repo.path(), &envs)
            .map_err(TaskError::Other)?;
        if self.cancelled() {
            return Err(TaskError::StopDeploy);
        }

        self.set_step(0, 2, StepStatus::Running);
        match &selector {
            Selector::Tag(tag) => repo.checkout_to_tag(tag),
            Selector::Branch { branch, commit } => {
                if branch.is_empty() || commit.is_empty() {
                    return Err(TaskError::BadSelector);
                }
                repo.checkout_to_commit(branch, commit)
            }
        }
        .map_err(|e| TaskError::Other(e.to_string()))?;
        copy_tree(repo.path(), &dirs.local_warehouse_dir).map_err(TaskError::Other)?;
        if self.cancelled() {
            return Err(TaskError::StopDeploy);
        }

        self.set_step(0, 3, StepStatus::Running);
        self.run_local_hook(&self.project.hooks.post_deploy, &dirs.local_warehouse_dir, &envs)
            .map_err(TaskError::Other)?;
        self.archive(&dirs).map_err(TaskError::Other)?;
        self.set_step(0, 3, StepStatus::Success);
        if self.cancelled() {
            return Err(TaskError::StopDeploy);
        }

        std::thread::scope(|scope| {
            for server in &self.servers {
                let dirs = dirs.clone();
                let envs = envs.clone();
                scope.spawn(move || self.release_to_server(server, &dirs, &envs));
            }
        });

        let errors = self.server_errors.lock().expect("server errors lock poisoned");
        let total = errors.len();
        let failures = errors.values().filter(|e| e.is_some()).count();
        let status = if failures == 0 {
            TaskStatus::Finish
        } else if failures == total {
            TaskStatus::ReleaseFail
        } else {
            TaskStatus::ReleasePartFail
        };
        Ok(status)
    }

    fn archive(&self, dirs: &DeployDirs) -> Result<(), String> {
        let include_list = match self.project.filter_mode {
            FilterMode::Include => Some(self.write_include_list(dirs)?),
            FilterMode::Exclude => None,
        };

        let mut cmd = format!(
            "tar -czf {} -C {}",
            shell_quote(&dirs.local_code_package.to_string_lossy()),
            shell_quote(&dirs.local_warehouse_dir.to_string_lossy()),
        );
        match &include_list {
            Some(list_path) => {
                cmd.push_str(&format!(" -T {}", shell_quote(&list_path.to_string_lossy())));
            }
            None => {
                for pattern in build_tar_excludes(&self.project) {
                    cmd.push_str(&format!(" --exclude={}", shell_quote(&pattern)));
                }
                cmd.push_str(" .");
            }
        }
        let mut rec = CommandRecord::new_local(
            self.id(),
            self.user_id,
            cmd,
            vec![],
            &dirs.local_warehouse_dir,
            self.buffer_for(0),
        );
        let status = rec.run(&self.cancel).map_err(|e| e.to_string())?;
        self.persist(rec);
        if let Some(list_path) = &include_list {
            let _ = std::fs::remove_file(list_path);
        }
        if status != STATUS_OK {
            return Err(format!("archive creation failed with status {status}"));
        }
        Ok(())
    }

    /// Writes `project.excludes`'s exact filenames (one per surviving line,
    /// comment rules per [`parse_hook_lines`]) to a file list consumed by
    /// `tar -T` for `FilterMode::Include` (spec §4.5 include/exclude
    /// semantics; named after the original's `compress.FileMatch` exact
    /// match mode).
    fn write_include_list(&self, dirs: &DeployDirs) -> Result<std::path::PathBuf, String> {
        let list_path = dirs.local_warehouse_dir.with_extension("tar-include-list");
        let names = parse_hook_lines(&self.project.excludes).join("\n");
        std::fs::write(&list_path, names).map_err(|e| e.to_string())?;
        Ok(list_path)
    }

    fn release_to_server(&self, server: &Server, dirs: &DeployDirs, envs: &[String]) {
        let result = self.release_to_server_inner(server, dirs, envs);
        let (status, error) = match &result {
            Ok(()) => (TaskServerStatus::Success, None),
            Err(err) => (TaskServerStatus::Fail, Some(err.clone())),
        };
        self.server_errors
            .lock()
            .expect("server errors lock poisoned")
            .insert(server.id, error.clone());
        if let Err(err) = self.store.upsert_task_server(&TaskServer {
            task_id: self.id(),
            server_id: server.id,
            status,
            error,
        }) {
            warn!(?err, server_id = server.id, "failed to persist task-server row");
        }
    }

    fn release_to_server_inner(
        &self,
        server: &Server,
        dirs: &DeployDirs,
        envs: &[String],
    ) -> Result<(), String> {
        self.set_step(server.id, 4, StepStatus::Running);
        self.stage4_pre_release(server, dirs, envs)?;
        if self.cancelled() {
            return Err("deploy stopped".to_string());
        }

        self.set_step(server.id, 5, StepStatus::Running);
        self.stage5_release(server, dirs)?;
        if self.cancelled() {
            return Err("deploy stopped".to_string());
        }

        self.set_step(server.id, 6, StepStatus::Running);
        self.run_remote_hook(
            &self.project.hooks.post_release,
            server,
            envs,
            &dirs.remote_root_link,
        )?;
        self.set_step(server.id, 6, StepStatus::Success);
        Ok(())
    }

    fn stage4_pre_release(&self, server: &Server, dirs: &DeployDirs, envs: &[String]) -> Result<(), String> {
        let start = std::time::Instant::now();
        let session = self
            .pool
            .get(&ServerConfig::from_server(server, self.identity_file.clone()))
            .map_err(|e| e.to_string())?;
        let upload_result = session.upload(&dirs.local_code_package, &dirs.remote_release_package);
        let mut rec = CommandRecord::new_remote(
            self.id(),
            self.user_id,
            format!("upload {}", dirs.remote_release_package),
            server.id,
            vec![],
            Arc::new(session),
            self.buffer_for(server.id),
        );
        match upload_result {
            Ok(()) => rec.save(STATUS_OK, "upload complete", start.elapsed()),
            Err(err) => {
                rec.save(
                    TRANSPORT_OR_PACKAGING_FAILURE,
                    format!("upload failed: {err}"),
                    start.elapsed(),
                );
                self.persist(rec);
                return Err(err.to_string());
            }
        }
        self.persist(rec);

        let untar = format!(
            "mkdir -p {} && tar -zxvf {} -C {}",
            shell_quote(&dirs.remote_release_dir),
            shell_quote(&dirs.remote_release_package),
            shell_quote(&dirs.remote_release_dir),
        );
        let status = self.run_remote_command(server, &untar, &[])?;
        if status != STATUS_OK {
            return Err(format!("remote untar failed with status {status}"));
        }

        self.run_remote_hook(
            &self.project.hooks.prev_release,
            server,
            envs,
            &dirs.remote_release_dir,
        )
    }

    fn stage5_release(&self, server: &Server, dirs: &DeployDirs) -> Result<(), String> {
        let root = &dirs.remote_root_link;
        let readlink = format!(
            "[ -L {root} ] && readlink {root} || echo ''",
            root = shell_quote(root)
        );
        let session = self
            .pool
            .get(&ServerConfig::from_server(server, self.identity_file.clone()))
            .map_err(|e| e.to_string())?;
        let mut rec = CommandRecord::new_remote(
            self.id(),
            self.user_id,
            readlink,
            server.id,
            vec![],
            Arc::new(session),
            self.buffer_for(server.id),
        );
        let status = rec.run(&self.cancel).map_err(|e| e.to_string())?;
        let prev = String::from_utf8_lossy(rec.output()).trim().to_string();
        self.persist(rec);
        if status != STATUS_OK {
            return Err(format!("readlink failed with status {status}"));
        }
        {
            let mut model = self.model.lock().expect("task model lock poisoned");
            if model.prev_version.is_none() && !prev.is_empty() {
                model.prev_version = Some(prev);
            }
        }

        let ln_tmp = format!(
            "mkdir -p $(dirname {root}) && ln -sfn {release} {root}_tmp",
            root = shell_quote(root),
            release = shell_quote(&dirs.remote_release_dir),
        );
        let status = self.run_remote_command(server, &ln_tmp, &[])?;
        if status != STATUS_OK {
            return Err(format!("symlink staging failed with status {status}"));
        }

        let mv = format!(
            "mv -fT {root}_tmp {root}",
            root = shell_quote(root)
        );
        let status = self.run_remote_command(server, &mv, &[])?;
        if status != STATUS_OK {
            return Err(format!("activation swap failed with status {status}"));
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Exclude-mode glob patterns to skip when archiving. Only called for
/// `FilterMode::Exclude`; `Include` mode builds a `tar -T` file list instead
/// (see `Task::write_include_list`).
fn build_tar_excludes(project: &Project) -> Vec<String> {
    parse_hook_lines(&project.excludes)
}

fn copy_tree(src: &std::path::Path, dst: &std::path::Path) -> Result<(), String> {
    std::fs::create_dir_all(dst).map_err(|e| e.to_string())?;
    let status = std::process::Command::new("cp")
        .arg("-a")
        .arg(format!("{}/.", src.display()))
        .arg(dst)
        .status()
        .map_err(|e| e.to_string())?;
    if !status.success() {
        return Err(format!("cp -a exited with {status}"));
    }
    Ok(())
}
