//! Deploy Engine: the task registry. Enforces the admission cap, owns each
//! task's cancellation flag and timeout watchdog, and routes `Output`
//! requests to a live [`Task`] or to a Record Store replay.
//!
//! Grounded on the upstream `Reporter`/policy-effects split for the
//! logging surface and on the original `deploy.go`'s `Start`/`Stop`/`Output`
//! contract (including its Chinese-language admission/duplicate/not-found
//! error strings, preserved verbatim as part of the external contract).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{info, instrument, warn};

use crate::console::LiveConsole;
use crate::repo::RepositoryProvider;
use crate::sshpool::ExecutorPool;
use crate::store::RecordStore;
use crate::task::Task;
use crate::types::{ConsoleMsg, Environment, EngineOptions, Project, Server, StepStatus, TaskModel};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("已经超出部署队列最大数量")]
    AdmissionFull,
    #[error("task[{0}]已在部署中")]
    AlreadyRunning(i64),
    #[error("部署任务已完成或未创建")]
    NotFound,
    #[error(transparent)]
    Task(#[from] crate::task::TaskError),
}

struct TaskEntry {
    task: Arc<Task>,
    cancel: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    _handle: JoinHandle<()>,
}

/// Reporter for engine-level lifecycle events, in the upstream's trait-based
/// reporting style; the default `tracing` implementation is used unless a
/// caller supplies its own (e.g. the CLI's interactive reporter).
pub trait Reporter: Send + Sync {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
}

/// Default reporter: structured `tracing` events, one span per task.
#[derive(Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn info(&self, msg: &str) {
        info!("{msg}");
    }

    fn warn(&self, msg: &str) {
        warn!("{msg}");
    }
}

/// What an `Output` request resolves to.
pub enum OutputSource {
    /// The task is live; tail its [`LiveConsole`].
    Live(Arc<LiveConsole>),
    /// The task is absent from the registry; here is its replayed history.
    Replayed(Vec<ConsoleMsg>),
}

pub struct Engine {
    tasks: Mutex<HashMap<i64, TaskEntry>>,
    options: EngineOptions,
    store: Arc<dyn RecordStore>,
    pool: Arc<ExecutorPool>,
    repo_provider: Arc<RepositoryProvider>,
    reporter: Arc<dyn Reporter>,
    identity_file: Option<String>,
}

impl Engine {
    pub fn new(
        options: EngineOptions,
        store: Arc<dyn RecordStore>,
        pool: Arc<ExecutorPool>,
        repo_provider: Arc<RepositoryProvider>,
    ) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            options,
            store,
            pool,
            repo_provider,
            reporter: Arc::new(TracingReporter),
            identity_file: None,
        }
    }

    pub fn with_identity_file(mut self, identity_file: Option<String>) -> Self {
        self.identity_file = identity_file;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Drops terminal-status entries from the registry, except for
    /// `keep_id` (spec §9 open-question decision: lazy pruning on the next
    /// admission-relevant call for a *different* task, not automatic).
    fn prune_terminal(&self, keep_id: i64) {
        let mut tasks = self.tasks.lock().expect("engine tasks lock poisoned");
        tasks.retain(|&id, entry| id == keep_id || !entry.done.load(Ordering::Relaxed));
    }

    /// Admits and starts a task. Rejects if a task with the same id is
    /// already registered (running or awaiting pruning) or the registry is
    /// at `MaxDeploy`.
    #[instrument(skip_all, fields(task_id = model.id))]
    pub fn start(
        &self,
        model: TaskModel,
        project: Project,
        environment: Environment,
        servers: Vec<Server>,
        user_id: i64,
    ) -> Result<(), EngineError> {
        let task_id = model.id;
        self.prune_terminal(task_id);

        let mut tasks = self.tasks.lock().expect("engine tasks lock poisoned");
        if tasks.contains_key(&task_id) {
            return Err(EngineError::AlreadyRunning(task_id));
        }
        if tasks.len() >= self.options.max_deploy {
            return Err(EngineError::AdmissionFull);
        }

        let task = Arc::new(Task::new(
            model,
            project,
            environment,
            servers,
            user_id,
            Arc::clone(&self.repo_provider),
            Arc::clone(&self.pool),
            Arc::clone(&self.store),
            self.identity_file.clone(),
        ));
        task.check()?;

        let cancel = task.cancel_handle();
        let done = Arc::new(AtomicBool::new(false));
        let timeout = self.options.max_release_timeout;
        let reporter = Arc::clone(&self.reporter);

        let watchdog_cancel = Arc::clone(&cancel);
        let watchdog_done = Arc::clone(&done);
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            if !watchdog_done.load(Ordering::Relaxed) {
                watchdog_cancel.store(true, Ordering::Relaxed);
            }
        });

        let run_task = Arc::clone(&task);
        let run_done = Arc::clone(&done);
        let handle = std::thread::spawn(move || {
            let status = run_task.run();
            run_done.store(true, Ordering::Relaxed);
            reporter.info(&format!(
                "task[{}] finished with status {status:?}",
                run_task.id()
            ));
        });

        tasks.insert(
            task_id,
            TaskEntry {
                task,
                cancel,
                done,
                _handle: handle,
            },
        );
        Ok(())
    }

    /// Signals cancellation. Per spec §4.6, absence of the task (already
    /// finished and pruned, or never started) is reported as
    /// [`EngineError::NotFound`] — the defined signal that callers should
    /// fall back to Record Store replay.
    pub fn stop(&self, task_id: i64) -> Result<(), EngineError> {
        let tasks = self.tasks.lock().expect("engine tasks lock poisoned");
        match tasks.get(&task_id) {
            Some(entry) => {
                entry.cancel.store(true, Ordering::Relaxed);
                Ok(())
            }
            None => Err(EngineError::NotFound),
        }
    }

    /// Live stream if the task is registered; otherwise a full replay built
    /// from the Record Store. `server_name` resolves a record's `server_id`
    /// to a display label for replay formatting.
    pub fn output(
        &self,
        task_id: i64,
        server_name: impl Fn(i64) -> String,
    ) -> Result<OutputSource, EngineError> {
        {
            let tasks = self.tasks.lock().expect("engine tasks lock poisoned");
            if let Some(entry) = tasks.get(&task_id) {
                return Ok(OutputSource::Live(entry.task.console()));
            }
        }

        let records = self
            .store
            .records_for_task(task_id)
            .map_err(|_| EngineError::NotFound)?;
        if records.is_empty() {
            return Err(EngineError::NotFound);
        }
        let messages = records
            .iter()
            .map(|record| {
                let host = if record.server_id == 0 {
                    "local".to_string()
                } else {
                    server_name(record.server_id)
                };
                ConsoleMsg {
                    server_id: record.server_id,
                    step: 0,
                    status: if record.status == crate::types::STATUS_OK {
                        StepStatus::Success
                    } else {
                        StepStatus::Failed
                    },
                    data: format!("{host} $ {}\r\n{}", record.command, record.output),
                }
            })
            .collect();
        Ok(OutputSource::Replayed(messages))
    }

    pub fn live_task_count(&self) -> usize {
        self.tasks.lock().expect("engine tasks lock poisoned").len()
    }
}
