//! Record Store: the abstract persistence layer for [`Record`]s,
//! [`TaskServer`] outcomes, and [`TaskModel`] snapshots.
//!
//! Grounded on the upstream `state.rs`/`store.rs` trait-based storage split:
//! a trait for the abstraction (so the engine never depends on a concrete
//! backend) and a filesystem implementation using the same
//! atomic-tmp-file-then-rename write discipline, plus the append-only JSONL
//! log pattern from the `shipper-events` reference crate for the
//! append-mostly Record stream.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::types::{Record, TaskModel, TaskServer};

/// Trait for record-store backends. Abstracts away whether records live on
/// disk, in a relational database, or elsewhere (spec §1 "the relational
/// store is an abstract Record Store").
pub trait RecordStore: Send + Sync {
    /// Allocates a fresh, monotonically increasing record id.
    fn next_record_id(&self) -> i64;

    /// Persists a terminated record (`status != -1`). Called exactly once
    /// per command that starts (spec testable property 1).
    fn save_record(&self, record: &Record) -> Result<()>;

    /// Records for one task, ordered by `created_at` ascending (spec §4.8
    /// replay ordering, testable property 7).
    fn records_for_task(&self, task_id: i64) -> Result<Vec<Record>>;

    /// Upserts a per-(task, server) outcome row.
    fn upsert_task_server(&self, row: &TaskServer) -> Result<()>;

    fn task_servers_for_task(&self, task_id: i64) -> Result<Vec<TaskServer>>;

    fn save_task_model(&self, model: &TaskModel) -> Result<()>;

    fn load_task_model(&self, task_id: i64) -> Result<Option<TaskModel>>;
}

/// Filesystem-backed [`RecordStore`]: one JSONL file of records per task,
/// one JSON snapshot file for each task model, and one JSON file per task
/// holding its `TaskServer` rows (small and infrequently written, so a
/// full-file rewrite on upsert is adequate).
pub struct FileRecordStore {
    root: PathBuf,
    next_id: AtomicI64,
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create record store dir {}", root.display()))?;
        Ok(Self {
            root,
            next_id: AtomicI64::new(1),
            write_lock: Mutex::new(()),
        })
    }

    fn records_path(&self, task_id: i64) -> PathBuf {
        self.root.join(format!("task-{task_id}-records.jsonl"))
    }

    fn task_servers_path(&self, task_id: i64) -> PathBuf {
        self.root.join(format!("task-{task_id}-servers.json"))
    }

    fn task_model_path(&self, task_id: i64) -> PathBuf {
        self.root.join(format!("task-{task_id}-model.json"))
    }
}

impl RecordStore for FileRecordStore {
    fn next_record_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn save_record(&self, record: &Record) -> Result<()> {
        let _guard = self.write_lock.lock().expect("record store lock poisoned");
        let path = self.records_path(record.task_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let line = serde_json::to_string(record).context("failed to serialize record")?;
        writeln!(writer, "{line}").context("failed to append record")?;
        writer.flush().context("failed to flush record store")?;
        Ok(())
    }

    fn records_for_task(&self, task_id: i64) -> Result<Vec<Record>> {
        let path = self.records_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut records: Vec<Record> = BufReader::new(file)
            .lines()
            .filter_map(|line| line.ok())
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(&line).context("failed to parse record line"))
            .collect::<Result<_>>()?;
        records.sort_by_key(|r: &Record| r.created_at);
        Ok(records)
    }

    fn upsert_task_server(&self, row: &TaskServer) -> Result<()> {
        let _guard = self.write_lock.lock().expect("record store lock poisoned");
        let path = self.task_servers_path(row.task_id);
        let mut rows: HashMap<i64, TaskServer> = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let existing: Vec<TaskServer> =
                serde_json::from_str(&content).context("failed to parse task-server rows")?;
            existing.into_iter().map(|r| (r.server_id, r)).collect()
        } else {
            HashMap::new()
        };
        rows.insert(row.server_id, row.clone());
        let mut rows: Vec<TaskServer> = rows.into_values().collect();
        rows.sort_by_key(|r| r.server_id);
        atomic_write_json(&path, &rows)
    }

    fn task_servers_for_task(&self, task_id: i64) -> Result<Vec<TaskServer>> {
        let path = self.task_servers_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).context("failed to parse task-server rows")
    }

    fn save_task_model(&self, model: &TaskModel) -> Result<()> {
        let _guard = self.write_lock.lock().expect("record store lock poisoned");
        atomic_write_json(&self.task_model_path(model.id), model)
    }

    fn load_task_model(&self, task_id: i64) -> Result<Option<TaskModel>> {
        let path = self.task_model_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(
            serde_json::from_str(&content).context("failed to parse task model")?,
        ))
    }
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
    {
        let mut f = File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}
