//! Repository Provider: an abstract source cache used by the Task pipeline
//! to ensure a working copy exists and can be checked out to a tag or
//! (branch, commit).
//!
//! Grounded on the shell-out-to-`git` pattern in the upstream `git.rs`
//! (command construction, `GIT_BIN`-style override, fake-binary test
//! harness) plus the per-key serialization discipline in `lock.rs`.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};

use crate::types::{RepoKind, Selector};

/// Abstract contract consumed by the Task pipeline (spec §4.4).
pub trait Repo: Send + Sync {
    fn path(&self) -> &Path;
    fn checkout_to_tag(&self, tag: &str) -> Result<()>;
    fn checkout_to_commit(&self, branch: &str, commit: &str) -> Result<()>;
    fn branches(&self) -> Result<Vec<String>>;
    fn tags(&self) -> Result<Vec<String>>;
    fn commits(&self, branch: &str) -> Result<Vec<String>>;

    fn checkout(&self, selector: &Selector) -> Result<()> {
        match selector {
            Selector::Tag(tag) => self.checkout_to_tag(tag),
            Selector::Branch { branch, commit } => self.checkout_to_commit(branch, commit),
        }
    }
}

/// Registry of local working copies keyed by `localKey`, serializing at
/// most one checkout per key at a time (spec §4.4 thread-safety contract).
#[derive(Default)]
pub struct RepositoryProvider {
    base_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepositoryProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a `Repo` handle for `local_key`, cloning/fetching it into
    /// the stable local cache path if it doesn't already exist. The
    /// returned guard holds the per-key lock for its lifetime so that
    /// concurrent calls for the same key serialize.
    pub fn open(&self, kind: RepoKind, url: &str, local_key: &str) -> Result<GitRepo> {
        let key_lock = {
            let mut locks = self.locks.lock().expect("repo provider lock poisoned");
            Arc::clone(
                locks
                    .entry(local_key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        // Held for the lifetime of the returned GitRepo via an owned MutexGuard
        // would require self-referential storage; instead we take the lock
        // only around the ensure step, matching the spec's requirement that
        // *checkout operations* (not the whole session) serialize per key.
        let _guard = key_lock.lock().expect("per-repo lock poisoned");

        if kind != RepoKind::Git {
            bail!("only git repositories are supported by this provider");
        }

        let path = self.base_dir.join(local_key);
        if !path.join(".git").exists() {
            std::fs::create_dir_all(&self.base_dir).context("failed to create repo cache dir")?;
            run_git(&self.base_dir, ["clone", url, local_key])
                .with_context(|| format!("failed to clone {url} into {}", path.display()))?;
        } else {
            run_git(&path, ["fetch", "--all", "--tags"])
                .with_context(|| format!("failed to fetch updates for {}", path.display()))?;
        }
        drop(_guard);

        Ok(GitRepo {
            path,
            key_lock,
        })
    }
}

/// A checked-out git working copy. Serializes checkout operations against
/// other `GitRepo` handles for the same `localKey`.
pub struct GitRepo {
    path: PathBuf,
    key_lock: Arc<Mutex<()>>,
}

impl Repo for GitRepo {
    fn path(&self) -> &Path {
        &self.path
    }

    fn checkout_to_tag(&self, tag: &str) -> Result<()> {
        let _guard = self.key_lock.lock().expect("per-repo lock poisoned");
        run_git(&self.path, ["checkout", "--force", tag])
            .with_context(|| format!("failed to checkout tag {tag}"))
    }

    fn checkout_to_commit(&self, branch: &str, commit: &str) -> Result<()> {
        let _guard = self.key_lock.lock().expect("per-repo lock poisoned");
        run_git(&self.path, ["checkout", "--force", branch])
            .with_context(|| format!("failed to checkout branch {branch}"))?;
        run_git(&self.path, ["reset", "--hard", commit])
            .with_context(|| format!("failed to reset to commit {commit}"))
    }

    fn branches(&self) -> Result<Vec<String>> {
        let out = git_output(&self.path, ["branch", "-r", "--format=%(refname:short)"])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    fn tags(&self) -> Result<Vec<String>> {
        let out = git_output(&self.path, ["tag", "--list"])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    fn commits(&self, branch: &str) -> Result<Vec<String>> {
        let out = git_output(&self.path, ["log", branch, "--format=%H", "-n", "200"])?;
        Ok(out.lines().map(str::to_string).collect())
    }
}

fn git_program() -> String {
    env::var("DEPLOYCTL_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn run_git<'a>(cwd: &Path, args: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let out = Command::new(git_program())
        .args(args)
        .current_dir(cwd)
        .output()
        .context("failed to execute git; is git installed?")?;
    if !out.status.success() {
        bail!(
            "git command failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

fn git_output<'a>(cwd: &Path, args: impl IntoIterator<Item = &'a str>) -> Result<String> {
    let out = Command::new(git_program())
        .args(args)
        .current_dir(cwd)
        .output()
        .context("failed to execute git; is git installed?")?;
    if !out.status.success() {
        bail!(
            "git command failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}
