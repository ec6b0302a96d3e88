//! # deployctl-core
//!
//! The engine behind `deployctl`: a multi-host code-deployment orchestrator.
//!
//! Given a project's repository, a target environment, and the servers in
//! it, deployctl checks out a version locally, packages it, ships it to
//! every target server, and swaps a symlink to activate it atomically — then
//! runs post-release hooks. Each run is a [`task::Task`] driven through a
//! fixed six-stage pipeline; the [`engine::Engine`] is the task registry
//! that admits, tracks, and cancels them.
//!
//! ## Pipeline
//!
//! 1. **prev-deploy** (local) — `pre_deploy` hook.
//! 2. **deploy** (local) — checkout the selected tag/branch+commit, copy the
//!    working tree into a versioned warehouse directory.
//! 3. **post-deploy** (local) — `post_deploy` hook, then archive the
//!    warehouse into a `.tar.gz`.
//! 4. **pre-release** (per server, parallel) — upload and untar the archive,
//!    then a `pre_release` hook.
//! 5. **release** (per server, parallel) — `readlink` the current target,
//!    `ln -s` the new release into a tmp path, `mv` it over the activation
//!    symlink. This is the atomic swap; [`task::Task`] records the previous
//!    target so a future rollback task can restore it.
//! 6. **post-release** (per server, parallel) — `post_release` hook.
//!
//! Stages 1-3 run sequentially on the control host. Stages 4-6 run in
//! parallel across servers, sequentially within each server.
//!
//! ## Modules
//!
//! - [`types`] — domain model: projects, servers, tasks, records.
//! - [`buffer`] — the Overflow Buffer, an append-only byte log backing live
//!   command output.
//! - [`record`] — the Command Record: runs one local or remote command,
//!   streaming its output into an Overflow Buffer and persisting the result.
//! - [`sshpool`] — a refcounted pool of SSH sessions, one per server.
//! - [`repo`] — the Repository Provider: git checkout with per-project
//!   serialization so concurrent tasks on the same repo don't race.
//! - [`store`] — the Record Store: persistence for command records, task
//!   outcomes, and task model snapshots.
//! - [`console`] — multiplexes live Overflow Buffers into one ordered
//!   stream, and replays a finished task's records from the Record Store.
//! - [`task`] — the Task state machine: the six-stage pipeline itself.
//! - [`engine`] — the Deploy Engine: admission control and the task
//!   registry.
//! - [`config`] — `.deployctl.toml` loading and CLI-override merging.

pub mod buffer;
pub mod config;
pub mod console;
pub mod engine;
pub mod record;
pub mod repo;
pub mod sshpool;
pub mod store;
pub mod task;
pub mod types;

/// Configurable retry strategies with backoff and jitter, re-exported from
/// the `deployctl-retry` microcrate.
pub use deployctl_retry as retry;
