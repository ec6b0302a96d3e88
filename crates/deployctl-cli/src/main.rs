use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use deployctl_core::config::{CliOverrides, DeployctlConfig};
use deployctl_core::engine::{Engine, EngineError, OutputSource, Reporter};
use deployctl_core::repo::RepositoryProvider;
use deployctl_core::sshpool::ExecutorPool;
use deployctl_core::store::{FileRecordStore, RecordStore};
use deployctl_core::types::{Selector, TaskModel, TaskStatus};

mod progress;

use progress::DeployProgress;

#[derive(Parser, Debug)]
#[command(name = "deployctl", version)]
#[command(about = "Multi-host code-deployment orchestrator")]
struct Cli {
    /// Path to the config file (default: `.deployctl.toml` in the workspace root).
    #[arg(long, default_value = ".deployctl.toml")]
    config: PathBuf,

    /// Overrides `engine.max_deploy` from the config file.
    #[arg(long)]
    max_deploy: Option<usize>,

    /// Overrides `engine.max_release_timeout` from the config file (e.g. "30m").
    #[arg(long)]
    max_release_timeout: Option<String>,

    /// Overrides the SSH identity file used for all servers.
    #[arg(long)]
    identity_file: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the config file and print the resolved project/server/engine configuration.
    Plan,
    /// Alias of `plan`, for parity with the teacher's `doctor` diagnostics command.
    Doctor,
    /// Submit a task and stream its output until it finishes.
    Deploy(DeployArgs),
    /// Cancel a live task.
    Stop {
        /// The task id to cancel.
        task_id: i64,
    },
    /// Print a task's current per-server step/status table, or replay it if finished.
    Status {
        /// The task id to inspect.
        task_id: i64,
    },
}

#[derive(clap::Args, Debug)]
struct DeployArgs {
    /// The task id. Must be unique among currently live tasks.
    task_id: i64,
    /// The project id, as configured in `[[projects]]`.
    #[arg(long)]
    project: i64,
    /// The environment id.
    #[arg(long)]
    environment: i64,
    /// Target server ids (repeatable).
    #[arg(long = "server")]
    servers: Vec<i64>,
    /// Checkout an exact tag.
    #[arg(long, conflicts_with_all = ["branch", "commit"])]
    tag: Option<String>,
    /// Checkout a specific commit on a branch (requires `--commit`).
    #[arg(long, requires = "commit")]
    branch: Option<String>,
    /// Commit sha to check out on `--branch`.
    #[arg(long, requires = "branch")]
    commit: Option<String>,
    /// Human-readable task name.
    #[arg(long, default_value = "deploy")]
    name: String,
    /// The initiating user's id, recorded on every command record.
    #[arg(long, default_value_t = 0)]
    user_id: i64,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&self, msg: &str) {
        eprintln!("[warn] {msg}");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let cli_overrides = build_overrides(&cli)?;

    match cli.cmd {
        Commands::Plan | Commands::Doctor => print_plan(&config),
        Commands::Deploy(args) => run_deploy(&config, &cli_overrides, args),
        Commands::Stop { task_id } => run_stop(&config, &cli_overrides, task_id),
        Commands::Status { task_id } => run_status(&config, task_id),
    }
}

fn load_config(path: &PathBuf) -> Result<DeployctlConfig> {
    if path.exists() {
        DeployctlConfig::load_from_file(path)
    } else {
        Ok(DeployctlConfig::default())
    }
}

fn build_overrides(cli: &Cli) -> Result<CliOverrides> {
    let max_release_timeout = cli
        .max_release_timeout
        .as_deref()
        .map(|s| humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}")))
        .transpose()?;
    Ok(CliOverrides {
        max_deploy: cli.max_deploy,
        max_release_timeout,
        identity_file: cli.identity_file.clone(),
    })
}

fn print_plan(config: &DeployctlConfig) -> Result<()> {
    println!("engine.max_deploy: {}", config.engine.max_deploy);
    println!(
        "engine.max_release_timeout: {}",
        humantime::format_duration(config.engine.max_release_timeout)
    );
    println!("record_store_dir: {}", config.record_store_dir.display());
    println!("repo_cache_dir: {}", config.repo_cache_dir.display());
    println!();

    println!("projects:");
    for p in &config.projects {
        println!(
            "  [{}] {} ({:?}) -> {} (enabled={})",
            p.id, p.name, p.repo_kind, p.target_root, p.enabled
        );
    }

    println!("servers:");
    for s in &config.servers {
        println!("  [{}] {} {}@{}:{}", s.id, s.name, s.user, s.host, s.port);
    }

    Ok(())
}

fn build_engine(config: &DeployctlConfig, overrides: &CliOverrides) -> Result<Engine> {
    let store = Arc::new(FileRecordStore::new(&config.record_store_dir)?);
    let pool = Arc::new(ExecutorPool::new()?);
    let repo_provider = Arc::new(RepositoryProvider::new(&config.repo_cache_dir));
    let identity_file = config
        .identity_file(overrides)
        .map(|p| p.to_string_lossy().into_owned());
    Ok(Engine::new(
        config.engine_options(overrides),
        store,
        pool,
        repo_provider,
    )
    .with_reporter(Arc::new(CliReporter))
    .with_identity_file(identity_file))
}

fn build_selector(args: &DeployArgs) -> Result<Selector> {
    if let Some(tag) = &args.tag {
        return Ok(Selector::Tag(tag.clone()));
    }
    if let (Some(branch), Some(commit)) = (&args.branch, &args.commit) {
        return Ok(Selector::Branch {
            branch: branch.clone(),
            commit: commit.clone(),
        });
    }
    bail!("either --tag or both --branch and --commit must be given");
}

fn run_deploy(config: &DeployctlConfig, overrides: &CliOverrides, args: DeployArgs) -> Result<()> {
    let project = config
        .project(args.project)
        .cloned()
        .with_context(|| format!("no project with id {} in config", args.project))?;
    let servers: Vec<_> = args
        .servers
        .iter()
        .map(|id| {
            config
                .server(*id)
                .cloned()
                .with_context(|| format!("no server with id {id} in config"))
        })
        .collect::<Result<_>>()?;
    if servers.is_empty() {
        bail!("at least one --server must be given");
    }
    let selector = build_selector(&args)?;

    let engine = build_engine(config, overrides)?;
    let model = TaskModel {
        id: args.task_id,
        space_id: 0,
        project_id: project.id,
        environment_id: args.environment,
        name: args.name,
        selector,
        servers: args.servers.clone(),
        status: TaskStatus::Audit,
        version: None,
        prev_version: None,
        last_error: None,
    };
    let environment = deployctl_core::types::Environment {
        id: args.environment,
        name: format!("env-{}", args.environment),
        enabled: true,
    };

    engine.start(model, project, environment, servers, args.user_id)?;

    let mut progress = DeployProgress::new();
    match engine.output(args.task_id, |id| format!("server-{id}"))? {
        OutputSource::Live(console) => {
            console.stream(|msg| progress.on_message(&msg));
        }
        OutputSource::Replayed(messages) => {
            for msg in &messages {
                progress.on_message(msg);
            }
        }
    }
    progress.finish();
    Ok(())
}

fn run_stop(config: &DeployctlConfig, overrides: &CliOverrides, task_id: i64) -> Result<()> {
    let engine = build_engine(config, overrides)?;
    match engine.stop(task_id) {
        Ok(()) => {
            println!("task[{task_id}] cancellation requested");
            Ok(())
        }
        Err(EngineError::NotFound) => {
            bail!("部署任务已完成或未创建")
        }
        Err(e) => Err(e.into()),
    }
}

fn run_status(config: &DeployctlConfig, task_id: i64) -> Result<()> {
    let store = FileRecordStore::new(&config.record_store_dir)?;
    if let Some(model) = store.load_task_model(task_id)? {
        println!("task[{task_id}] status: {:?}", model.status);
        if let Some(version) = &model.version {
            println!("version: {version}");
        }
        if let Some(err) = &model.last_error {
            println!("last_error: {err}");
        }
    } else {
        println!("task[{task_id}] has no persisted model yet");
    }

    let rows = store.task_servers_for_task(task_id)?;
    if rows.is_empty() {
        println!("no per-server outcomes recorded yet");
    } else {
        println!("per-server outcomes:");
        for row in rows {
            match row.error {
                Some(err) => println!("  server[{}]: {:?} ({err})", row.server_id, row.status),
                None => println!("  server[{}]: {:?}", row.server_id, row.status),
            }
        }
    }
    Ok(())
}
