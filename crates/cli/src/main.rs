//! TaskMerge command-line tool.
//!
//! Registers finished worktree tasks, runs merge sessions onto the
//! integration branch, feeds the file timeline from a git hook, and shows
//! tasks, reports and the audit log.

mod tables;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use taskmerge_core::config::EngineConfig;
use taskmerge_core::db::Database;
use taskmerge_core::git::{GitClient, VersionedRepo};
use taskmerge_core::models::{TaskStatus, WorktreeTask};
use taskmerge_core::report::MergeReport;
use taskmerge_core::{MergeOrchestrator, TimelineTracker, WorktreeRegistry};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// TaskMerge command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "taskmerge",
    version,
    about = "Merge parallel worktree builds back into one integration branch"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./taskmerge.toml")]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a merge session.
    Merge {
        /// Merge only these tasks (repeatable). Defaults to every pending task.
        #[arg(long = "task")]
        tasks: Vec<String>,
    },

    /// Register a finished task branch.
    Register {
        /// Task ID.
        task_id: String,

        /// Branch holding the task's commits.
        branch: String,

        /// Worktree the task was built in.
        worktree: PathBuf,

        /// Commit the task branched from. Defaults to the merge base with
        /// the target branch.
        #[arg(long)]
        base: Option<String>,

        /// Merge phase; lower phases merge first.
        #[arg(long, default_value = "0")]
        phase: i64,

        /// Tasks that must merge first (comma separated or repeated).
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },

    /// List registered tasks.
    Tasks {
        /// Filter by status: pending, merged, blocked.
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Git hook entry points.
    Hook {
        #[command(subcommand)]
        action: HookAction,
    },

    /// Show timeline entries for a file after a commit.
    Timeline {
        /// Repository-relative file path.
        file: String,

        /// Reference commit; only later changes are shown.
        #[arg(long)]
        since: String,
    },

    /// Show the report of a merge session.
    Report {
        /// Session ID.
        session: String,
    },

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./taskmerge.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

#[derive(Subcommand, Debug)]
enum HookAction {
    /// Record the commit at HEAD in the file timeline.
    PostCommit {
        /// Repository or worktree the hook runs in.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_init(&output)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_validate(&cli.config)
        }
        _ => {
            let config = load_config(&cli.config)?;
            init_logging(
                cli.log_level
                    .as_deref()
                    .unwrap_or(config.engine.log_level.as_str()),
            );

            match cli.command {
                Commands::Merge { tasks } => cmd_merge(config, tasks).await,
                Commands::Register {
                    task_id,
                    branch,
                    worktree,
                    base,
                    phase,
                    depends_on,
                } => cmd_register(
                    &config,
                    WorktreeTask::new(task_id, branch, worktree, String::new()),
                    base,
                    phase,
                    depends_on,
                ),
                Commands::Tasks { status } => cmd_tasks(&config, status.as_deref()),
                Commands::Hook { action } => cmd_hook(&config, action),
                Commands::Timeline { file, since } => cmd_timeline(&config, &file, &since),
                Commands::Report { session } => cmd_report(&config, &session),
                Commands::Audit { limit } => cmd_audit(&config, limit),
                Commands::Init { .. } | Commands::Validate => unreachable!(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<EngineConfig> {
    EngineConfig::load_and_resolve(path).context("failed to load configuration file")
}

fn open_database(config: &EngineConfig) -> Result<Arc<Database>> {
    let db = Database::open(config).context("failed to open database")?;
    Ok(Arc::new(db))
}

fn open_repository(path: &Path) -> Result<GitClient> {
    GitClient::new(path)
        .with_context(|| format!("failed to open repository at {}", path.display()))
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_merge(config: EngineConfig, tasks: Vec<String>) -> Result<()> {
    let db = open_database(&config)?;
    let repo: Arc<dyn VersionedRepo> = Arc::new(open_repository(&config.engine.repo_path)?);
    let orchestrator = MergeOrchestrator::new(config, db, repo);

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted: stopping after the current task...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let selected = (!tasks.is_empty()).then_some(tasks.as_slice());
    let report = orchestrator
        .run(selected)
        .await
        .context("merge session failed")?;

    tables::print_report(&report);
    Ok(())
}

fn cmd_register(
    config: &EngineConfig,
    mut task: WorktreeTask,
    base: Option<String>,
    phase: i64,
    depends_on: Vec<String>,
) -> Result<()> {
    task.base_commit = match base {
        Some(base) => base,
        None => {
            let repo = open_repository(&config.engine.repo_path)?;
            let target = &config.engine.target_branch;
            let tip = repo
                .resolve_ref(target)
                .with_context(|| format!("target branch '{}' not found", target))?;
            let head = repo
                .resolve_ref(&task.branch_name)
                .with_context(|| format!("task branch '{}' not found", task.branch_name))?;
            repo.merge_base(&tip, &head)
                .context("failed to compute merge base")?
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "'{}' shares no history with '{}'; pass --base",
                        task.branch_name,
                        target
                    )
                })?
        }
    };
    task.phase = phase;
    task.depends_on = depends_on;

    let registry = WorktreeRegistry::new(open_database(config)?);
    registry
        .register(task.clone())
        .context("failed to register task")?;

    println!(
        "Task {} registered (branch {}, base {}, phase {})",
        task.task_id,
        task.branch_name,
        tables::short_sha(&task.base_commit),
        task.phase
    );
    Ok(())
}

fn cmd_tasks(config: &EngineConfig, status: Option<&str>) -> Result<()> {
    let status = match status {
        Some(s) => Some(TaskStatus::from_str_val(s).ok_or_else(|| {
            anyhow::anyhow!("invalid status '{}': use pending, merged or blocked", s)
        })?),
        None => None,
    };

    let registry = WorktreeRegistry::new(open_database(config)?);
    let tasks = registry.list(status).context("failed to list tasks")?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    tables::print_tasks(&tasks);
    println!("{} task(s) shown", tasks.len());
    Ok(())
}

/// Never fails the commit: problems are logged and the hook exits cleanly.
fn cmd_hook(config: &EngineConfig, action: HookAction) -> Result<()> {
    match action {
        HookAction::PostCommit { repo } => {
            let client = match GitClient::new(&repo) {
                Ok(client) => client,
                Err(e) => {
                    warn!(repo = %repo.display(), error = %e, "post-commit hook skipped");
                    return Ok(());
                }
            };
            // Linked worktrees share the hook; only integration commits count.
            let target = &config.engine.target_branch;
            let head = match client.head_commit_on(target) {
                Ok(Some(head)) => head,
                Ok(None) => {
                    debug!(branch = %target, "HEAD is not on the integration branch, not recorded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "post-commit hook could not resolve HEAD");
                    return Ok(());
                }
            };

            let tracker = TimelineTracker::new(
                config.engine.timeline_path(),
                Arc::new(client),
                &config.timeline,
            );
            tracker.record_commit(&head);
            Ok(())
        }
    }
}

fn cmd_timeline(config: &EngineConfig, file: &str, since: &str) -> Result<()> {
    let repo = open_repository(&config.engine.repo_path)?;
    let tracker = TimelineTracker::new(
        config.engine.timeline_path(),
        Arc::new(repo),
        &config.timeline,
    );
    let entries = tracker
        .query_since(file, since)
        .context("failed to query timeline")?;

    if entries.is_empty() {
        println!("No changes to {} after {}.", file, tables::short_sha(since));
        return Ok(());
    }

    tables::print_timeline(&entries);
    println!("{} change(s) shown", entries.len());
    Ok(())
}

fn cmd_report(config: &EngineConfig, session: &str) -> Result<()> {
    let db = open_database(config)?;
    let path = db
        .get_session(session)
        .context("failed to read session")?
        .and_then(|s| s.report_path)
        .map(PathBuf::from)
        .unwrap_or_else(|| MergeReport::path_in(&config.engine.reports_dir(), session));

    if !path.exists() {
        anyhow::bail!("no report found for session '{}'", session);
    }
    let report = MergeReport::load(&path).context("failed to load report")?;

    tables::print_report(&report);
    println!("Report file: {}", path.display());
    Ok(())
}

fn cmd_audit(config: &EngineConfig, limit: u32) -> Result<()> {
    let db = open_database(config)?;
    let entries = db
        .list_audit_log(limit)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    tables::print_audit(&entries);
    println!("{} entries shown", entries.len());
    Ok(())
}

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# TaskMerge Configuration

[engine]
repo_path = "/path/to/repo"
target_branch = "main"
data_dir = ".taskmerge"
log_level = "info"

[merge]
semantic_threshold = 0.6
precedence_kinds = ["imports", "list_tail"]
lock_timeout_ms = 5000
commit_author_name = "taskmerge"
commit_author_email = "merge@taskmerge.local"

[analyzer]
whole_file_patterns = ["**/*.lock", "*.lock", "**/*.min.js"]

[resolver]
# command = "resolve-conflict"
# args = ["--model", "default"]
# api_key_env = "TASKMERGE_API_KEY"
context_lines = 5

[resolver.retry]
max_attempts = 3
base_delay_ms = 1000
timeout_ms = 120000

[repository.retry]
max_attempts = 4
base_delay_ms = 200
timeout_ms = 30000

[timeline]
budget_ms = 250
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Point engine.repo_path at the repository the worktrees come from");
    println!("  2. Optionally configure a resolution agent under [resolver]");
    println!(
        "  3. Validate with: taskmerge validate --config {}",
        output.display()
    );
    println!(
        "  4. Install the hook: echo 'taskmerge --config {} hook post-commit' >> .git/hooks/post-commit",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        EngineConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    let _ = config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => {
            println!("  [OK] All required fields are valid");
        }
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    if GitClient::new(&config.engine.repo_path).is_ok() {
        println!("  [OK] Repository opens");
    } else {
        println!(
            "  [WARN] No repository at {}",
            config.engine.repo_path.display()
        );
    }

    println!();
    println!("Configuration summary:");
    println!("  Repository     : {}", config.engine.repo_path.display());
    println!("  Target branch  : {}", config.engine.target_branch);
    println!("  Data directory : {}", config.engine.data_dir.display());
    println!("  Threshold      : {}", config.merge.semantic_threshold);
    println!("  Lock wait      : {} ms", config.merge.lock_timeout_ms);
    println!(
        "  Resolver agent : {}",
        config.resolver.command.as_deref().unwrap_or("none")
    );
    println!(
        "  Agent API key  : {}",
        match (&config.resolver.api_key_env, &config.resolver.api_key) {
            (None, _) => "not configured",
            (Some(_), Some(_)) => "set",
            (Some(_), None) => "NOT SET",
        }
    );
    println!();
    println!("Configuration is valid.");

    Ok(())
}
