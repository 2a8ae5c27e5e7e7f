//! Thin command-line surface over the router, supervisor and scheduler entry
//! points. Exit code 0 on success, non-zero on error; errors go to stderr,
//! and `serve` keeps stdout clean for the protocol.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::catalog::{Catalog, read_csv_index};
use crate::config::{Paths, Profile, load_profile, profile_hash};
use crate::discovery::DiscoveryEngine;
use crate::router::{Confirmer, Depth, FindParams, NoChannel, Router};
use crate::scheduler::{JobSpec, JobStatus, Scheduler, detect_system_timezone, parse_schedule};
use crate::supervisor::{HealthState, Supervisor};

#[derive(Parser)]
#[command(name = "patchbay", version)]
#[command(about = "Aggregating MCP proxy: one compact find/run surface over many tool servers")]
pub struct Cli {
    /// Profile to serve (profiles/<name>.json under the state directory)
    #[arg(long, global = true, default_value = "default")]
    profile: String,

    /// Skip loading the embedding model (keyword ranking only)
    #[arg(long, global = true)]
    no_model: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP server for an upstream client on stdio
    Serve {
        /// Reset all retry backoff timers before starting
        #[arg(long)]
        force_retry: bool,
    },
    /// Search every connected server with a natural-language description
    Find {
        description: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long)]
        page: Option<usize>,
        /// names, descriptions or schemas
        #[arg(long)]
        depth: Option<Depth>,
        /// Minimum confidence in [0,1]
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Invoke a tool by its server:tool id
    Run {
        tool: String,
        /// JSON object of tool arguments
        #[arg(long, default_value = "{}")]
        params: String,
        /// Approve modifying tools without asking
        #[arg(long)]
        yes: bool,
    },
    /// List cached tools without spawning any server
    Tools {
        #[arg(long)]
        server: Option<String>,
    },
    /// Show per-server health and configuration hints
    Status,
    /// Enable or disable (quarantine) a server
    Server {
        #[command(subcommand)]
        cmd: ServerCommands,
    },
    /// Manage scheduled jobs
    Schedule {
        #[command(subcommand)]
        cmd: ScheduleCommands,
    },
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Clear quarantine and error counters
    Enable { name: String },
    /// Quarantine a server so it receives no dispatches
    Disable {
        name: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Create a job
    Add {
        name: String,
        /// Tool id, e.g. filesystem:read_file
        tool: String,
        /// 5-field cron, RFC-3339 timestamp, or 'every day at 9am'
        #[arg(long)]
        schedule: String,
        /// JSON object of tool arguments
        #[arg(long, default_value = "{}")]
        params: String,
        /// IANA timezone for cron schedules (default UTC)
        #[arg(long)]
        tz: Option<String>,
        #[arg(long)]
        max_executions: Option<u32>,
        /// Stop after this RFC-3339 instant
        #[arg(long)]
        end_at: Option<String>,
        /// Stop after this long, e.g. '30d' or '12h'
        #[arg(long)]
        end_in: Option<String>,
        /// Fire exactly once, then complete
        #[arg(long)]
        once: bool,
        #[arg(long)]
        description: Option<String>,
    },
    /// List jobs
    List {
        /// Include completed and errored jobs
        #[arg(long, short = 'a')]
        all: bool,
    },
    /// Show one job
    Get { id: String },
    Pause { id: String },
    Resume { id: String },
    Delete { id: String },
    /// Fire a job immediately through the normal execution path
    Run { id: String },
    /// Show execution history
    History {
        #[arg(long)]
        job: Option<String>,
    },
    /// Prune old execution records
    Cleanup,
}

/// An always-approving confirmer for `run --yes`.
struct ApproveAll;

#[async_trait::async_trait]
impl Confirmer for ApproveAll {
    async fn confirm(&self, _tool_id: &str, _description: &str) -> crate::router::ConfirmOutcome {
        crate::router::ConfirmOutcome::Approved
    }
}

struct Stack {
    profile: Arc<Profile>,
    supervisor: Arc<Supervisor>,
    catalog: Arc<Catalog>,
    discovery: Arc<DiscoveryEngine>,
    router: Arc<Router>,
}

fn build_stack(
    profile_name: &str,
    paths: &Paths,
    no_model: bool,
    confirmer: Arc<dyn Confirmer>,
) -> Result<Stack> {
    let profile = Arc::new(load_profile(paths, profile_name)?);
    let supervisor = Arc::new(Supervisor::new(profile.clone(), paths.clone()));
    let catalog = Arc::new(Catalog::new(profile.clone(), paths.clone()));
    let discovery = if no_model {
        Arc::new(DiscoveryEngine::without_model(
            profile.settings.clone(),
            paths.clone(),
        ))
    } else {
        Arc::new(DiscoveryEngine::new(profile.settings.clone(), paths.clone()))
    };
    let router = Arc::new(Router::new(
        supervisor.clone(),
        catalog.clone(),
        discovery.clone(),
        confirmer,
    ));
    Ok(Stack {
        profile,
        supervisor,
        catalog,
        discovery,
        router,
    })
}

/// Bring catalog and index up to date, rebuilding only when stale.
async fn ensure_indexed(stack: &Stack) -> Result<()> {
    if !stack.catalog.load_cached() {
        stack.catalog.rebuild(&stack.supervisor, "cache stale").await;
    }
    stack
        .discovery
        .index_catalog(&stack.catalog.snapshot(), &profile_hash(&stack.profile))
        .await?;
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = Paths::resolve()?;
    paths.ensure_layout()?;

    match cli.command {
        Commands::Serve { force_retry } => serve(&cli.profile, &paths, cli.no_model, force_retry).await,
        Commands::Find {
            description,
            limit,
            page,
            depth,
            threshold,
        } => {
            let stack = build_stack(&cli.profile, &paths, cli.no_model, Arc::new(NoChannel))?;
            ensure_indexed(&stack).await?;
            let text = stack
                .router
                .find(FindParams {
                    description,
                    limit: Some(limit),
                    page,
                    depth,
                    confidence_threshold: threshold,
                })
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("{}", text);
            stack.supervisor.stop_all().await;
            Ok(())
        }
        Commands::Run { tool, params, yes } => {
            let confirmer: Arc<dyn Confirmer> = if yes {
                Arc::new(ApproveAll)
            } else {
                Arc::new(NoChannel)
            };
            let stack = build_stack(&cli.profile, &paths, cli.no_model, confirmer)?;
            ensure_indexed(&stack).await?;
            let arguments: Value =
                serde_json::from_str(&params).context("--params must be a JSON object")?;
            let outcome = stack.router.run(&tool, arguments).await;
            stack.supervisor.stop_all().await;
            match outcome {
                Ok(result) => {
                    let text = result
                        .pointer("/content/0/text")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            serde_json::to_string_pretty(&result).unwrap_or_default()
                        });
                    if result.get("isError").and_then(Value::as_bool) == Some(true) {
                        bail!("tool reported an error:\n{}", text);
                    }
                    println!("{}", text);
                    Ok(())
                }
                Err(run_err) => {
                    if !run_err.suggestions.is_empty() {
                        eprintln!("Did you mean:");
                        for suggestion in &run_err.suggestions {
                            eprintln!(
                                "  {}  ({:.0}%)",
                                suggestion.tool_id,
                                suggestion.confidence * 100.0
                            );
                        }
                    }
                    bail!("{}: {}", run_err.error.kind(), run_err.error)
                }
            }
        }
        Commands::Tools { server } => {
            let mut rows = read_csv_index(&paths);
            if rows.is_empty() {
                // Cold cache: probe, persist, then list.
                let stack = build_stack(&cli.profile, &paths, true, Arc::new(NoChannel))?;
                stack.catalog.rebuild(&stack.supervisor, "tools listing").await;
                stack.supervisor.stop_all().await;
                rows = read_csv_index(&paths);
            }
            if let Some(server) = server {
                rows.retain(|(s, _, _)| *s == server);
            }
            for (server, tool, description) in &rows {
                println!("{}:{}  {}", server, tool, description);
            }
            if rows.is_empty() {
                eprintln!("no tools cached; is the profile configured?");
            }
            Ok(())
        }
        Commands::Status => {
            let stack = build_stack(&cli.profile, &paths, true, Arc::new(NoChannel))?;
            if stack.profile.servers.is_empty() {
                println!("profile '{}' has no servers", stack.profile.name);
                return Ok(());
            }
            for (name, record) in stack.supervisor.health_report() {
                print!("{:<24} {}", name, record.state);
                if record.error_count > 0 || record.cumulative_errors > 0 {
                    print!(
                        "  errors: {} consecutive / {} total",
                        record.error_count, record.cumulative_errors
                    );
                }
                if let Some(reason) = &record.disabled_reason {
                    print!("  ({})", reason);
                }
                if let Some(error) = &record.last_error {
                    print!("  last: {}", error);
                }
                println!();
                if record.state != HealthState::Healthy {
                    for hint in stack.supervisor.config_hints(&name).await {
                        println!("{:<24}   hint: {}", "", hint);
                    }
                }
            }
            Ok(())
        }
        Commands::Server { cmd } => {
            let stack = build_stack(&cli.profile, &paths, true, Arc::new(NoChannel))?;
            match cmd {
                ServerCommands::Enable { name } => {
                    require_server(&stack.profile, &name)?;
                    stack.supervisor.set_enabled(&name, true, None);
                    println!("server '{}' enabled", name);
                }
                ServerCommands::Disable { name, reason } => {
                    require_server(&stack.profile, &name)?;
                    stack.supervisor.set_enabled(&name, false, reason);
                    println!("server '{}' disabled", name);
                }
            }
            Ok(())
        }
        Commands::Schedule { cmd } => schedule_command(&cli.profile, &paths, cli.no_model, cmd).await,
    }
}

fn require_server(profile: &Profile, name: &str) -> Result<()> {
    if !profile.servers.contains_key(name) {
        bail!("no server named '{}' in profile '{}'", name, profile.name);
    }
    Ok(())
}

async fn serve(profile_name: &str, paths: &Paths, no_model: bool, force_retry: bool) -> Result<()> {
    let stack = build_stack(profile_name, paths, no_model, Arc::new(NoChannel))?;
    if force_retry {
        stack.supervisor.force_retry().await;
    }
    info!(
        "serving profile '{}' with {} servers",
        stack.profile.name,
        stack.profile.servers.len()
    );

    // The session must accept requests immediately: serve from the persisted
    // cache when it is authoritative and do all probing/embedding work in the
    // background.
    let cache_ok = stack.catalog.load_cached();
    {
        let supervisor = stack.supervisor.clone();
        let catalog = stack.catalog.clone();
        let discovery = stack.discovery.clone();
        let hash = profile_hash(&stack.profile);
        tokio::spawn(async move {
            if !cache_ok {
                catalog.rebuild(&supervisor, "startup").await;
            }
            if let Err(e) = discovery.index_catalog(&catalog.snapshot(), &hash).await {
                tracing::warn!("background indexing failed: {}", e);
            }
        });
    }

    let scheduler = Arc::new(Scheduler::new(stack.router.clone(), paths.clone()));
    let scheduler_handle = tokio::spawn(scheduler.clone().run_loop());

    let session = stack.router.clone().serve_stdio();
    tokio::select! {
        result = session => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }

    scheduler.shutdown();
    let _ = scheduler_handle.await;
    stack.supervisor.stop_all().await;
    Ok(())
}

async fn schedule_command(
    profile_name: &str,
    paths: &Paths,
    no_model: bool,
    cmd: ScheduleCommands,
) -> Result<()> {
    // Job CRUD only needs the store; `schedule run` needs a live catalog too.
    let needs_catalog = matches!(cmd, ScheduleCommands::Run { .. });
    let stack = build_stack(profile_name, paths, no_model || !needs_catalog, Arc::new(NoChannel))?;
    if needs_catalog {
        ensure_indexed(&stack).await?;
    }
    let scheduler = Arc::new(Scheduler::new(stack.router.clone(), paths.clone()));

    match cmd {
        ScheduleCommands::Add {
            name,
            tool,
            schedule,
            params,
            tz,
            max_executions,
            end_at,
            end_in,
            once,
            description,
        } => {
            let parameters: Value =
                serde_json::from_str(&params).context("--params must be a JSON object")?;
            // Cron schedules default to the machine's timezone, not UTC.
            let tz = tz.or_else(detect_system_timezone);
            let schedule = parse_schedule(&schedule, tz)?;
            let end_at = match (end_at, end_in) {
                (Some(at), _) => Some(
                    chrono::DateTime::parse_from_rfc3339(&at)
                        .context("--end-at must be RFC-3339")?
                        .with_timezone(&chrono::Utc),
                ),
                (None, Some(duration)) => {
                    let duration = humantime::parse_duration(&duration)
                        .context("--end-in must be a duration like '30d'")?;
                    Some(chrono::Utc::now() + chrono::Duration::from_std(duration)?)
                }
                (None, None) => None,
            };
            let job = scheduler
                .create_job(JobSpec {
                    name,
                    tool_id: tool,
                    parameters,
                    schedule,
                    max_executions,
                    end_at,
                    fire_once: once,
                    description,
                })
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("created job '{}' ({})", job.name, job.id);
            if let Some(next) = job.next_fire_at {
                println!("next fire: {}", next.to_rfc3339());
            }
            Ok(())
        }
        ScheduleCommands::List { all } => {
            let mut jobs = scheduler.list_jobs();
            if !all {
                jobs.retain(|j| matches!(j.status, JobStatus::Active | JobStatus::Paused));
            }
            if jobs.is_empty() {
                println!("no jobs");
                return Ok(());
            }
            for job in jobs {
                let next = job
                    .next_fire_at
                    .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
                println!(
                    "{}  {:<20} {:<9} runs:{:<4} next:{}  {}",
                    job.id, job.name, format!("{:?}", job.status).to_lowercase(), job.execution_count, next, job.tool_id
                );
            }
            Ok(())
        }
        ScheduleCommands::Get { id } => {
            let job = scheduler.get_job(&id).map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        ScheduleCommands::Pause { id } => {
            let job = scheduler.pause_job(&id).map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("paused '{}'", job.name);
            Ok(())
        }
        ScheduleCommands::Resume { id } => {
            let job = scheduler.resume_job(&id).map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("resumed '{}'", job.name);
            Ok(())
        }
        ScheduleCommands::Delete { id } => {
            let job = scheduler.delete_job(&id).map_err(|e| anyhow::anyhow!("{}", e))?;
            println!("deleted '{}'", job.name);
            Ok(())
        }
        ScheduleCommands::Run { id } => {
            let record = scheduler
                .run_job_now(&id)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            stack.supervisor.stop_all().await;
            match record.error_message {
                Some(error) => bail!("execution {:?}: {}", record.status, error),
                None => {
                    println!(
                        "execution {:?} in {}ms",
                        record.status,
                        record.duration_ms.unwrap_or(0)
                    );
                    if let Some(summary) = record.result_summary {
                        println!("{}", summary);
                    }
                    Ok(())
                }
            }
        }
        ScheduleCommands::History { job } => {
            let records = scheduler.store().load_executions(job.as_deref());
            if records.is_empty() {
                println!("no executions recorded");
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {:<20} {:<8} {}ms  {}",
                    record.started_at.to_rfc3339(),
                    record.job_name,
                    format!("{:?}", record.status).to_lowercase(),
                    record.duration_ms.unwrap_or(0),
                    record.error_message.unwrap_or_default()
                );
            }
            Ok(())
        }
        ScheduleCommands::Cleanup => {
            let report = scheduler.cleanup();
            println!(
                "removed {} expired and {} over-cap execution records",
                report.removed_by_age, report.removed_by_cap
            );
            Ok(())
        }
    }
}
