use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use siteback::cli::{prompt::TerminalPrompt, render};
use siteback::config::AppConfig;
use siteback::context::AppContext;
use siteback::core::models::{BackupMode, BackupSet};
use siteback::core::remote::ssh::SshConnector;
use siteback::core::{LocalRunner, Orchestrator, ProcedureRunner, RestoreRequest, SessionRunner, SiteTarget, progress};
use siteback::{Error, db, logging};

#[derive(Parser)]
#[command(name = "siteback")]
#[command(about = "Create, fetch and restore site backup sets over SSH", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./siteback.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    storage_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    concurrency: Option<usize>,
}

#[derive(Args)]
struct SiteArgs {
    /// Endpoint name from the configuration; omit to work on this machine
    #[arg(long)]
    host: Option<String>,

    /// Bench directory on that host
    #[arg(long)]
    bench: PathBuf,

    #[arg(long)]
    site: String,
}

impl SiteArgs {
    fn target(&self) -> SiteTarget {
        SiteTarget::new(&self.bench, &self.site)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Database,
    Files,
    Complete,
}

impl From<ModeArg> for BackupMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Database => BackupMode::Database,
            ModeArg::Files => BackupMode::Files,
            ModeArg::Complete => BackupMode::Complete,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every configured endpoint and report its health
    Hosts,
    /// Search a host for bench directories
    Benches {
        #[arg(long)]
        host: Option<String>,
    },
    /// List sites in a bench, or in every bench found when --bench is omitted
    Sites {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        bench: Option<PathBuf>,
    },
    /// List backup sets of a site
    Sets(SiteArgs),
    /// List backup sets in local storage
    LocalSets,
    /// Create a backup on the host
    Create {
        #[command(flatten)]
        site: SiteArgs,
        #[arg(long, value_enum, default_value = "complete")]
        mode: ModeArg,
        /// Download the new set afterwards
        #[arg(long)]
        download: bool,
    },
    /// Download a backup set, the newest unless --set is given
    Download {
        #[command(flatten)]
        site: SiteArgs,
        /// Set timestamp, e.g. 20250909_143022
        #[arg(long)]
        set: Option<String>,
    },
    /// Restore a local backup set onto a site
    Restore {
        #[command(flatten)]
        site: SiteArgs,
        /// Set timestamp, e.g. 20250909_143022
        #[arg(long)]
        set: String,
        /// Origin token, when several local sets share the timestamp
        #[arg(long)]
        origin: Option<String>,
        /// Overwrite an existing site
        #[arg(long)]
        yes: bool,
        /// Skip re-hashing local files against recorded digests
        #[arg(long)]
        no_verify: bool,
        #[arg(long)]
        db_root_user: Option<String>,
        /// Create the site when it does not exist (admin password from SITEBACK_ADMIN_PASSWORD)
        #[arg(long)]
        create_site: bool,
    },
    /// Delete a backup set from the host
    Delete {
        #[command(flatten)]
        site: SiteArgs,
        /// Set timestamp, e.g. 20250909_143022
        #[arg(long)]
        set: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Delete all but the newest local sets
    Prune {
        /// Sets to keep (default: keep_local_sets from the configuration)
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Show which indexed sets are present locally
    Status,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        AppConfig::load(cli.config.as_deref(), Some(&cli.overrides)).context("Failed to load configuration")?;
    config.log.verbose |= cli.verbose;
    config.log.json |= cli.json_logs;
    logging::init((&config.log).into());

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    let connector = SshConnector::new(
        Duration::from_secs(config.timeouts.connect_secs),
        Duration::from_secs(config.session.keepalive_secs),
    )
    .with_prompt(Arc::new(TerminalPrompt));
    let db_conn = db::init(&config.index_path())
        .await
        .context("Failed to open backup index")?;
    let ctx = AppContext::new(config, db_conn, Arc::new(connector));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping; transfers resume on the next run");
                cancel.cancel();
            }
        }
    });

    let (progress_tx, progress_rx) = progress::channel(ctx.config.progress.capacity, ctx.config.progress_interval());
    let tracker = ctx.progress.clone();
    let printer = tokio::spawn(async move {
        tracker
            .consume(progress_rx, |event| eprintln!("{}", render::progress_line(event)))
            .await
    });

    let orchestrator = Orchestrator::new(ctx.clone()).with_progress(progress_tx);
    let result = run(cli.command, &orchestrator, &ctx, &cancel).await;

    // Last sender gone: the printer drains and exits.
    drop(orchestrator);
    let _ = printer.await;
    ctx.sessions.close_all().await;
    result
}

fn runner_for(ctx: &AppContext, host: Option<&str>) -> Result<Arc<dyn ProcedureRunner>> {
    match host {
        None => Ok(Arc::new(LocalRunner)),
        Some(name) => {
            let endpoint = ctx.config.endpoint(name)?.clone();
            Ok(Arc::new(SessionRunner::new(Arc::clone(&ctx.sessions), endpoint)))
        }
    }
}

fn pick_set(sets: Vec<BackupSet>, timestamp: Option<&str>, origin: Option<&str>) -> Result<BackupSet> {
    let mut matching: Vec<BackupSet> = sets
        .into_iter()
        .filter(|s| timestamp.is_none_or(|t| s.key().timestamp == t))
        .filter(|s| origin.is_none_or(|o| s.key().origin == o))
        .collect();

    if timestamp.is_some() && matching.len() > 1 {
        let origins: Vec<&str> = matching.iter().map(|s| s.key().origin.as_str()).collect();
        bail!("several sets match, pick one with --origin: {}", origins.join(", "));
    }
    if matching.is_empty() {
        bail!("no matching backup set");
    }
    Ok(matching.remove(0))
}

async fn run(command: Commands, orchestrator: &Orchestrator, ctx: &AppContext, cancel: &CancellationToken) -> Result<()> {
    match command {
        Commands::Hosts => {
            if ctx.config.endpoints.is_empty() {
                println!("No endpoints configured.");
            }
            for endpoint in &ctx.config.endpoints {
                let status = match ctx.sessions.connect(endpoint).await {
                    Ok(session) if ctx.sessions.health_check(&session).await => "ok".to_string(),
                    Ok(_) => "connected but unresponsive".to_string(),
                    Err(e @ Error::Authentication { .. }) => format!("check credentials: {e}"),
                    Err(e @ Error::Unreachable { .. }) => format!("check network: {e}"),
                    Err(e) => e.to_string(),
                };
                println!("{endpoint}  {status}");
            }
        }
        Commands::Benches { host } => {
            let runner = runner_for(ctx, host.as_deref())?;
            let benches = orchestrator.find_benches(runner.as_ref(), cancel).await?;
            if benches.is_empty() {
                println!("No benches found on {}.", runner.describe());
            }
            for bench in benches {
                println!("{}", bench.display());
            }
        }
        Commands::Sites { host, bench } => {
            let runner = runner_for(ctx, host.as_deref())?;
            match bench {
                Some(bench) => {
                    for site in orchestrator.list_sites(runner.as_ref(), &bench, cancel).await? {
                        println!("{site}");
                    }
                }
                None => {
                    for bench in orchestrator.find_benches(runner.as_ref(), cancel).await? {
                        for site in orchestrator.list_sites(runner.as_ref(), &bench, cancel).await? {
                            println!("{}  {site}", bench.display());
                        }
                    }
                }
            }
        }
        Commands::Sets(site) => {
            let runner = runner_for(ctx, site.host.as_deref())?;
            let grouping = orchestrator.list_sets(runner.as_ref(), &site.target()).await?;
            print!("{}", render::grouping(&grouping));
        }
        Commands::LocalSets => {
            let grouping = orchestrator.list_local_sets().await?;
            print!("{}", render::grouping(&grouping));
        }
        Commands::Create { site, mode, download } => {
            let runner = runner_for(ctx, site.host.as_deref())?;
            let set = orchestrator
                .create_backup(runner.as_ref(), &site.target(), mode.into(), cancel)
                .await
                .context("Backup creation failed")?;
            println!("Created {}", render::set_summary(&set));
            if download {
                let report = orchestrator.download_set(runner, &set, cancel).await?;
                print!("{}", render::transfer_report(&report));
                if !report.is_complete() {
                    bail!("set {} is not completely downloaded; re-run to fetch the rest", report.key);
                }
            }
        }
        Commands::Download { site, set } => {
            let runner = runner_for(ctx, site.host.as_deref())?;
            let grouping = orchestrator.list_sets(runner.as_ref(), &site.target()).await?;
            let chosen = pick_set(grouping.sets, set.as_deref(), None)?;
            let report = orchestrator.download_set(runner, &chosen, cancel).await?;
            print!("{}", render::transfer_report(&report));
            if report.cancelled() {
                bail!("download cancelled; re-run to resume");
            }
            if !report.is_complete() {
                bail!("set {} is only {}; re-run to fetch the rest", report.key, report.presence.as_str());
            }
        }
        Commands::Restore {
            site,
            set,
            origin,
            yes,
            no_verify,
            db_root_user,
            create_site,
        } => {
            let runner = runner_for(ctx, site.host.as_deref())?;
            let local = orchestrator.list_local_sets().await?;
            let chosen = pick_set(local.sets, Some(set.as_str()), origin.as_deref())?;

            let mut request = RestoreRequest::new(site.target());
            request.overwrite_confirmed = yes;
            request.verify = !no_verify;
            request.db_root_user = db_root_user;
            request.db_root_password = std::env::var("SITEBACK_DB_ROOT_PASSWORD").ok();
            request.create_site = create_site;
            request.admin_password = std::env::var("SITEBACK_ADMIN_PASSWORD").ok();

            let report = orchestrator
                .restore_set(runner, &chosen, &request, cancel)
                .await
                .context("Restore failed")?;
            print!("{}", render::restore_report(&report));
        }
        Commands::Delete { site, set, yes } => {
            let runner = runner_for(ctx, site.host.as_deref())?;
            let grouping = orchestrator.list_sets(runner.as_ref(), &site.target()).await?;
            let chosen = pick_set(grouping.sets, Some(set.as_str()), None)?;
            if !yes {
                bail!("deleting {} on {} needs --yes", chosen.key(), runner.describe());
            }
            orchestrator.delete_remote_set(runner.as_ref(), &chosen, cancel).await?;
            println!("Deleted {}", render::set_summary(&chosen));
        }
        Commands::Prune { keep } => {
            let keep = keep.unwrap_or(ctx.config.keep_local_sets);
            let report = orchestrator.prune_local(keep).await?;
            print!("{}", render::prune_report(&report));
        }
        Commands::Status => {
            let sets = orchestrator.index_status().await?;
            print!("{}", render::index_status(&sets));
        }
        Commands::Config => {}
    }
    Ok(())
}
