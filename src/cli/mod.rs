//! Command-line interface for truthweave.
//!
//! Provides commands for running the worker, processing single articles,
//! sending causal signals, inspecting and resuming runs, and serving the feed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::{
    AdStore, ArticleStore, GdeltDiscovery, GeminiClient, HttpExtractor, SqliteArticleStore,
    SqliteKnowledgeGraph,
};
use crate::config::{self, ResolvedConfig};
use crate::core::{ActivityRegistry, Collaborators, SignalInbox, WorkflowHost};
use crate::domain::feed::{interleave, AD_INTERVAL};
use crate::domain::{
    AdKind, Advertisement, FeedItem, IngestSignal, ProcessingRequest, RebalanceRequest, Run,
    RunState, WorkflowId, WorkflowKind,
};
use crate::workflows::{causal_chain, pipeline, rebalancer, IngestionScheduler};

/// Ads considered per feed page
const FEED_AD_LIMIT: usize = 5;

/// truthweave - durable news analysis and causal graph worker
#[derive(Parser, Debug)]
#[command(name = "truthweave")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler and the causal chain processor until Ctrl-C
    Worker {
        /// Skip periodic discovery; only process signals
        #[arg(long)]
        no_scheduler: bool,

        /// Read article URLs from stdin (one per line) as causal signals
        #[arg(long)]
        stdin_signals: bool,
    },

    /// Run the analysis pipeline for one article
    Process {
        /// Article URL
        url: String,
    },

    /// Run one discovery cycle and wait for its pipelines
    Cycle,

    /// Queue a causal signal for the worker
    Signal {
        /// Article URL
        url: String,

        /// Where the signal came from
        #[arg(short, long, default_value = "cli")]
        source: String,
    },

    /// Show signal inbox counts
    Inbox,

    /// Ask whether an existing event is a consequence of candidate events
    Rebalance {
        /// Event to attach
        #[arg(short, long)]
        target: String,

        /// JSON file with a list of {id, title, summary}
        #[arg(short, long)]
        candidates: PathBuf,
    },

    /// Check the status of a run
    Status {
        /// Workflow id (e.g. analyze-https://...)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Resume an unfinished run from its journal
    Resume {
        /// Workflow id to resume
        run_id: String,
    },

    /// Print the latest articles with ads interleaved, as JSON
    Feed {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Manage advertisements
    Ad {
        #[command(subcommand)]
        command: AdCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum AdCommands {
    /// Create an advertisement
    Create {
        /// native or banner
        #[arg(short, long, default_value = "native")]
        kind: AdKind,

        #[arg(long)]
        title: String,

        #[arg(long)]
        target_url: String,

        #[arg(long, default_value = "")]
        body: String,

        #[arg(long, default_value = "")]
        media_url: String,

        #[arg(short, long, default_value = "0")]
        priority: i64,

        /// Create without serving it yet
        #[arg(long)]
        inactive: bool,
    },

    /// Start serving an advertisement
    Activate { id: Uuid },

    /// Stop serving an advertisement
    Deactivate { id: Uuid },

    /// List active advertisements
    List,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = config::config()?;

        match self.command {
            Commands::Worker {
                no_scheduler,
                stdin_signals,
            } => run_worker(config, !no_scheduler, stdin_signals).await,
            Commands::Process { url } => process_article(config, &url).await,
            Commands::Cycle => run_cycle(config).await,
            Commands::Signal { url, source } => send_signal(config, url, source).await,
            Commands::Inbox => show_inbox(config).await,
            Commands::Rebalance { target, candidates } => {
                run_rebalance(config, target, candidates).await
            }
            Commands::Status { run_id } => show_status(config, &run_id).await,
            Commands::Runs { limit } => list_runs(config, limit).await,
            Commands::Resume { run_id } => resume_run(config, &run_id).await,
            Commands::Feed { limit } => show_feed(config, limit).await,
            Commands::Ad { command } => execute_ad(config, command).await,
            Commands::Config => show_config(config),
        }
    }
}

/// Build a host wired to the real collaborators
fn build_host(config: &ResolvedConfig) -> Result<WorkflowHost> {
    let api_key = config
        .gemini_api_key
        .clone()
        .context("GEMINI_API_KEY is not set")?;

    let extractor = HttpExtractor::new(&config.user_agent, config.fetch_timeout)
        .context("Failed to build HTTP client")?;
    let discovery = GdeltDiscovery::new(
        config.gdelt_update_url.clone(),
        config.tone_threshold,
        config.fetch_timeout * 2,
    )
    .context("Failed to build GDELT client")?;
    let reasoning = GeminiClient::new(
        api_key,
        config.gemini_base_url.clone(),
        config.gemini_model.clone(),
        config.gemini_embedding_model.clone(),
    );
    let articles = SqliteArticleStore::open(&config.articles_db_path())
        .with_context(|| format!("Failed to open {}", config.articles_db_path().display()))?;
    let graph = SqliteKnowledgeGraph::open(&config.graph_db_path())
        .with_context(|| format!("Failed to open {}", config.graph_db_path().display()))?;

    let registry = ActivityRegistry::from_collaborators(Collaborators {
        extractor: Arc::new(extractor),
        reasoning: Arc::new(reasoning),
        articles: Arc::new(articles),
        graph: Arc::new(graph),
        discovery: Arc::new(discovery),
    });

    Ok(WorkflowHost::new(config.journal_dir(), registry, config.host_settings()))
}

/// Host without activities, for read-only journal commands
fn journal_host(config: &ResolvedConfig) -> WorkflowHost {
    WorkflowHost::new(config.journal_dir(), ActivityRegistry::new(), config.host_settings())
}

fn open_store(config: &ResolvedConfig) -> Result<SqliteArticleStore> {
    SqliteArticleStore::open(&config.articles_db_path())
        .with_context(|| format!("Failed to open {}", config.articles_db_path().display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run scheduler and processor until Ctrl-C
async fn run_worker(config: &ResolvedConfig, with_scheduler: bool, stdin_signals: bool) -> Result<()> {
    let host = build_host(config)?;
    let inbox = SignalInbox::new(config.inbox_path());
    let (sender, processor) = causal_chain::channel(host.clone(), inbox, config.channel_capacity);

    let processor_task = tokio::spawn(processor.run(host.shutdown_signal()));

    let scheduler_task = if with_scheduler {
        let scheduler = IngestionScheduler::new(host.clone(), config.scheduler_interval);
        let shutdown = host.shutdown_signal();
        Some(tokio::spawn(async move { scheduler.run(shutdown).await }))
    } else {
        None
    };

    if stdin_signals {
        let sender = sender.clone();
        let mut shutdown = host.shutdown_signal();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    _ = shutdown.wait() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(url)) if url.trim().is_empty() => continue,
                    Ok(Some(url)) => {
                        if let Err(e) = sender.send(IngestSignal::new(url.trim(), "stdin")).await {
                            error!(error = %e, "Failed to queue signal");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Stopped reading stdin");
                        break;
                    }
                }
            }
        });
    }

    info!("Worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    host.shutdown();

    if let Some(task) = scheduler_task {
        if let Err(e) = task.await {
            error!(error = %e, "Scheduler task panicked");
        }
    }
    let stats = processor_task.await.context("Processor task panicked")?;
    let children = host.wait_all().await;

    eprintln!(
        "[Worker stopped: {} signals processed, {} failed, {} interrupted, {} child pipelines drained]",
        stats.processed,
        stats.failed,
        stats.interrupted,
        children.len()
    );
    Ok(())
}

/// Run the pipeline for one URL in the foreground
async fn process_article(config: &ResolvedConfig, url: &str) -> Result<()> {
    let host = build_host(config)?;
    let outcome = pipeline::execute(&host, ProcessingRequest::new(url)).await?;
    print_json(&outcome)?;
    eprintln!("\n[Run {} completed]", WorkflowId::for_article(url));
    Ok(())
}

async fn run_cycle(config: &ResolvedConfig) -> Result<()> {
    let host = build_host(config)?;
    let scheduler = IngestionScheduler::new(host.clone(), config.scheduler_interval);
    let report = scheduler.run_cycle().await?;
    print_json(&report)?;

    let mut failed = 0;
    for (id, result) in host.wait_all().await {
        if let Err(e) = result {
            failed += 1;
            eprintln!("  {}: {}", id, e);
        }
    }
    eprintln!("\n[Cycle finished, {} child pipelines failed]", failed);
    Ok(())
}

/// Write the signal to the inbox; a running or next worker picks it up
async fn send_signal(config: &ResolvedConfig, url: String, source: String) -> Result<()> {
    crate::domain::article::validate_url(&url).with_context(|| format!("Invalid URL: {}", url))?;

    let inbox = SignalInbox::new(config.inbox_path());
    let delivery_id = inbox.enqueue(&IngestSignal::new(url, source)).await?;
    println!("{}", delivery_id);
    Ok(())
}

async fn show_inbox(config: &ResolvedConfig) -> Result<()> {
    let status = SignalInbox::new(config.inbox_path()).status().await?;
    println!("Pending:    {}", status.pending);
    println!("Processing: {}", status.processing);
    println!("Done:       {}", status.done);
    println!("Failed:     {}", status.failed);
    println!("Total:      {}", status.total());
    Ok(())
}

async fn run_rebalance(config: &ResolvedConfig, target: String, candidates: PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(&candidates)
        .with_context(|| format!("Failed to read candidates file: {}", candidates.display()))?;
    let candidate_events = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse candidates file: {}", candidates.display()))?;

    let host = build_host(config)?;
    let outcome = rebalancer::execute(
        &host,
        RebalanceRequest {
            target_event_id: target,
            candidate_events,
        },
    )
    .await?;
    print_json(&outcome)
}

fn state_label(state: &RunState) -> &'static str {
    match state {
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Failed { .. } => "failed",
        RunState::Cancelled => "cancelled",
    }
}

fn kind_label(run: &Run) -> String {
    run.kind.map(|k| k.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Show the status of a run
async fn show_status(config: &ResolvedConfig, run_id: &str) -> Result<()> {
    let host = journal_host(config);
    let id = WorkflowId::new(run_id);
    let run = host
        .status(&id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))?;

    println!("Run ID: {}", run.id);
    println!("Kind: {}", kind_label(&run));
    println!("State: {}", state_label(&run.state));
    if let RunState::Failed { error } = &run.state {
        println!("Error: {}", error);
    }
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("Resumptions: {}", run.resumptions);

    let mut steps: Vec<_> = run.step_statuses.iter().collect();
    steps.sort_by(|a, b| a.0.cmp(b.0));
    println!("\nStep statuses:");
    for (step, status) in steps {
        println!("  {}: {:?}", step, status);
    }
    if let Some(outcome) = &run.outcome {
        println!("\nOutcome:\n{}", serde_json::to_string_pretty(outcome)?);
    }

    Ok(())
}

/// List recent runs
async fn list_runs(config: &ResolvedConfig, limit: usize) -> Result<()> {
    let runs = journal_host(config).list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<60} {:<16} {:<10}", "RUN ID", "KIND", "STATE");
    println!("{}", "-".repeat(88));

    for run in runs {
        println!(
            "{:<60} {:<16} {:<10}",
            run.id.as_str(),
            kind_label(&run),
            state_label(&run.state)
        );
    }

    Ok(())
}

/// Resume a run with the input recorded in its journal
async fn resume_run(config: &ResolvedConfig, run_id: &str) -> Result<()> {
    let id = WorkflowId::new(run_id);
    let existing = journal_host(config)
        .status(&id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))?;

    if existing.state == RunState::Completed {
        println!("Run {} already completed", run_id);
        return Ok(());
    }
    let kind = existing
        .kind
        .with_context(|| format!("Run {} has no recorded kind", run_id))?;

    let host = build_host(config)?;
    match kind {
        WorkflowKind::Pipeline => {
            let request: ProcessingRequest = serde_json::from_value(existing.input)?;
            if WorkflowId::for_article(&request.target_url) != id {
                anyhow::bail!("Run {} does not belong to {}", run_id, request.target_url);
            }
            print_json(&pipeline::execute(&host, request).await?)?;
        }
        WorkflowKind::Rebalance => {
            let request: RebalanceRequest = serde_json::from_value(existing.input)?;
            print_json(&rebalancer::execute_as(&host, id, request).await?)?;
        }
        WorkflowKind::CausalSignal => {
            let signal: IngestSignal = serde_json::from_value(existing.input)?;
            let delivery_id = run_id
                .strip_prefix("causal-")
                .with_context(|| format!("Unexpected causal run id: {}", run_id))?;
            let outcome = causal_chain::process_signal(&host, delivery_id, &signal).await?;

            let inbox = SignalInbox::new(config.inbox_path());
            if inbox.get(delivery_id).await?.is_some() {
                inbox.mark_done(delivery_id).await?;
            }
            print_json(&outcome)?;
        }
        WorkflowKind::IngestionCycle => {
            let scheduler = IngestionScheduler::new(host.clone(), config.scheduler_interval);
            print_json(&scheduler.run_cycle_as(id).await?)?;
            host.wait_all().await;
        }
    }

    eprintln!("\n[Run {} resumed and completed]", run_id);
    Ok(())
}

/// Latest articles with one ad after every fifth
async fn show_feed(config: &ResolvedConfig, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let articles = store.latest(limit).await?;
    let ads = store.active_ads(FEED_AD_LIMIT).await?;

    let feed = interleave(articles, ads, AD_INTERVAL);
    let served: Vec<Uuid> = feed
        .iter()
        .filter_map(|item| match item {
            FeedItem::Advertisement(ad) => Some(ad.id),
            FeedItem::Article(_) => None,
        })
        .collect();
    store.record_impressions(&served).await?;

    print_json(&feed)
}

async fn execute_ad(config: &ResolvedConfig, command: AdCommands) -> Result<()> {
    let store = open_store(config)?;

    match command {
        AdCommands::Create {
            kind,
            title,
            target_url,
            body,
            media_url,
            priority,
            inactive,
        } => {
            crate::domain::article::validate_url(&target_url)
                .with_context(|| format!("Invalid target URL: {}", target_url))?;
            let mut ad = Advertisement::new(kind, title, target_url);
            ad.body = body;
            ad.media_url = media_url;
            ad.priority = priority;
            ad.is_active = !inactive;
            store.create_ad(&ad).await?;
            println!("{}", ad.id);
        }
        AdCommands::Activate { id } => set_active(&store, id, true).await?,
        AdCommands::Deactivate { id } => set_active(&store, id, false).await?,
        AdCommands::List => {
            let ads = store.active_ads(1_000).await?;
            if ads.is_empty() {
                println!("No active ads");
            }
            for ad in ads {
                println!("{}  {:<7} p={:<4} shown={:<6} {}", ad.id, ad.kind, ad.priority, ad.impressions, ad.title);
            }
        }
    }
    Ok(())
}

async fn set_active(store: &SqliteArticleStore, id: Uuid, active: bool) -> Result<()> {
    if !store.set_ad_active(id, active).await? {
        anyhow::bail!("Ad not found: {}", id);
    }
    println!("Ad {} {}", id, if active { "activated" } else { "deactivated" });
    Ok(())
}

/// Show resolved configuration
fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!("truthweave Configuration");
    println!("========================\n");

    if let Some(ref path) = config.config_file {
        println!("Config file: {}", path.display());
    } else {
        println!("Config file: (none - using defaults)");
    }

    println!("\nPaths:");
    println!("  Home:      {}", config.home.display());
    println!("  Runs:      {}", config.journal_dir().display());
    println!("  Inbox:     {}", config.inbox_path().display());
    println!("  Articles:  {}", config.articles_db_path().display());
    println!("  Graph:     {}", config.graph_db_path().display());

    println!("\nWorkflows:");
    println!("  Dedup threshold:     {}", config.dedup_threshold);
    println!("  Scheduler interval:  {}s", config.scheduler_interval.as_secs());
    println!("  Context events:      {}", config.context_event_limit);
    println!("  Signal capacity:     {}", config.channel_capacity);

    println!("\nCollaborators:");
    println!("  Gemini model:        {}", config.gemini_model);
    println!("  Embedding model:     {}", config.gemini_embedding_model);
    println!(
        "  Gemini API key:      {}",
        if config.gemini_api_key.is_some() { "set" } else { "(not set)" }
    );
    println!("  GDELT update list:   {}", config.gdelt_update_url);
    println!("  Tone threshold:      {}", config.tone_threshold);

    println!("\nEnvironment overrides:");
    for var in ["TRUTHWEAVE_HOME", "TRUTHWEAVE_DB", "DEDUPLICATION_THRESHOLD"] {
        if let Ok(value) = std::env::var(var) {
            println!("  {}={}", var, value);
        }
    }

    Ok(())
}
