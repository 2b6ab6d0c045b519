//! Aether: periodic agent loop runtime.
//!
//! Usage:
//!   aether run [--ticks N] [--emit-events]   Start the loop
//!   aether status                            Show the persisted state
//!   aether check-config                      Validate and print the effective config
//!   aether init [--force]                    Write a default config file
//!   aether note <text>                       Append an operator reflection offline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aether_loop::agent::Orchestrator;
use aether_loop::config::{self, LoopConfig, RedactingStderr};
use aether_loop::events::EventBus;
use aether_loop::state::{schema, HistoryEntry, Snapshot, StateStore};
use aether_loop::types::*;
use aether_loop::LoopError;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "aether")]
#[command(version)]
#[command(about = "Periodic agent loop: guidance, bounded state, side-effect sinks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Home directory (default ~/.aether).
    #[arg(long, global = true)]
    home: Option<String>,

    /// Config file (default <home>/aether.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (debug, info, warn, error). RUST_LOG overrides.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the loop.
    Run {
        /// Stop after this many ticks.
        #[arg(long)]
        ticks: Option<u64>,

        /// Print every published event as a JSON line on stdout.
        #[arg(long)]
        emit_events: bool,
    },

    /// Show the persisted state.
    Status,

    /// Validate the configuration and print it with secrets redacted.
    CheckConfig,

    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Append an operator reflection to the state file (loop must not be running).
    Note { text: String },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(RedactingStderr)
        .init();

    let result = match &cli.command {
        Commands::Run { ticks, emit_events } => cmd_run(&cli, *ticks, *emit_events).await,
        Commands::Status => cmd_status(&cli),
        Commands::CheckConfig => cmd_check_config(&cli),
        Commands::Init { force } => cmd_init(&cli, *force),
        Commands::Note { text } => cmd_note(&cli, text),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            let message = config::redact_line(&format!("{e:#}"));
            error!("{}", message);
            eprintln!("{} {}", "Error:".red().bold(), message);
            ExitCode::from(code)
        }
    }
}

/// Exit code of the first `LoopError` in the chain; 1 otherwise.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<LoopError>())
        .map(|e| e.exit_code())
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

async fn cmd_run(cli: &Cli, ticks: Option<u64>, emit_events: bool) -> Result<()> {
    let config = load(cli)?;
    let bus = EventBus::default();
    let mut orchestrator = Orchestrator::from_config(config.clone(), bus.clone())?;

    if !emit_events {
        println!(
            "{} Starting run {} (provider: {:?}, every {}s, state: {})",
            ">>>".green().bold(),
            orchestrator.run_id(),
            config.provider,
            config.cadences.thought_every_s,
            config.resolved_state_file().display(),
        );
    }

    let printer = emit_events.then(|| {
        let mut sub = bus.subscribe();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("Cannot serialise event {}: {}", event.seq, e),
                }
            }
        })
    });
    drop(bus);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} Shutting down gracefully...", "<<<".red().bold());
            signal_cancel.cancel();
        }
    });

    let summary = orchestrator.run(cancel, ticks).await?;
    drop(orchestrator);

    if let Some(handle) = printer {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
    }

    info!(
        "Run {} done: {} ticks, {} coalesced, final flush {}",
        summary.run_id,
        summary.ticks,
        summary.coalesced,
        if summary.final_flush { "ok" } else { "skipped" }
    );
    Ok(())
}

fn cmd_status(cli: &Cli) -> Result<()> {
    let config = load(cli)?;
    let path = config.resolved_state_file();

    // Read-only: a corrupt file is reported, not quarantined.
    let snapshot = match std::fs::read_to_string(&path) {
        Ok(text) => schema::decode(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No state at {} yet. Run `aether run` first.", path.display());
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    print_status(&snapshot, &path);
    Ok(())
}

fn cmd_check_config(cli: &Cli) -> Result<()> {
    let config = load(cli)?;
    let rendered = toml::to_string_pretty(&config::redacted(&config))
        .context("Failed to render config")?;
    println!("{rendered}");
    println!("{} configuration is valid", "OK".green().bold());
    Ok(())
}

fn cmd_init(cli: &Cli, force: bool) -> Result<()> {
    let (home, path) = locate(cli);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut config = LoopConfig::default();
    config.rebase_home(&home);
    config::save_config(&config, &path)?;
    println!("{} Wrote {}", ">>>".green().bold(), path.display());
    Ok(())
}

fn cmd_note(cli: &Cli, text: &str) -> Result<()> {
    let config = load(cli)?;
    let store = StateStore::new(
        config.resolved_state_file(),
        config.ring_caps,
        config.evolution.initial_level,
    );
    let thought = Thought {
        id: 0,
        created_at: chrono::Utc::now(),
        kind: ThoughtKind::Reflection,
        text: text.to_string(),
        source: Source::TemplateBank,
        tags: ["operator".to_string()].into_iter().collect(),
        metrics: Default::default(),
    };
    let id = store.append_event(HistoryEntry::Thought(thought))?;
    println!("{} Recorded thought #{}", ">>>".green().bold(), id);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Home directory and config file path.
fn locate(cli: &Cli) -> (PathBuf, PathBuf) {
    let home = cli
        .home
        .as_deref()
        .map(|h| PathBuf::from(shellexpand::tilde(h).into_owned()))
        .unwrap_or_else(config::default_home_dir);
    let path = cli.config.clone().unwrap_or_else(|| home.join("aether.toml"));
    (home, path)
}

/// Load, overlay environment, validate.
fn load(cli: &Cli) -> Result<LoopConfig> {
    let (home, path) = locate(cli);
    let mut config = config::resolve_config(&path, std::env::vars())
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.rebase_home(&home);
    Ok(config)
}

fn print_status(s: &Snapshot, path: &std::path::Path) {
    let m = &s.metrics;
    let hwm = &s.high_water_marks;

    println!();
    println!("{}", "=== Aether Status ===".bold());
    println!();
    println!("  {}:  {}", "State".bold(), path.display());
    println!("  {}:  {}", "Updated".bold(), s.updated_at.to_rfc3339());
    println!();
    println!("  {}:", "Consciousness".bold());
    println!("    Level:    {}", colorize_level(s.consciousness.level));
    for (knob, value) in &s.consciousness.cognitive_knobs {
        println!("    {:<9} {:.3}", format!("{knob}:"), value);
    }
    println!();
    println!("  {}:", "History".bold());
    println!("    Thoughts:   {} (last id {})", s.thoughts.len(), hwm.thought_id);
    println!("    Tasks:      {} (last id {})", s.tasks_completed.len(), hwm.task_id);
    println!("    Evolutions: {} (last id {})", s.evolutions.len(), hwm.evolution_id);
    println!();
    println!("  {}:", "Metrics".bold());
    println!("    Tasks/hour:    {}", m.tasks_per_hour);
    println!("    Mean novelty:  {:.3}", m.mean_novelty);
    println!("    Mean quality:  {:.3}", m.mean_quality);
    println!("    Breakthroughs: {}", m.breakthrough_count);
    println!("    Excellence:    {:.3}", m.excellence_score);

    if !s.objectives.is_empty() {
        println!();
        println!("  {}:", "Objectives".bold());
        for o in &s.objectives {
            println!("    - {}", o);
        }
    }

    if let Some(g) = s.guidance.iter().rev().find(|g| g.warning.as_deref() != Some("sink_failed")) {
        println!();
        println!("  {}:", "Provider".bold());
        println!("    Last:     {} ({})", g.provider, colorize_source(g.source, g.ok));
    }

    let recent: Vec<&Thought> = s.thoughts.iter().rev().take(3).collect();
    if !recent.is_empty() {
        println!();
        println!("  {}:", "Recent thoughts".bold());
        for t in recent {
            println!("    #{} {}", t.id, t.text.dimmed());
        }
    }
    println!();
}

fn colorize_level(level: f64) -> String {
    let text = format!("{:.3}", level);
    if level >= 0.9 {
        text.green().bold().to_string()
    } else if level >= 0.85 {
        text.green().to_string()
    } else {
        text.yellow().to_string()
    }
}

fn colorize_source(source: Source, ok: bool) -> String {
    match (source, ok) {
        (Source::RemoteLlm, _) => "remote_llm".green().to_string(),
        (Source::TemplateBank, true) => "template_bank".normal().to_string(),
        (Source::Fallback, _) | (_, false) => "degraded".red().to_string(),
    }
}
