use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adsidebar::metrics;
use adsidebar::sim::{run_scenario, Scenario, ScenarioReport};
use adsidebar_policy_center::{
    load_snapshot, InMemoryPolicyCenter, PolicyCenter, PolicySnapshot, RuntimeOverrideSpec,
};

/// AdSidebar - relocate blocked page elements into a sidebar
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug mode
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario file against the simulated host
    Simulate(SimulateArgs),

    /// Inspect the effective configuration
    Policy(PolicyArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// Scenario file (YAML)
    scenario: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "human")]
    output: OutputFormat,

    /// Runtime override applied before the run, `path=value` (repeatable)
    #[arg(long = "set", value_name = "PATH=VALUE")]
    overrides: Vec<String>,

    /// Print the Prometheus exposition after the report
    #[arg(long)]
    metrics: bool,
}

#[derive(Args)]
struct PolicyArgs {
    #[command(subcommand)]
    command: PolicyCommand,
}

#[derive(Subcommand)]
enum PolicyCommand {
    Show(PolicyShowArgs),
    /// Per-site switches resolved for a page URL
    Site(PolicySiteArgs),
}

#[derive(Args)]
struct PolicyShowArgs {
    /// Output JSON instead of human summary
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct PolicySiteArgs {
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.debug, cli.json_logs)?;
    metrics::register_metrics();

    let snapshot = load_snapshot(cli.config.as_deref())
        .map_err(|e| anyhow!(e.to_string()))
        .context("Failed to load configuration")?;

    let result = match cli.command {
        Commands::Simulate(args) => cmd_simulate(args, snapshot).await,
        Commands::Policy(args) => cmd_policy(args, snapshot),
    };

    match result {
        Ok(()) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(level: &str, debug: bool, json: bool) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        level.parse().context("Invalid log level")?
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

async fn cmd_simulate(args: SimulateArgs, snapshot: PolicySnapshot) -> Result<()> {
    let scenario = Scenario::load(&args.scenario)
        .with_context(|| format!("Failed to load scenario {}", args.scenario.display()))?;

    let center = Arc::new(InMemoryPolicyCenter::new(snapshot));
    for raw in &args.overrides {
        let (path, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("override `{raw}` is not of the form path=value"))?;
        let value = serde_json::from_str::<serde_json::Value>(value.trim())
            .unwrap_or_else(|_| serde_json::Value::String(value.trim().to_string()));
        let spec = RuntimeOverrideSpec {
            path: path.trim().to_string(),
            value,
            owner: "cli".to_string(),
            reason: "simulate --set".to_string(),
            ttl_seconds: 0,
        };
        center
            .apply_override(spec)
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
    }

    let report = run_scenario(&scenario, center)?;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&report)?),
        OutputFormat::Human => print_report(&report),
    }

    if args.metrics {
        println!();
        print!("{}", metrics::render_text()?);
    }
    Ok(())
}

fn print_report(report: &ScenarioReport) {
    println!("Scenario: {} ({} ms simulated)", report.name, report.elapsed_ms);
    match &report.stats {
        Some(stats) => {
            println!(
                "Phase → {} (displayed={}, expanded={})",
                stats.phase, stats.displayed, stats.expanded
            );
            println!(
                "Ads → confirmed={} candidates={} empty={} hidden_matches={}",
                stats.enabled_ad_count,
                stats.ads.non_empty_box_count,
                stats.ads.empty_box_count,
                stats.ads.hidden_element_count
            );
            println!(
                "Replay → replayed={} dead={} writes={} queued={}",
                stats.replay.replayed_count,
                stats.replay.dead_item_count,
                stats.replay.doc_write_count,
                stats.queued_items
            );
            println!(
                "Monitor → rounds={} refresh_calls={} script_error={} remediated={}",
                stats.monitor_rounds, stats.refresh_calls, stats.script_error, stats.remediated
            );
        }
        None => println!("No page view was tracked"),
    }
    println!();
    println!("Container:");
    if report.boxes.is_empty() {
        println!("  (empty)");
    }
    for (idx, entry) in report.boxes.iter().enumerate() {
        let marker = if entry.hidden { " [hidden]" } else { "" };
        println!("  {:>2}. {}{}", idx + 1, entry.content, marker);
    }
    println!();
    println!("Events: {}", report.event_names().join(", "));
    for warning in &report.warnings {
        println!("Warning: {warning}");
    }
}

fn cmd_policy(args: PolicyArgs, snapshot: PolicySnapshot) -> Result<()> {
    match args.command {
        PolicyCommand::Show(show_args) => {
            if show_args.json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("Policy Revision: {}", snapshot.rev);
                println!();
                println!(
                    "General → enabled={}, autohide_seconds={}, ad_scaling_enabled={}",
                    snapshot.general.enabled,
                    snapshot.general.autohide_seconds,
                    snapshot.general.ad_scaling_enabled
                );
                println!(
                    "Layout → box={}x{} max={}x{} visible_boxes={} scale_factor={}",
                    snapshot.layout.box_width,
                    snapshot.layout.box_height,
                    snapshot.layout.max_width,
                    snapshot.layout.max_height,
                    snapshot.layout.visible_boxes,
                    snapshot.layout.scale_factor
                );
                println!(
                    "Convergence → poll_interval_ms={} max_rounds={} empty_refresh_ratio={} min_visible_px={}",
                    snapshot.convergence.poll_interval_ms,
                    snapshot.convergence.max_rounds,
                    snapshot.convergence.empty_refresh_ratio,
                    snapshot.convergence.min_visible_px
                );
                println!(
                    "Site Defaults → refresh_third_party_ads={} replay_inline_scripts_on_error={} override_page_ready_hook={}",
                    snapshot.site_defaults.refresh_third_party_ads,
                    snapshot.site_defaults.replay_inline_scripts_on_error,
                    snapshot.site_defaults.override_page_ready_hook
                );
                println!("Site Rules → {}", snapshot.sites.len());
                for rule in &snapshot.sites {
                    println!("  - {}", rule.pattern);
                }
                let mut sources: Vec<_> = snapshot.provenance.values().collect();
                sources.sort_by(|a, b| a.path.cmp(&b.path));
                let overridden: Vec<_> = sources
                    .into_iter()
                    .filter(|p| !matches!(p.source, adsidebar_policy_center::PolicySource::Builtin))
                    .collect();
                if !overridden.is_empty() {
                    println!();
                    println!("Overridden:");
                    for p in overridden {
                        println!("  {} ← {:?}", p.path, p.source);
                    }
                }
            }
        }
        PolicyCommand::Site(site_args) => {
            let site = snapshot.site_overrides(&site_args.url);
            println!("Site: {}", site_args.url);
            println!("  refresh_third_party_ads={}", site.refresh_third_party_ads);
            println!(
                "  replay_inline_scripts_on_error={}",
                site.replay_inline_scripts_on_error
            );
            println!("  override_page_ready_hook={}", site.override_page_ready_hook);
        }
    }

    Ok(())
}
