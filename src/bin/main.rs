//! Org Replicator CLI

use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use org_replicator::config::SAMPLE_CONFIG;
use org_replicator::{FileCache, ReplicationClient, ReplicationConfig, ReplicationProgress, cache};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "org-replicator")]
#[command(author, version, about = "Replicate records between two orgs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level
    #[arg(long, default_value = "info", global = true, env = "LOG_LEVEL")]
    log_level: String,

    /// JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run replication (default)
    Replicate {
        /// Only object types whose name starts with this prefix
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Show eligible objects in dependency order
    Plan {
        /// Only object types whose name starts with this prefix
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Test connectivity to both orgs
    Test,
    /// Manage the durable cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Generate sample config
    Init {
        #[arg(short, long, default_value = "org-replicator.toml")]
        output: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete cached entries
    Clear {
        /// Only keys starting with this prefix (e.g. an org id)
        #[arg(short, long, default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.quiet, cli.json);

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // init doesn't need config
    if let Some(Commands::Init { output }) = &cli.command {
        return run_init(output);
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        None => run_replicate(config, None, cli.json, cli.quiet).await,
        Some(Commands::Replicate { filter }) => {
            run_replicate(config, filter.as_deref(), cli.json, cli.quiet).await
        }
        Some(Commands::Plan { filter }) => run_plan(config, filter.as_deref(), cli.json).await,
        Some(Commands::Test) => run_test(config, cli.json).await,
        Some(Commands::Cache {
            action: CacheAction::Clear { prefix },
        }) => run_cache_clear(config, &prefix, cli.json).await,
        Some(Commands::Init { .. }) => Ok(()),
    }
}

fn load_config(path: Option<&str>) -> Result<ReplicationConfig, Box<dyn std::error::Error>> {
    if let Some(p) = path {
        info!("Loading config from: {}", p);
        return Ok(ReplicationConfig::from_file(p)?);
    }

    for default in &["org-replicator.toml", ".org-replicator.toml"] {
        if std::path::Path::new(default).exists() {
            info!("Loading config from: {}", default);
            return Ok(ReplicationConfig::from_file(default)?);
        }
    }

    info!("Loading config from environment");
    Ok(ReplicationConfig::from_env()?)
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(template) =
        ProgressStyle::with_template("{spinner} {msg:<40} [{bar:30}] {pos}/{len} ({elapsed})")
    {
        bar.set_style(template.progress_chars("=> "));
    }
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

fn show_progress(bar: &ProgressBar, progress: ReplicationProgress) {
    if let Some(total) = progress.total_records {
        bar.set_length(total);
    }
    bar.set_position(progress.records_processed as u64);
    bar.set_message(format!("{} ({})", progress.object, progress.state));
}

async fn run_replicate(
    config: ReplicationConfig,
    filter: Option<&str>,
    json: bool,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let interactive = !quiet && !json;
    if interactive {
        println!("Org Replicator v{}", org_replicator::VERSION);
        if let Some(f) = filter {
            println!("Filter: {}", f);
        }
        println!();
    }

    let mut client = ReplicationClient::new(config).await?;
    let bar = interactive.then(progress_bar);
    if let Some(ref bar) = bar {
        let bar = bar.clone();
        client = client.with_progress(move |p| show_progress(&bar, p));
    }

    let result = client.replicate(filter).await?;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if !quiet {
        if result.success {
            println!("{} Replication completed successfully", style("✓").green());
        } else {
            println!("{} Replication completed with errors", style("✗").red());
        }
        println!("\nDuration: {}ms", result.duration_ms);
        println!(
            "Upserted: {}, skipped: {}, failed: {}\n",
            result.total_upserted(),
            result.total_skipped(),
            result.total_failed()
        );

        for object in &result.order {
            let Some(r) = result.objects.get(object) else {
                continue;
            };
            let icon = if r.is_success() {
                style("✓").green()
            } else {
                style("✗").red()
            };
            println!(
                "  {} {}: {} read, {} upserted, {} skipped, {} dropped, {} omitted refs ({}ms)",
                icon,
                object,
                r.records_read,
                r.upserted,
                r.skipped(),
                r.dropped,
                r.omitted,
                r.duration_ms
            );
            if let Some(ref e) = r.error {
                println!("      Error: {}", e);
            } else if let Some(ref e) = r.last_data_error {
                println!("      Last rejected batch: {}", e);
            }
        }
        println!(
            "\nRemote calls: {}, retries: {}, cache hit rate: {:.0}%",
            result.metrics.remote_calls(),
            result.metrics.retries,
            result.metrics.cache_hit_rate() * 100.0
        );
    }

    if result.success {
        Ok(())
    } else {
        Err(format!("Replication failed for: {}", result.failed_objects().join(", ")).into())
    }
}

async fn run_plan(
    config: ReplicationConfig,
    filter: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = ReplicationClient::new(config).await?;
    let plan = client.plan(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("Replication plan (most referenced first)\n");
        for (i, object) in plan.objects.iter().enumerate() {
            println!("  {:>3}. {} ({} references)", i + 1, object.name, object.referenced_by);
        }
        println!("\nTotal: {} object types", plan.objects.len());
    }
    Ok(())
}

async fn run_test(config: ReplicationConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !json {
        println!("Testing connectivity...\n");
    }

    let client = ReplicationClient::new(config).await?;
    let (source, destination) = client.test_connectivity().await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "source": source,
                "destination": destination,
            }))?
        );
    } else {
        println!("  Source:      {} ({})", source.username, source.organization_id);
        println!(
            "  Destination: {} ({})",
            destination.username, destination.organization_id
        );
        println!("\n{} All connectivity tests passed!", style("✓").green());
    }
    Ok(())
}

async fn run_cache_clear(
    config: ReplicationConfig,
    prefix: &str,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileCache::open(&config.cache.directory).await?;
    let removed = cache::clear(&store, prefix).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "directory": config.cache.directory, "removed": removed })
        );
    } else {
        println!(
            "{} Removed {} entries from {}",
            style("✓").green(),
            removed,
            config.cache.directory
        );
    }
    Ok(())
}

fn run_init(output: &str) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::write(output, SAMPLE_CONFIG)?;
    println!("✓ Created: {}", output);
    println!("\nEdit the file or use environment variables:");
    println!("  SOURCE_INSTANCE_URL, SOURCE_ACCESS_TOKEN, DEST_INSTANCE_URL, DEST_ACCESS_TOKEN");
    Ok(())
}

fn init_logging(level: &str, quiet: bool, json_output: bool) {
    if quiet {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // keep stdout clean for the JSON report
    if json_output {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}
