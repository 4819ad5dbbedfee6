// ============================================================================
// COMMAND LINE INTERFACE
// ============================================================================
// - `run`: start the engine until SIGINT/SIGTERM
// - `validate` / `generate-config`: configuration tooling
// - `import`: batch-ingest a JSONL file and print windowed stats
// - `sweep`: one retention pass over the durable sample log
// ============================================================================

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use operator_metrics::config::LoggingConfig;
use operator_metrics::logging::init_logging;
use operator_metrics::{
    Clock, EngineConfig, IngestRequest, MetricsEngine, MetricsError, MetricsResult, RequestContext, ENGINE_FULL_NAME,
    ENGINE_VERSION,
};

// ----------------------------------------------------------------------------
// Argument Parser
// ----------------------------------------------------------------------------

/// Operator metrics core CLI
#[derive(Parser, Debug)]
#[command(
    name = "operator-metrics",
    author = "Operator Platform Team",
    version,
    about = "Time-series metrics core: ingestion, windowed analytics, rollups and retention",
    long_about = "Operator Metrics ingests high-rate sensor and event samples, answers \
                  windowed statistics on demand, keeps continuous rollups in sync and \
                  evicts data past its retention horizon."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "opmetrics.toml", env = "OPMETRICS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "OPMETRICS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "OPMETRICS_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine and its background jobs
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,

    /// Batch-import samples from a JSON Lines file
    Import {
        /// One sample object per line
        file: PathBuf,

        /// Window for the summary printed afterwards
        #[arg(short, long, default_value_t = 1440.0)]
        window_minutes: f64,

        /// Restrict the summary to one signal type
        #[arg(short, long)]
        signal: Option<String>,
    },

    /// Run one retention pass over the sample log and compact it
    Sweep,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> MetricsResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{s}"),
                    Err(e) => println!("Failed to serialize: {e}"),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Environment: {}", config.engine.environment);
            println!("  • Feature '{}' enabled: {}", config.feature.name, config.feature.enabled);
            println!("  • Store backend: {:?}", config.store.backend);
            println!("  • Max batch size: {}", config.ingest.max_batch_size);
            println!("  • Rollups:");
            for rollup in &config.aggregates.rollups {
                println!(
                    "    - {} every {} (backfill {} .. {})",
                    rollup.granularity,
                    humantime::format_duration(rollup.every),
                    humantime::format_duration(rollup.start_offset),
                    humantime::format_duration(rollup.end_offset),
                );
            }
            println!("  • Retention horizons:");
            for (table, horizon) in config.retention.horizons() {
                println!("    - {table}: {}", humantime::format_duration(horizon));
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {e}");
            Err(MetricsError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> MetricsResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{config_str}"),
    }
    Ok(())
}

fn handle_version() {
    println!("📈 {ENGINE_FULL_NAME} v{ENGINE_VERSION}");
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Validated signal vocabulary");
    println!("  • Read-time windowed statistics");
    println!("  • Continuous rollups with bounded backfill");
    println!("  • Per-table retention with single-flight sweeps");
    println!("  • Append-only checksummed sample log");
}

async fn handle_import(
    engine: &MetricsEngine,
    file: &Path,
    window_minutes: f64,
    signal: Option<&str>,
) -> AnyhowResult<()> {
    let reader = BufReader::new(File::open(file).with_context(|| format!("Failed to open {}", file.display()))?);
    let ctx = RequestContext::system();
    let chunk_size = engine.gateway().max_batch_size();

    let mut batch = Vec::with_capacity(chunk_size);
    let mut written = 0usize;
    let mut rejected = 0usize;
    let mut malformed = 0usize;

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IngestRequest>(&line) {
            Ok(request) => batch.push(request),
            Err(e) => {
                warn!(line = n + 1, error = %e, "Skipping malformed line");
                malformed += 1;
                continue;
            }
        }
        if batch.len() == chunk_size {
            let outcome = engine.gateway().batch_ingest(&ctx, std::mem::take(&mut batch)).await?;
            written += outcome.written;
            rejected += outcome.rejected.len();
        }
    }
    if !batch.is_empty() {
        let outcome = engine.gateway().batch_ingest(&ctx, batch).await?;
        written += outcome.written;
        rejected += outcome.rejected.len();
    }

    println!("✅ Imported {written} samples ({rejected} rejected, {malformed} malformed lines)");

    let stats = engine.query().windowed_stats(window_minutes, signal).await?;
    println!("\n📊 Window of {} minutes ({}):", stats.window_minutes, stats.signal_type);
    println!("  • Samples: {}", stats.sample_count);
    println!("  • Average: {}", stats.average_hz);
    println!("  • Min: {}", stats.min_hz);
    println!("  • Max: {}", stats.max_hz);
    Ok(())
}

async fn handle_sweep(engine: &MetricsEngine) -> AnyhowResult<()> {
    let Some(log) = engine.log_store() else {
        println!("⚠️  Memory backend holds nothing between runs; configure store.backend = \"log\" to sweep");
        return Ok(());
    };

    let reports = engine.retention().sweep_all(engine.clock().now()).await?;
    println!("🧹 Retention sweep:");
    for report in &reports {
        println!("  • {}: {} rows older than {}", report.table, report.purged, report.cutoff);
    }

    let live = log.compact().await?;
    println!("✅ Log compacted to {live} live samples at {}", log.path().display());
    Ok(())
}

// ----------------------------------------------------------------------------
// Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need an engine
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config: LoggingConfig = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }
    info!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let engine = if config_found {
        MetricsEngine::from_config_file(&cli.config)?
    } else {
        MetricsEngine::from_config(config)?
    };

    match cli.command {
        Some(Commands::Import {
            file,
            window_minutes,
            signal,
        }) => {
            handle_import(&engine, &file, window_minutes, signal.as_deref()).await?;
            if let Some(log) = engine.log_store() {
                log.sync().await?;
            }
        }
        Some(Commands::Sweep) => handle_sweep(&engine).await?,
        Some(Commands::Run) | None => engine.run_until_signal().await?,
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}
