//! Stream processor CLI
//!
//! Runs a pipeline described by a YAML file over JSON-lines inputs.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use stream_processor::{
    FileCheckpointStorage, JsonLinesSink, JsonLinesSource, OperatorKind, PipelineConfig,
    RunOutcome, RunSummary, StreamProcessorBuilder,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Value = serde_json::Value;

#[derive(Parser)]
#[command(
    name = "streamctl",
    version,
    about = "Run event-time stream processing pipelines",
    long_about = "Runs a windowed aggregation or interval join over JSON-lines files.\n\n\
                  Each input line is a record: {\"key\": ..., \"value\": ..., \"event_time\": <ms>}.\n\
                  Settings come from the YAML file, overridden by STREAM_* environment variables."
)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline to completion
    #[command(name = "run", about = "Run a pipeline over JSON-lines inputs")]
    Run {
        /// Pipeline configuration
        #[arg(short, long, value_name = "FILE", env = "STREAM_CONFIG")]
        config: Option<PathBuf>,

        /// Input file; a join takes exactly two (left, then right)
        #[arg(short, long = "input", value_name = "PATH", required = true)]
        inputs: Vec<PathBuf>,

        /// Output file for results
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,

        /// Output file for late and poison records
        #[arg(long, value_name = "PATH")]
        side_output: Option<PathBuf>,

        /// Output file for batches the main output rejected
        #[arg(long, value_name = "PATH")]
        dead_letter: Option<PathBuf>,

        /// Pipeline name used in logs
        #[arg(long, default_value = "streamctl")]
        name: String,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a configuration file without running it
    #[command(name = "validate", about = "Validate a pipeline configuration")]
    Validate {
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Validate { config } => {
            let config = load_config(config.as_deref())?;
            config.operator_spec()?;
            println!("{} configuration is valid", "✓".green().bold());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run {
            config,
            inputs,
            output,
            side_output,
            dead_letter,
            name,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            let summary = run_pipeline(config, name, &inputs, output, side_output, dead_letter).await?;
            print_summary(&summary, json)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let config = PipelineConfig::load(path).context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn source_for(path: &Path, config: &PipelineConfig) -> JsonLinesSource<Value> {
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    JsonLinesSource::new(id, path).with_out_of_orderness(config.watermark_delay())
}

async fn run_pipeline(
    config: PipelineConfig,
    name: String,
    inputs: &[PathBuf],
    output: PathBuf,
    side_output: Option<PathBuf>,
    dead_letter: Option<PathBuf>,
) -> anyhow::Result<RunSummary> {
    let storage = FileCheckpointStorage::new(&config.checkpoint_dir, config.checkpoint_retention)
        .await
        .with_context(|| format!("cannot open checkpoint directory {}", config.checkpoint_dir.display()))?;

    let mut builder = StreamProcessorBuilder::<Value>::new()
        .with_name(name)
        .with_config(config.clone())
        .with_checkpoint_storage(storage)
        .with_sink(JsonLinesSink::new(&output));

    match config.operator {
        OperatorKind::Join => {
            let [left, right] = inputs else {
                bail!("a join needs exactly two inputs, got {}", inputs.len());
            };
            builder = builder
                .with_left_source(source_for(left, &config))
                .with_right_source(source_for(right, &config));
        }
        OperatorKind::Aggregate => {
            for input in inputs {
                builder = builder.with_source(source_for(input, &config));
            }
        }
    }
    if let Some(path) = side_output {
        builder = builder.with_side_output_sink(JsonLinesSink::new(path));
    }
    if let Some(path) = dead_letter {
        builder = builder.with_dead_letter_sink(JsonLinesSink::new(path));
    }

    let mut processor = builder.build()?;
    let shutdown = processor.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, stopping");
                shutdown.shutdown();
            }
            Err(e) => warn!(error = %e, "Cannot listen for interrupts"),
        }
    });

    Ok(processor.run().await?)
}

fn print_summary(summary: &RunSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    let outcome = match summary.outcome {
        RunOutcome::Completed => "completed".green().bold(),
        RunOutcome::Stopped => "stopped".yellow().bold(),
    };
    println!("{} {}", summary.pipeline.cyan().bold(), outcome);
    if let Some(id) = summary.restored_from {
        println!("  restored from checkpoint {}", id);
    }
    let stats = &summary.stats;
    println!("  records in:         {}", stats.records_in);
    println!("  outputs written:    {}", stats.outputs_written);
    println!("  side outputs:       {}", stats.side_outputs);
    println!("  poison records:     {}", stats.poison_records);
    println!("  dead-lettered:      {}", stats.dead_lettered);
    println!("  sink retries:       {}", stats.sink_retries);
    println!("  restarts:           {}", stats.restarts);
    println!("  checkpoints:        {} (last {})", stats.checkpoints_completed, stats.last_checkpoint_id);
    let late = &summary.late_records;
    println!(
        "  late records:       {} dropped, {} side output, {} re-emitted",
        late.dropped, late.side_output, late.reemitted
    );
    println!("  duration:           {} ms", summary.duration_ms);
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("stream_processor=debug,streamctl=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new("stream_processor=info,warn")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
