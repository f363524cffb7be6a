//! pipegraph-bench: CLI tool for graph layout experimentation and diagnostics.
//!
//! Flattens and lays out a pipeline tree read from a JSON file, optionally
//! overlaying a live job map, and prints per-stage diagnostics. Useful for:
//!
//! - Checking how a backend tree renders before wiring up a view
//! - Comparing directions and spacing settings
//! - Measuring flatten and layout cost on large pipelines
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin pipegraph-bench -- [OPTIONS] <TREE_PATH>
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use pipegraph_core::diagnostics::{Clock, GraphDiagnostics, build_graph_with_diagnostics};
use pipegraph_core::{
    BlockTemplate, EngineConfig, FlattenContext, FlattenOptions, JobMap, JobRecord,
    LayoutConfig, PipelineNode, Reconciler, StatusCode, bucket_by_status, job_map,
    progress_label, status_label,
};
use tracing_subscriber::EnvFilter;

/// Pipeline graph layout experimentation and diagnostics for pipegraph.
///
/// Reads a pipeline tree (and optionally its jobs) as JSON, builds the
/// positioned graph, and prints timing and count diagnostics.
#[derive(Parser)]
#[command(name = "pipegraph-bench", version)]
struct Cli {
    /// Path to the pipeline tree JSON (root node with nested children).
    tree_path: PathBuf,

    /// Path to a JSON array of job records for live status.
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// Direction in which ranks advance.
    #[arg(long, value_enum, default_value_t = CliDirection::Lr)]
    direction: CliDirection,

    /// Omit the pipeline root and its outgoing edges.
    #[arg(long)]
    exclude_root: bool,

    /// Status code that stops an edge from animating.
    #[arg(long, default_value_t = StatusCode::DONE.get(), allow_negative_numbers = true)]
    completion_code: i64,

    /// Maximum accepted tree nesting.
    #[arg(long, default_value_t = FlattenOptions::DEFAULT_MAX_DEPTH, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    max_depth: usize,

    /// Node box width.
    #[arg(long, default_value_t = LayoutConfig::DEFAULT_NODE_WIDTH)]
    node_width: f64,

    /// Node box height.
    #[arg(long, default_value_t = LayoutConfig::DEFAULT_NODE_HEIGHT)]
    node_height: f64,

    /// Gap between ranks.
    #[arg(long, default_value_t = LayoutConfig::DEFAULT_RANK_SEPARATION)]
    rank_separation: f64,

    /// Gap between nodes of one rank.
    #[arg(long, default_value_t = LayoutConfig::DEFAULT_NODE_SEPARATION)]
    node_separation: f64,

    /// Disable the per-node sub-pixel jitter.
    #[arg(long)]
    no_jitter: bool,

    /// Highlight this node as selected.
    #[arg(long)]
    selected: Option<String>,

    /// Splice an unsaved block under this node.
    #[arg(long)]
    add_under: Option<String>,

    /// Name of the block spliced by `--add-under`.
    #[arg(long, default_value = "new block")]
    add_name: String,

    /// Write the positioned graph as JSON to this file.
    #[arg(long)]
    layout_out: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full engine config as a JSON string.
    ///
    /// When provided, all other flattening and layout flags are ignored.
    /// The JSON must be a valid `EngineConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,
}

/// Layout direction selection.
#[derive(Clone, Copy, ValueEnum)]
enum CliDirection {
    /// Left to right.
    Lr,
    /// Top to bottom.
    Tb,
}

/// Build an [`EngineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<EngineConfig, String> {
    let config = match cli.config_json {
        Some(ref json) => serde_json::from_str(json)
            .map_err(|e| format!("Error parsing --config-json: {e}"))?,
        None => EngineConfig {
            flatten: FlattenOptions {
                include_root: !cli.exclude_root,
                completion_code: StatusCode(cli.completion_code),
                max_depth: cli.max_depth,
            },
            layout: LayoutConfig {
                direction: match cli.direction {
                    CliDirection::Lr => pipegraph_core::Direction::LeftRight,
                    CliDirection::Tb => pipegraph_core::Direction::TopBottom,
                },
                node_width: cli.node_width,
                node_height: cli.node_height,
                rank_separation: cli.rank_separation,
                node_separation: cli.node_separation,
                jitter: !cli.no_jitter,
            },
            ..EngineConfig::default()
        },
    };
    config
        .validate()
        .map_err(|e| format!("Invalid configuration: {e}"))?;
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("Error parsing {}: {e}", path.display()))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let config = config_from_cli(cli)?;
    let tree: PipelineNode = read_json(&cli.tree_path)?;
    tracing::debug!(path = %cli.tree_path.display(), children = tree.children.len(), "tree loaded");
    let jobs: Option<JobMap> = match cli.jobs {
        Some(ref path) => Some(job_map(read_json::<Vec<JobRecord>>(path)?)),
        None => None,
    };

    let virtual_node = match cli.add_under {
        Some(ref parent_id) => {
            let mut reconciler = Reconciler::new();
            let template = BlockTemplate {
                name: cli.add_name.clone(),
                ..BlockTemplate::default()
            };
            let empty = JobMap::new();
            reconciler.add_block(Some(&tree), parent_id, &template, jobs.as_ref().unwrap_or(&empty));
            reconciler.virtual_node()
        }
        None => None,
    };
    let context = FlattenContext {
        selected_id: cli.selected.as_deref(),
        virtual_node: virtual_node.as_ref(),
        jobs: jobs.as_ref(),
    };

    eprintln!("Tree: {}", cli.tree_path.display());
    eprintln!("Config: {config:#?}");
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    if let Some(ref jobs) = jobs {
        print_job_buckets(jobs);
    }

    let mut all_diagnostics = Vec::with_capacity(cli.runs);
    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        let (layout, diagnostics) =
            build_graph_with_diagnostics(&tree, &context, &config, &StdClock)
                .map_err(|e| format!("Graph error: {e}"))?;

        if cli.json {
            let json = serde_json::to_string_pretty(&diagnostics)
                .map_err(|e| format!("Error serializing diagnostics: {e}"))?;
            println!("{json}");
        } else {
            println!("{}", diagnostics.report());
        }

        // Write the layout on the first run only.
        if run == 0
            && let Some(ref out) = cli.layout_out
        {
            let json = serde_json::to_string_pretty(&layout)
                .map_err(|e| format!("Error serializing layout: {e}"))?;
            match std::fs::write(out, &json) {
                Ok(()) => eprintln!("Layout written to {} ({} bytes)", out.display(), json.len()),
                Err(e) => eprintln!("Error writing layout to {}: {e}", out.display()),
            }
        }

        all_diagnostics.push(diagnostics);

        if cli.runs > 1 {
            eprintln!();
        }
    }

    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }
    Ok(())
}

/// Print the job map grouped by status.
fn print_job_buckets(jobs: &JobMap) {
    println!("Jobs by status\n{}", "=".repeat(60));
    for bucket in bucket_by_status(jobs.values()) {
        println!("{} ({})", status_label(bucket.status), bucket.jobs.len());
        for job in bucket.jobs {
            println!(
                "  {:<12} {:<24} {}",
                job.id,
                job.name,
                progress_label(job.status, &job.tasks)
            );
        }
    }
    println!();
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Function pointer type for extracting a stage duration from diagnostics.
type StageExtractor = fn(&GraphDiagnostics) -> Duration;

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[GraphDiagnostics]) {
    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<12} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(28));

    let stage_extractors: &[(&str, StageExtractor)] = &[
        ("Flatten", |d| d.flatten.duration),
        ("Layout", |d| d.layout.duration),
    ];

    for (name, extractor) in stage_extractors {
        let total: f64 = all_diagnostics
            .iter()
            .map(|d| extractor(d).as_secs_f64() * 1000.0)
            .sum();
        let stage_mean = total / all_diagnostics.len() as f64;
        println!("{name:<12} {stage_mean:>10.3}ms");
    }
}
