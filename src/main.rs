use anyhow::{Context, Result};
use bestpick::config::{parse_name, Config};
use bestpick::core::metrics::{MetricName, MetricProvider};
use bestpick::core::similarity::BlendRule;
use bestpick::pipeline::{Pipeline, RunReport};
use bestpick::services::cache::CACHE_FILE;
use bestpick::services::{
    CachedProvider, DiscoveryOptions, DiscoveryService, HistoryRecord, HistoryService,
    ImageAnalyzer, LocalFileOps, RestoreSelection,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use dialoguer::Confirm;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "bestpick", version, about = "Pick the best photo of every group of similar shots")]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Group, rank and place images
    Run(RunArgs),

    /// Work with run history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directories to scan
    #[arg(short, long = "input", value_name = "DIR", required = true)]
    inputs: Vec<PathBuf>,
    /// Output directory
    #[arg(short, long, value_name = "DIR")]
    output: PathBuf,
    /// JSON config file (default: the per-user config, if present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Only show what would be done
    #[arg(long)]
    dry_run: bool,
    /// symlink, copy or move
    #[arg(long, value_name = "OP")]
    operation: Option<String>,
    /// Operation for the winners only, e.g. copy the best and move the rest
    #[arg(long, value_name = "OP")]
    best_operation: Option<String>,
    /// How files reach the collection directory: symlink or copy
    #[arg(long, value_name = "OP")]
    collection_operation: Option<String>,
    /// Leave a symlink behind at every moved source
    #[arg(long)]
    backlinks: bool,
    /// Use an existing output directory and replace files earlier runs wrote
    #[arg(long, conflicts_with = "skip_existing")]
    force: bool,
    /// Use an existing output directory, renaming around files already there
    #[arg(long)]
    skip_existing: bool,

    /// Similarity threshold in [0, 1]
    #[arg(long, value_name = "T", conflicts_with = "preset")]
    threshold: Option<f64>,
    /// Named threshold, e.g. almost_same or similar
    #[arg(long, value_name = "NAME")]
    preset: Option<String>,
    /// max, embedding_only, region_only or weighted:<w>
    #[arg(long, value_name = "RULE")]
    blend: Option<BlendRule>,
    /// Number of region crops compared (0 disables)
    #[arg(long, value_name = "N")]
    regions: Option<usize>,

    /// Primary metrics in priority order, comma separated
    #[arg(long, value_name = "METRICS", value_delimiter = ',')]
    primary: Option<Vec<String>>,
    /// Secondary metric weight, e.g. --weight sharpness=2
    #[arg(long = "weight", value_name = "METRIC=W")]
    weights: Vec<String>,
    /// newest or oldest
    #[arg(long, value_name = "WHICH")]
    prefer: Option<String>,

    /// hierarchical, hash, numeric or parent_only
    #[arg(long, value_name = "STRATEGY")]
    collision: Option<String>,
    /// mirror, parent_only or flat
    #[arg(long, value_name = "LAYOUT")]
    layout: Option<String>,
    /// Candidate group directory name, e.g. "{filename}_{width}x{height}"
    #[arg(long, value_name = "PATTERN")]
    naming_pattern: Option<String>,
    /// Do not place non-winning group members
    #[arg(long)]
    no_candidates: bool,
    /// Also gather every winner into one flat directory
    #[arg(long)]
    collect: bool,
    /// Leave images without duplicates out of best/
    #[arg(long)]
    no_singletons: bool,

    /// Per-computation timeout in milliseconds (0 disables)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    /// Extensions to include, comma separated
    #[arg(long, value_name = "EXTS", value_delimiter = ',')]
    extensions: Option<Vec<String>>,
    /// Directory names to skip
    #[arg(long, value_name = "NAME")]
    exclude_dir: Vec<String>,
    /// Ignore files smaller than this many bytes
    #[arg(long, value_name = "BYTES")]
    min_size: Option<u64>,
    #[arg(long)]
    follow_symlinks: bool,
    #[arg(long)]
    no_recursive: bool,

    /// Do not ask before moving files
    #[arg(short, long)]
    yes: bool,
    /// Write the full run report as JSON
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
    /// Show progress bars
    #[arg(long)]
    progress: bool,
    /// Do not read or write the descriptor cache
    #[arg(long)]
    no_cache: bool,
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all run records
    List {
        /// Output directory of the runs
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
    },

    /// Undo the moves of a run
    Restore {
        /// Output directory of the runs
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
        /// Restore a specific record index
        #[arg(long, conflicts_with = "all")]
        record: Option<usize>,
        /// Restore all move records
        #[arg(long, conflicts_with = "record")]
        all: bool,
    },
}

impl RunArgs {
    /// Layer command line flags over the loaded config.
    fn apply(&self, config: &mut Config) -> Result<()> {
        if self.dry_run {
            config.dry_run = true;
        }
        if let Some(op) = &self.operation {
            config.operation = parse_name(op).with_context(|| format!("Unknown operation {op:?}"))?;
        }
        if let Some(op) = &self.best_operation {
            config.best_operation =
                Some(parse_name(op).with_context(|| format!("Unknown operation {op:?}"))?);
        }
        if let Some(op) = &self.collection_operation {
            config.collection_operation =
                parse_name(op).with_context(|| format!("Unknown operation {op:?}"))?;
        }
        if self.backlinks {
            config.create_backlinks = true;
        }
        if self.force {
            config.force = true;
        }
        if let Some(threshold) = self.threshold {
            config.similarity_threshold = threshold;
            config.similarity_preset = None;
        }
        if let Some(preset) = &self.preset {
            config.similarity_preset =
                Some(parse_name(preset).with_context(|| format!("Unknown preset {preset:?}"))?);
        }
        if let Some(blend) = self.blend {
            config.blend = blend;
        }
        if let Some(regions) = self.regions {
            config.region_count = regions;
        }
        if let Some(primary) = &self.primary {
            config.primary_metrics = primary
                .iter()
                .map(|m| parse_name::<MetricName>(m).with_context(|| format!("Unknown metric {m:?}")))
                .collect::<Result<_>>()?;
        }
        for arg in &self.weights {
            let Some((metric, weight)) = arg.split_once('=') else {
                anyhow::bail!("Expected METRIC=WEIGHT, got {arg:?}");
            };
            let metric: MetricName =
                parse_name(metric).with_context(|| format!("Unknown metric {metric:?}"))?;
            let weight: f64 = weight
                .parse()
                .with_context(|| format!("Invalid weight {weight:?} for {metric}"))?;
            config.metric_weights.insert(metric, weight);
        }
        if let Some(prefer) = &self.prefer {
            config.date_preference =
                parse_name(prefer).with_context(|| format!("Unknown date preference {prefer:?}"))?;
        }
        if let Some(strategy) = &self.collision {
            config.collision_strategy = parse_name(strategy)
                .with_context(|| format!("Unknown collision strategy {strategy:?}"))?;
        }
        if let Some(layout) = &self.layout {
            config.layout = parse_name(layout).with_context(|| format!("Unknown layout {layout:?}"))?;
        }
        if let Some(pattern) = &self.naming_pattern {
            config.naming_pattern = pattern.clone();
        }
        if self.no_candidates {
            config.retain_candidates = false;
        }
        if self.collect {
            config.collect_results = true;
        }
        if self.no_singletons {
            config.include_singletons = false;
        }
        if let Some(ms) = self.timeout_ms {
            config.metric_timeout_ms = ms;
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        Ok(())
    }

    fn discovery_options(&self, output: &Path) -> DiscoveryOptions {
        let mut options = DiscoveryOptions {
            exclude_dirs: self.exclude_dir.clone(),
            follow_symlinks: self.follow_symlinks,
            recursive: !self.no_recursive,
            skip: vec![output.to_path_buf()],
            show_progress: self.progress,
            ..Default::default()
        };
        if let Some(exts) = &self.extensions {
            options.extensions = exts
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect();
        }
        if let Some(min) = self.min_size {
            options.min_size = min;
        }
        options
    }
}

fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set up logging: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::History { command } => match command {
            HistoryCmd::List { output } => list_history(&output),
            HistoryCmd::Restore { output, record, all } => {
                let selection = match (record, all) {
                    (_, true) => RestoreSelection::All,
                    (Some(idx), false) => RestoreSelection::Record(idx),
                    (None, false) => RestoreSelection::Latest,
                };
                let summary = HistoryService::new(&output).restore(selection)?;
                println!(
                    "🔄 Restored {} file(s), skipped {}",
                    summary.restored, summary.skipped
                );
                println!("🧹 Updated history, removed {} record(s)", summary.records);
                Ok(())
            }
        },
    }
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = Config::load_layered(args.config.as_deref()).context("Failed to load config")?;
    args.apply(&mut config)?;
    config.validate().context("Invalid configuration")?;

    let output = std::path::absolute(&args.output)
        .with_context(|| format!("Failed to resolve output directory {:?}", args.output))?;
    let inputs = args
        .inputs
        .iter()
        .map(|p| std::path::absolute(p).with_context(|| format!("Failed to resolve {:?}", p)))
        .collect::<Result<Vec<_>>>()?;

    if output.exists() {
        if !output.is_dir() {
            anyhow::bail!("Output {:?} exists and is not a directory", output);
        }
        let occupied = fs::read_dir(&output)
            .with_context(|| format!("Could not read output directory {:?}", output))?
            .next()
            .is_some();
        if occupied && !args.force && !args.skip_existing {
            anyhow::bail!(
                "Output directory {:?} is not empty; pass --force or --skip-existing",
                output
            );
        }
    }

    println!("▶ Scanning {} input director(ies)", inputs.len());
    let paths = DiscoveryService::new().discover(&inputs, &args.discovery_options(&output))?;
    if paths.is_empty() {
        println!("No images found.");
        return Ok(());
    }

    if config.moves_files() && !config.dry_run && !args.yes {
        let proceed = Confirm::new()
            .with_prompt(format!("Move {} image(s) into {}?", paths.len(), output.display()))
            .default(false)
            .interact()?;
        if !proceed {
            println!("Aborted; no files were changed.");
            return Ok(());
        }
    }

    let analyzer: Arc<dyn MetricProvider> = Arc::new(ImageAnalyzer::new());
    let cache = (!args.no_cache)
        .then(|| Arc::new(CachedProvider::open(analyzer.clone(), output.join(CACHE_FILE))));
    let provider: Arc<dyn MetricProvider> = match &cache {
        Some(cache) => cache.clone() as Arc<dyn MetricProvider>,
        None => analyzer,
    };

    let history = HistoryService::new(&output);
    let prior_targets = if config.force {
        history.prior_targets()?
    } else {
        Vec::new()
    };

    println!("▶ Processing {} images…", paths.len());
    let start = Instant::now();
    let pipeline = Pipeline::new(config.clone(), provider, Arc::new(LocalFileOps::new()))
        .with_prior_targets(prior_targets)
        .with_progress(args.progress);
    let report = pipeline.run(&inputs, paths, &output);
    println!("⏱ Run took {:.2?}", start.elapsed());

    print_report(&report);

    if !report.dry_run {
        if let Some(execution) = report.execution.as_ref().filter(|e| !e.completed.is_empty()) {
            history.append(&HistoryRecord::from_report(execution, config.operation))?;
            println!("\n✅ Recorded run history in {}", history.path().display());
        }
        if let Some(cache) = &cache {
            cache.save()?;
        }
    }

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("Failed to write report {:?}", path))?;
        println!("📝 Wrote report to {}", path.display());
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let tag = if report.dry_run { "[dry-run] " } else { "" };
    for (i, group) in report.groups.iter().enumerate() {
        if group.candidates.is_empty() && group.excluded.is_empty() {
            continue;
        }
        println!("\n✨ Group {}:", i + 1);
        if let Some(winner) = &group.winner {
            println!("   🏆 Keeping → {}", winner.display());
        }
        for candidate in &group.candidates {
            println!("   📦 {}", candidate.display());
        }
        for excluded in &group.excluded {
            println!("   ❔ unscored {}", excluded.display());
        }
    }

    println!(
        "\n{}{} images, {} evaluated, {} group(s) with duplicates",
        tag,
        report.total_images,
        report.evaluated,
        report.duplicate_groups()
    );
    if let Some(execution) = &report.execution {
        let (completed, failed, excluded) = execution.categories();
        println!(
            "{}{} placed, {} failed, {} left in place",
            tag, completed, failed, excluded
        );
    }
    for (kind, count) in report.failures_by_kind() {
        eprintln!("⚠️  {}: {}", kind, count);
    }
    if report.cancelled {
        eprintln!("⚠️  Run was stopped before placement");
    }
    if report.dry_run {
        println!("\n⚠️  Dry-run only; no files were changed.");
    }
}

fn list_history(output: &Path) -> Result<()> {
    let history = HistoryService::new(output);
    let records = history.load()?;
    if records.is_empty() {
        println!("No history in {}", history.path().display());
        return Ok(());
    }
    println!("🗂️  Run History:");
    for (i, rec) in records.iter().enumerate() {
        println!(
            "[{}] {}\n     operation: {}\n     files: {}",
            i,
            rec.timestamp,
            rec.operation,
            rec.entries.len()
        );
        for entry in &rec.entries {
            log::info!("{:?}: {} → {}", entry.role, entry.source.display(), entry.target.display());
        }
    }
    Ok(())
}
