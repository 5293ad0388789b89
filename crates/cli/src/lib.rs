use anyhow::{Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tilescope_engine::{
    write_csv, CancellationToken, ExportService, HeatmapAssembler, QueryEngine, QueryRequest,
    StatsAggregator,
};
use tilescope_protocol::{serialize_json, serialize_json_pretty};
use tilescope_rules::{CompiledRuleSet, FileRuleSetStore, RuleSet, RuleSetStore};
use tilescope_store::{
    discover_json_files, read_prediction_file, read_source_file, StoreError, TileStore,
};
use wire::{ExportRequest, HeatmapResponse, TilesResponse};

mod config;
mod http_api;
mod report;
mod wire;

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "tilescope")]
#[command(about = "Query, classify and export image-tile quality metrics", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./tilescope.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tile store snapshot path (overrides config and TILESCOPE_STORE)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Directory of saved rule sets (overrides config and TILESCOPE_RULES_DIR)
    #[arg(long, global = true)]
    rules_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest producer JSON files (directories are walked for *.json)
    Ingest(IngestArgs),

    /// Remove an ingested source file and all of its tiles
    Remove(RemoveArgs),

    /// Attach classifier predictions (CSV) to an ingested source file
    IngestPredictions(IngestPredictionsArgs),

    /// Filter, sort and paginate tiles (QueryRequest JSON)
    Query(QueryArgs),

    /// Classify one source file's grid with a rule set
    Heatmap(HeatmapArgs),

    /// Write the per-image rule report as CSV
    Report(ReportArgs),

    /// Export filtered tiles as CSV
    Export(ExportArgs),

    /// Serve the HTTP API
    ServeHttp(ServeArgs),
}

#[derive(Args)]
struct IngestArgs {
    /// Producer JSON files or directories
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Args)]
struct RemoveArgs {
    /// Source file name as ingested, e.g. slide-01.json
    json_filename: String,
}

#[derive(Args)]
struct IngestPredictionsArgs {
    /// Prediction CSV with filepath and predicted_class/raw_score columns
    #[arg(long)]
    csv: PathBuf,

    /// Source file name or image directory the predictions belong to
    #[arg(long)]
    source: String,

    /// Model name recorded on the source file
    #[arg(long)]
    model: String,
}

#[derive(Args)]
struct PayloadArgs {
    /// Inline JSON request (mutually exclusive with --file)
    #[arg(long, conflicts_with = "file")]
    json: Option<String>,

    /// Path to file containing the JSON request
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Args)]
struct QueryArgs {
    #[command(flatten)]
    payload: PayloadArgs,

    /// Pretty-print JSON response
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
struct HeatmapArgs {
    /// Source file name as ingested
    #[arg(long = "file")]
    json_filename: String,

    /// Rule set JSON file, or the name of a saved rule set
    #[arg(long)]
    rules: String,

    /// Pretty-print JSON response
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
struct ReportArgs {
    /// Rule set JSON file, or the name of a saved rule set
    #[arg(long)]
    rule_file: String,

    /// Destination CSV path
    #[arg(long)]
    output_csv: PathBuf,
}

#[derive(Args)]
struct ExportArgs {
    #[command(flatten)]
    payload: PayloadArgs,

    /// Destination CSV path
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args)]
struct ServeArgs {
    /// Bind address, e.g. 127.0.0.1:7700 (default from config)
    #[arg(long)]
    bind: Option<String>,
}

pub async fn main_entry() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        cfg.store_path = store;
    }
    if let Some(dir) = cli.rules_dir {
        cfg.rules_dir = dir;
    }
    log::debug!("Effective config: {cfg:?}");

    match cli.command {
        Commands::Ingest(args) => run_ingest(args, &cfg).await?,
        Commands::Remove(args) => run_remove(args, &cfg).await?,
        Commands::IngestPredictions(args) => run_ingest_predictions(args, &cfg).await?,
        Commands::Query(args) => run_query(args, &cfg).await?,
        Commands::Heatmap(args) => run_heatmap(args, &cfg).await?,
        Commands::Report(args) => run_report(args, &cfg).await?,
        Commands::Export(args) => run_export(args, &cfg).await?,
        Commands::ServeHttp(args) => serve_http(args, cfg).await?,
    }

    Ok(())
}

fn read_payload(args: &PayloadArgs) -> Result<String> {
    if let Some(raw) = &args.json {
        return Ok(raw.clone());
    }
    if let Some(path) = &args.file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read JSON from {}", path.display()));
    }

    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("Failed to read JSON from stdin")?;

    if buffer.trim().is_empty() {
        anyhow::bail!("Request is empty. Provide --json, --file, or pipe JSON via stdin.");
    }

    Ok(buffer)
}

async fn open_store(cfg: &Config) -> Result<TileStore> {
    TileStore::load_or_empty(&cfg.store_path)
        .await
        .with_context(|| format!("Failed to load tile store {}", cfg.store_path.display()))
}

fn rule_store(cfg: &Config) -> FileRuleSetStore {
    FileRuleSetStore::new(&cfg.rules_dir).with_timeout(cfg.rule_store_timeout)
}

/// An existing file is read as rule set JSON; anything else is looked up
/// by name in the rules directory.
async fn resolve_rules(cfg: &Config, spec: &str) -> Result<CompiledRuleSet> {
    let path = Path::new(spec);
    if path.is_file() {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read rule set {}", path.display()))?;
        let rule_set: RuleSet = serde_json::from_str(&text)
            .with_context(|| format!("Invalid rule set JSON in {}", path.display()))?;
        return CompiledRuleSet::compile(&rule_set)
            .with_context(|| format!("Invalid rule set {}", path.display()));
    }
    rule_store(cfg)
        .load_compiled(spec)
        .await
        .with_context(|| format!("Failed to load rule set '{spec}'"))
}

fn render_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<String> {
    if pretty {
        serialize_json_pretty(value)
    } else {
        serialize_json(value)
    }
}

async fn run_ingest(args: IngestArgs, cfg: &Config) -> Result<()> {
    let files = discover_json_files(&args.paths);
    if files.is_empty() {
        anyhow::bail!("No *.json files found under the given paths");
    }

    let mut builder = open_store(cfg).await?.into_builder();
    let mut failed = 0usize;
    for path in &files {
        let batch = match read_source_file(path).await {
            Ok(batch) => batch,
            Err(err) => {
                log::warn!("Skipping {}: {err}", path.display());
                failed += 1;
                continue;
            }
        };
        let name = batch.json_filename.clone();
        let (tiles, skipped) = (batch.tiles.len(), batch.skipped);
        match builder.add_source(batch) {
            Ok(Some(_)) => print_stdout(&format!(
                "Ingested {name}: {tiles} tiles ({skipped} skipped)"
            ))?,
            Ok(None) => print_stdout(&format!("Already ingested: {name}"))?,
            Err(err @ StoreError::DuplicateTile { .. }) => {
                log::warn!("Skipping {}: {err}", path.display());
                failed += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }

    let store = builder.build()?;
    store
        .save(&cfg.store_path)
        .await
        .with_context(|| format!("Failed to save tile store {}", cfg.store_path.display()))?;
    print_stdout(&format!(
        "Store {}: {} source files, {} tiles",
        cfg.store_path.display(),
        store.source_files().len(),
        store.len()
    ))?;

    if failed > 0 {
        anyhow::bail!("{failed} of {} files could not be ingested", files.len());
    }
    Ok(())
}

async fn run_remove(args: RemoveArgs, cfg: &Config) -> Result<()> {
    let mut builder = open_store(cfg).await?.into_builder();
    let removed = builder.remove_source(&args.json_filename)?;
    let store = builder.build()?;
    store
        .save(&cfg.store_path)
        .await
        .with_context(|| format!("Failed to save tile store {}", cfg.store_path.display()))?;
    print_stdout(&format!(
        "Removed {} ({removed} tiles)",
        args.json_filename
    ))
}

async fn run_ingest_predictions(args: IngestPredictionsArgs, cfg: &Config) -> Result<()> {
    let batch = read_prediction_file(&args.csv, &args.model)
        .await
        .with_context(|| format!("Failed to read predictions {}", args.csv.display()))?;
    let mut builder = open_store(cfg).await?.into_builder();
    let outcome = builder.attach_predictions(&args.source, &batch)?;
    let store = builder.build()?;
    store
        .save(&cfg.store_path)
        .await
        .with_context(|| format!("Failed to save tile store {}", cfg.store_path.display()))?;

    let json_filename = store
        .source_file(outcome.source_file_id)
        .map_or(args.source.as_str(), |s| s.json_filename.as_str());
    print_stdout(&format!(
        "Attached {} predictions from {} to {json_filename} ({} unmatched, {} skipped)",
        outcome.matched, batch.model_name, outcome.unmatched, batch.skipped
    ))
}

async fn run_query(args: QueryArgs, cfg: &Config) -> Result<()> {
    let raw = read_payload(&args.payload)?;
    let request: QueryRequest = serde_json::from_str(&raw).context("Invalid query request JSON")?;
    let store = open_store(cfg).await?;
    let page = QueryEngine::new(&store).query(&request)?;
    print_stdout(&render_json(&TilesResponse::from(page), args.pretty)?)
}

async fn run_heatmap(args: HeatmapArgs, cfg: &Config) -> Result<()> {
    let rules = resolve_rules(cfg, &args.rules).await?;
    let store = open_store(cfg).await?;
    let heatmap = HeatmapAssembler::new(&store)
        .with_max_cells(cfg.max_grid_cells)
        .assemble_by_name(&args.json_filename, &rules)?;
    print_stdout(&render_json(
        &HeatmapResponse::new(&heatmap, &rules),
        args.pretty,
    )?)
}

async fn run_report(args: ReportArgs, cfg: &Config) -> Result<()> {
    let rules = resolve_rules(cfg, &args.rule_file).await?;
    let store = open_store(cfg).await?;
    let reports = StatsAggregator::new(&store).per_image_report(&rules, &CancellationToken::new())?;

    let file = create_output(&args.output_csv)?;
    let rows = report::write_rule_report(&reports, io::BufWriter::new(file))?;
    print_stdout(&format!(
        "Wrote {rows} rows for {} source files to {}",
        reports.len(),
        args.output_csv.display()
    ))
}

async fn run_export(args: ExportArgs, cfg: &Config) -> Result<()> {
    let raw = read_payload(&args.payload)?;
    let request: ExportRequest =
        serde_json::from_str(&raw).context("Invalid export request JSON")?;
    let store = open_store(cfg).await?;
    let rows = ExportService::new(&store)
        .with_limit(cfg.export_csv_limit)
        .export(&request.filters, &request.sort)?;

    let file = create_output(&args.output)?;
    write_csv(&rows, io::BufWriter::new(file), &CancellationToken::new())?;
    print_stdout(&format!(
        "Exported {} rows to {}",
        rows.len(),
        args.output.display()
    ))
}

fn create_output(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))
}

async fn serve_http(args: ServeArgs, cfg: Config) -> Result<()> {
    let bind = args.bind.unwrap_or_else(|| cfg.bind.clone());
    let store = open_store(&cfg).await?;
    let state = Arc::new(http_api::AppState {
        store: Arc::new(store),
        rules: Arc::new(rule_store(&cfg)),
        export_csv_limit: cfg.export_csv_limit,
        max_grid_cells: cfg.max_grid_cells,
    });
    log::info!(
        "Serving {} tiles from {} source files",
        state.store.len(),
        state.store.source_files().len()
    );

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    let base_url = format!("http://{}", listener.local_addr()?);

    print_stdout(&format!("Serving tilescope API: {base_url}"))?;
    print_stdout(&format!("Try: curl {base_url}/health"))?;

    axum::serve(listener, http_api::router(state)).await?;
    Ok(())
}
