/// エンジン／棋譜集計を使ってレパートリーツリーを自動展開する。
///
/// # 使用例
///
/// 白番のレパートリーを 6 手分、相手の手は棋譜集計のカバー率 85% で展開:
/// ```shell
/// cargo run -p tools --release --bin build_tree -- \
///   --engine /usr/local/bin/stockfish --threads 4 --hash-mb 256 \
///   --book data/book.json.gz --coverage 85 \
///   --color white --depth 6 --budget-ms 2000 \
///   --cache runs/cache/recommendations.json \
///   --out runs/trees/white.json
/// ```
///
/// 既存ツリーの途中（パス `0.1`）から追加で展開:
/// ```shell
/// cargo run -p tools --release --bin build_tree -- \
///   --tree runs/trees/white.json --start 0.1 --depth 3 \
///   --engine /usr/local/bin/stockfish --out runs/trees/white.json
/// ```
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Parser as _;
use serde::Serialize;

use rvariant_core::{
    BuildConfig, BuildOutcome, BuildReport, CancelFlag, Color, ExclusiveQueue, JsonFileCacheStore,
    MoveTree, Path, RecommendationCache, STARTPOS_FEN, SelectionMode, StandardChess, TreeBuilder,
};
use tools::book::JsonBookDatabase;
use tools::common::io::{open_reader, open_writer};
use tools::uci::{UciEngine, UciEngineConfig};

#[derive(clap::Parser, Debug)]
#[command(about = "expand a chess repertoire tree with an engine and/or an opening book")]
struct Cli {
    /// Existing tree (JSON). A new tree is created when omitted.
    #[arg(long)]
    tree: Option<PathBuf>,

    /// Root FEN for a new tree
    #[arg(long, default_value = STARTPOS_FEN)]
    fen: String,

    /// Moves (UCI or SAN) to place on the mainline of a new tree before building
    #[arg(long, num_args = 1.., value_delimiter = ' ')]
    moves: Vec<String>,

    /// Path of the node to expand from ("0.1.0"; empty or "(root)" for the root)
    #[arg(long, default_value = "")]
    start: String,

    /// Output tree (JSON). May be the same file as --tree.
    #[arg(long)]
    out: PathBuf,

    /// Build settings (TOML). Command-line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Side whose moves are chosen automatically (white|black)
    #[arg(long)]
    color: Option<Color>,

    /// Number of automated moves to add along each line
    #[arg(long)]
    depth: Option<u32>,

    /// Move source for the automated side (engine|database)
    #[arg(long)]
    mode: Option<SelectionMode>,

    /// Engine search time per position (ms)
    #[arg(long)]
    budget_ms: Option<u64>,

    /// Cumulative share of opponent games to cover (percent)
    #[arg(long)]
    coverage: Option<f64>,

    /// UCI engine binary
    #[arg(long)]
    engine: Option<PathBuf>,

    /// Engine label used as the cache key (defaults to the binary name)
    #[arg(long)]
    engine_label: Option<String>,

    /// Threads per engine
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Hash size (MiB) per engine
    #[arg(long, default_value_t = 64)]
    hash_mb: u32,

    /// Additional UCI options (format: "Name=Value", can be repeated)
    #[arg(long = "uci-option", num_args = 1)]
    uci_options: Vec<String>,

    /// Opening statistics (JSON, optionally .gz)
    #[arg(long)]
    book: Option<PathBuf>,

    /// Recommendation cache file (JSON). In-memory when omitted.
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Append a JSONL run report here
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Serialize)]
struct MetaLogEntry<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: String,
    start: String,
    settings: &'a BuildConfig,
    engine: Option<String>,
    book: Option<String>,
    output: String,
}

#[derive(Serialize)]
struct ResultLogEntry<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    outcome: &'static str,
    #[serde(flatten)]
    report: &'a BuildReport,
}

fn load_config(cli: &Cli) -> Result<BuildConfig> {
    let mut cfg = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            BuildConfig::from_toml_str(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => BuildConfig::default(),
    };
    if let Some(v) = cli.color {
        cfg.automated_color = v;
    }
    if let Some(v) = cli.depth {
        cfg.max_depth = v;
    }
    if let Some(v) = cli.mode {
        cfg.mode = v;
    }
    if let Some(v) = cli.budget_ms {
        cfg.search_budget_ms = v;
    }
    if let Some(v) = cli.coverage {
        cfg.coverage_percent = v;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn load_tree(cli: &Cli) -> Result<MoveTree> {
    let Some(path) = &cli.tree else {
        let moves: Vec<&str> = cli.moves.iter().map(String::as_str).collect();
        return Ok(MoveTree::from_line(&StandardChess, &cli.fen, &moves)?);
    };
    if !cli.moves.is_empty() {
        bail!("--moves can only be used when creating a new tree");
    }
    let mut text = String::new();
    open_reader(path)
        .and_then(|mut r| r.read_to_string(&mut text))
        .with_context(|| format!("failed to read {}", path.display()))?;
    let tree: MoveTree =
        serde_json::from_str(&text).with_context(|| format!("invalid tree {}", path.display()))?;
    tree.check_consistency()
        .with_context(|| format!("corrupt tree {}", path.display()))?;
    Ok(tree)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let start: Path = cli.start.parse()?;
    let mut tree = load_tree(&cli)?;

    let cache = match &cli.cache {
        Some(path) => RecommendationCache::new(Arc::new(JsonFileCacheStore::new(path))),
        None => RecommendationCache::in_memory(),
    };
    let mut builder = TreeBuilder::new(Arc::new(StandardChess), Arc::new(cache));

    let engine_label = match &cli.engine {
        Some(path) => {
            if !path.is_file() {
                bail!("engine binary not found: {}", path.display());
            }
            let engine_cfg = UciEngineConfig {
                label: cli.engine_label.clone(),
                threads: cli.threads,
                hash_mb: cli.hash_mb,
                uci_options: cli.uci_options.clone(),
                ..UciEngineConfig::new(path)
            };
            let engine = UciEngine::new(engine_cfg);
            let label = rvariant_core::Engine::id(&engine).to_string();
            builder = builder.with_engine(Arc::new(engine), ExclusiveQueue::new(label.clone()));
            Some(label)
        }
        None => None,
    };
    if let Some(path) = &cli.book {
        let book = JsonBookDatabase::load(path)?;
        builder = builder.with_database(Arc::new(book), ExclusiveQueue::new("book"));
    }

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nShutting down gracefully...");
            cancel.cancel();
        })
        .ok();
    }

    let progress = |path: &Path, san: &str, added: usize| {
        log::info!("[{added}] {path} {san}");
    };
    let timestamp = Local::now();
    let outcome = builder
        .run(&mut tree, &start, &config, &cancel, Some(&progress))
        .await?;

    let mut out = open_writer(&cli.out).with_context(|| format!("failed to create {}", cli.out.display()))?;
    serde_json::to_writer_pretty(&mut out, &tree)?;
    out.close()?;

    let report = outcome.report();
    match &outcome {
        BuildOutcome::Completed(_) => log::info!("added {} nodes", report.nodes_added),
        BuildOutcome::NoProgress(_) => log::warn!("no moves were added"),
        BuildOutcome::Cancelled(_) => log::warn!("cancelled after {} nodes", report.nodes_added),
    }
    log::info!("tree written to {} ({} nodes)", cli.out.display(), tree.len());

    if let Some(path) = &cli.report {
        let mut w = open_writer(path).with_context(|| format!("failed to create {}", path.display()))?;
        w.write_json_line(&MetaLogEntry {
            kind: "meta",
            timestamp: timestamp.to_rfc3339(),
            start: start.to_string(),
            settings: &config,
            engine: engine_label,
            book: cli.book.as_ref().map(|p| p.display().to_string()),
            output: cli.out.display().to_string(),
        })?;
        w.write_json_line(&ResultLogEntry {
            kind: "result",
            outcome: outcome.label(),
            report,
        })?;
        w.close()?;
    }
    Ok(())
}
