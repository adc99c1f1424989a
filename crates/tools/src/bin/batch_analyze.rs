/// 棋譜を一括解析し、評価値コメント付きの棋譜と損失統計を JSONL に書き出す。
///
/// 入力は1局1行の JSONL（`{"id": "...", "start_fen": "...", "moves": ["e2e4", ...]}`、
/// `start_fen` は省略可）。
///
/// # 使用例
///
/// ```shell
/// cargo run -p tools --release --bin batch_analyze -- \
///   --games data/games.jsonl.gz --engine /usr/local/bin/stockfish \
///   --budget-ms 300 --out "runs/analysis/$(date +%Y%m%d_%H%M%S).jsonl"
/// ```
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Parser as _;
use serde::Serialize;

use rvariant_core::{
    BatchAnalysisCoordinator, BatchConfig, BatchOutcome, CancelFlag, GameRecord, StandardChess,
};
use tools::analysis::{JsonlResultSink, UciGameAnalyzer};
use tools::common::io::read_jsonl;
use tools::uci::UciEngineConfig;

#[derive(clap::Parser, Debug)]
#[command(about = "analyze a batch of games with a UCI engine")]
struct Cli {
    /// Games to analyze (JSONL, optionally .gz; "-" for stdin)
    #[arg(long)]
    games: PathBuf,

    /// UCI engine binary
    #[arg(long)]
    engine: PathBuf,

    /// Additional UCI options (format: "Name=Value", can be repeated)
    #[arg(long = "uci-option", num_args = 1)]
    uci_options: Vec<String>,

    /// Hash size (MiB) per engine
    #[arg(long, default_value_t = 64)]
    hash_mb: u32,

    /// Search time per position (ms)
    #[arg(long)]
    budget_ms: Option<u64>,

    /// Games analyzed concurrently (default: max(1, cpus / 4))
    #[arg(long)]
    batch_size: Option<usize>,

    /// Batch settings (TOML). Command-line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output (JSONL, .gz for compression)
    #[arg(long)]
    out: PathBuf,

    /// Report progress every N seconds
    #[arg(long, default_value_t = 10)]
    report_interval_secs: u64,
}

#[derive(Serialize)]
struct MetaLogEntry<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: String,
    engine: String,
    games: usize,
    batch_size: usize,
    settings: &'a BatchConfig,
}

fn load_config(cli: &Cli) -> Result<BatchConfig> {
    let mut cfg = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            BatchConfig::from_toml_str(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => BatchConfig::default(),
    };
    if cli.batch_size.is_some() {
        cfg.batch_size = cli.batch_size;
    }
    if let Some(v) = cli.budget_ms {
        cfg.search_budget_ms = v;
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    if !cli.engine.is_file() {
        bail!("engine binary not found: {}", cli.engine.display());
    }
    let config = load_config(&cli)?;
    let games: Vec<GameRecord> = read_jsonl(&cli.games)?;
    if games.is_empty() {
        bail!("no games in {}", cli.games.display());
    }

    let engine_cfg = UciEngineConfig {
        hash_mb: cli.hash_mb,
        uci_options: cli.uci_options.clone(),
        ..UciEngineConfig::new(&cli.engine)
    };
    let sink = Arc::new(
        JsonlResultSink::create(&cli.out)
            .with_context(|| format!("failed to create {}", cli.out.display()))?,
    );
    sink.write_meta(&MetaLogEntry {
        kind: "meta",
        timestamp: Local::now().to_rfc3339(),
        engine: engine_cfg.label(),
        games: games.len(),
        batch_size: config.effective_batch_size(),
        settings: &config,
    })?;

    let coordinator = BatchAnalysisCoordinator::new(
        Arc::new(UciGameAnalyzer::new(engine_cfg)),
        sink.clone(),
        Arc::new(StandardChess),
        config,
    );

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nShutting down gracefully...");
            cancel.cancel();
        })
        .ok();
    }

    let mut progress = coordinator.subscribe();
    let interval = Duration::from_secs(cli.report_interval_secs.max(1));
    let reporter = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let p = *progress.borrow_and_update();
            log::info!("progress: {}/{} done ({} failed)", p.finished(), p.total, p.failed);
            if progress.has_changed().is_err() {
                break;
            }
        }
    });

    let outcome = coordinator.run(games, &cancel).await;
    reporter.abort();
    sink.close()?;

    let p = outcome.progress();
    match outcome {
        BatchOutcome::Completed(_) => {
            log::info!("finished: {} saved, {} failed of {}", p.completed, p.failed, p.total)
        }
        BatchOutcome::Cancelled(_) => log::warn!(
            "cancelled: {} saved, {} failed, {} not analyzed",
            p.completed,
            p.failed,
            p.total - p.finished()
        ),
    }
    Ok(())
}
