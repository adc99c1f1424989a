//! 棋譜の一括解析
//!
//! 対局を `batch_size` 局ずつ並行に解析し、結果（評価値コメント付き棋譜と
//! 手ごとの損失統計）を保存する。1局の失敗は他の局に影響しない。
//! キャンセル時は実行中のセッションを停止し、保存済みの結果はそのまま残す。

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::cancel::CancelFlag;
use crate::config::BatchConfig;
use crate::position::{PositionError, PositionService, STARTPOS_FEN};
use crate::types::{Color, UciMove};

/// 評価値を損失計算に使う前に丸める範囲（センチポーン）
pub const EVAL_CLAMP_CP: i32 = 1000;
pub const INACCURACY_CP: i32 = 50;
pub const MISTAKE_CP: i32 = 100;
pub const BLUNDER_CP: i32 = 300;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("analysis of game {game_id} failed: {reason}")]
    Analysis { game_id: String, reason: String },

    #[error("saving game {game_id} failed: {reason}")]
    Save { game_id: String, reason: String },

    #[error("game {game_id}: {source}")]
    Position {
        game_id: String,
        #[source]
        source: PositionError,
    },
}

fn default_start_fen() -> String {
    STARTPOS_FEN.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: String,
    #[serde(default = "default_start_fen")]
    pub start_fen: String,
    pub moves: Vec<UciMove>,
}

/// 解析器へ渡す設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisSettings {
    pub budget_ms: u64,
    pub threads: usize,
}

impl AnalysisSettings {
    /// 並行実行する局同士で CPU を奪い合わないよう、1局あたり1スレッドに固定する。
    pub fn single_threaded(budget_ms: u64) -> Self {
        Self {
            budget_ms,
            threads: 1,
        }
    }
}

/// 1局分の解析結果。
///
/// `evaluations[0]` は開始局面、`evaluations[i]` は i 手目の後の局面の評価値で、
/// いずれも白から見たセンチポーン。詰みなど数値のないものは None。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameAnalysis {
    pub evaluations: Vec<Option<i32>>,
}

#[async_trait]
pub trait GameAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        session_id: u64,
        game: &GameRecord,
        settings: &AnalysisSettings,
    ) -> Result<GameAnalysis, BatchError>;

    /// 実行中のセッションを止める。終了済みのセッションに対しては何もしない。
    async fn stop(&self, session_id: u64);
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, game_id: &str, pgn: &str, stats: &GameStats) -> Result<(), BatchError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideStats {
    /// 損失を計算できた手の数
    pub moves: u32,
    pub avg_cp_loss: f64,
    pub inaccuracies: u32,
    pub mistakes: u32,
    pub blunders: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameStats {
    pub white: SideStats,
    pub black: SideStats,
}

impl GameStats {
    /// 各手の前後の評価値から、指した側の損失を集計する。
    pub fn from_evaluations(first_mover: Color, evaluations: &[Option<i32>]) -> Self {
        let mut totals = [0i64; Color::NUM];
        let mut stats = GameStats::default();
        let mut mover = first_mover;
        for pair in evaluations.windows(2) {
            if let (Some(before), Some(after)) = (pair[0], pair[1]) {
                let before = before.clamp(-EVAL_CLAMP_CP, EVAL_CLAMP_CP);
                let after = after.clamp(-EVAL_CLAMP_CP, EVAL_CLAMP_CP);
                let loss = match mover {
                    Color::White => before - after,
                    Color::Black => after - before,
                }
                .max(0);
                let side = stats.side_mut(mover);
                side.moves += 1;
                totals[mover.index()] += i64::from(loss);
                if loss >= BLUNDER_CP {
                    side.blunders += 1;
                } else if loss >= MISTAKE_CP {
                    side.mistakes += 1;
                } else if loss >= INACCURACY_CP {
                    side.inaccuracies += 1;
                }
            }
            mover = mover.opponent();
        }
        for color in [Color::White, Color::Black] {
            let side = stats.side_mut(color);
            if side.moves > 0 {
                side.avg_cp_loss = totals[color.index()] as f64 / f64::from(side.moves);
            }
        }
        stats
    }

    pub fn side(&self, color: Color) -> &SideStats {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    fn side_mut(&mut self, color: Color) -> &mut SideStats {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }
}

/// 評価値コメント付きの棋譜を作る。
pub fn render_pgn(
    positions: &dyn PositionService,
    game: &GameRecord,
    analysis: &GameAnalysis,
) -> Result<String, PositionError> {
    let mut out = String::new();
    let _ = writeln!(out, "[Event \"{}\"]", game.id);
    if game.start_fen != STARTPOS_FEN {
        let _ = writeln!(out, "[SetUp \"1\"]");
        let _ = writeln!(out, "[FEN \"{}\"]", game.start_fen);
    }
    out.push('\n');

    let mut fen = game.start_fen.clone();
    let mut fullmove: u32 = fen
        .split_whitespace()
        .nth(5)
        .and_then(|n| n.parse().ok())
        .unwrap_or(1);
    let mut tokens: Vec<String> = Vec::new();
    for (ply, mv) in game.moves.iter().enumerate() {
        let mover = positions.side_to_move(&fen)?;
        let san = positions.to_san(&fen, mv)?;
        match mover {
            Color::White => tokens.push(format!("{fullmove}.")),
            Color::Black if ply == 0 => tokens.push(format!("{fullmove}...")),
            Color::Black => {}
        }
        tokens.push(san);
        if let Some(Some(cp)) = analysis.evaluations.get(ply + 1) {
            tokens.push(format!("{{{:+.2}}}", f64::from(*cp) / 100.0));
        }
        if mover == Color::Black {
            fullmove += 1;
        }
        fen = positions.apply(&fen, mv)?;
    }
    tokens.push("*".to_string());
    out.push_str(&tokens.join(" "));
    out.push('\n');
    Ok(out)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BatchProgress {
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed(BatchProgress),
    Cancelled(BatchProgress),
}

impl BatchOutcome {
    pub fn progress(&self) -> BatchProgress {
        match self {
            BatchOutcome::Completed(p) | BatchOutcome::Cancelled(p) => *p,
        }
    }
}

pub struct BatchAnalysisCoordinator {
    analyzer: Arc<dyn GameAnalyzer>,
    sink: Arc<dyn ResultSink>,
    positions: Arc<dyn PositionService>,
    config: BatchConfig,
    progress: watch::Sender<BatchProgress>,
}

impl BatchAnalysisCoordinator {
    pub fn new(
        analyzer: Arc<dyn GameAnalyzer>,
        sink: Arc<dyn ResultSink>,
        positions: Arc<dyn PositionService>,
        config: BatchConfig,
    ) -> Self {
        let (progress, _) = watch::channel(BatchProgress::default());
        Self {
            analyzer,
            sink,
            positions,
            config,
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchProgress> {
        self.progress.subscribe()
    }

    pub async fn run(&self, games: Vec<GameRecord>, cancel: &CancelFlag) -> BatchOutcome {
        let batch_size = self.config.effective_batch_size();
        let settings = AnalysisSettings::single_threaded(self.config.search_budget_ms);
        let mut progress = BatchProgress {
            total: games.len(),
            ..BatchProgress::default()
        };
        self.progress.send_replace(progress);
        log::info!("analyzing {} games, {} at a time", games.len(), batch_size);

        let mut next_session: u64 = 0;
        for batch in games.chunks(batch_size) {
            if cancel.is_cancelled() {
                return BatchOutcome::Cancelled(progress);
            }

            let mut tasks = JoinSet::new();
            let mut in_flight = HashSet::new();
            for game in batch {
                next_session += 1;
                let session = next_session;
                in_flight.insert(session);
                let job = GameJob {
                    analyzer: self.analyzer.clone(),
                    sink: self.sink.clone(),
                    positions: self.positions.clone(),
                    game: game.clone(),
                    settings,
                    session,
                };
                tasks.spawn(job.run());
            }

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        log::info!("cancelling {} running analyses", in_flight.len());
                        for session in &in_flight {
                            self.analyzer.stop(*session).await;
                        }
                        tasks.shutdown().await;
                        return BatchOutcome::Cancelled(progress);
                    }
                    joined = tasks.join_next() => {
                        let Some(joined) = joined else { break };
                        match joined {
                            Ok((session, Ok(()))) => {
                                in_flight.remove(&session);
                                progress.completed += 1;
                            }
                            Ok((session, Err(e))) => {
                                in_flight.remove(&session);
                                log::warn!("{e}");
                                progress.failed += 1;
                            }
                            Err(e) => {
                                log::warn!("analysis task aborted: {e}");
                                progress.failed += 1;
                            }
                        }
                        self.progress.send_replace(progress);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return BatchOutcome::Cancelled(progress);
        }
        log::info!(
            "batch analysis finished: {} saved, {} failed",
            progress.completed,
            progress.failed
        );
        BatchOutcome::Completed(progress)
    }
}

struct GameJob {
    analyzer: Arc<dyn GameAnalyzer>,
    sink: Arc<dyn ResultSink>,
    positions: Arc<dyn PositionService>,
    game: GameRecord,
    settings: AnalysisSettings,
    session: u64,
}

impl GameJob {
    async fn run(self) -> (u64, Result<(), BatchError>) {
        let session = self.session;
        (session, self.analyze_and_save().await)
    }

    async fn analyze_and_save(&self) -> Result<(), BatchError> {
        let game_id = &self.game.id;
        let position_err = |source| BatchError::Position {
            game_id: game_id.clone(),
            source,
        };
        let first_mover = self
            .positions
            .side_to_move(&self.game.start_fen)
            .map_err(position_err)?;
        let analysis = self
            .analyzer
            .analyze(self.session, &self.game, &self.settings)
            .await?;
        let pgn = render_pgn(self.positions.as_ref(), &self.game, &analysis).map_err(position_err)?;
        let stats = GameStats::from_evaluations(first_mover, &analysis.evaluations);
        self.sink.save(game_id, &pgn, &stats).await?;
        log::debug!("saved analysis of {game_id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::StandardChess;

    #[test]
    fn test_losses_are_charged_to_the_mover() {
        // 1. e4 (+30 → +20) e5 (+20 → +80) 2. Qh5 (+80 → -300)
        let evals = [Some(30), Some(20), Some(80), Some(-300)];
        let stats = GameStats::from_evaluations(Color::White, &evals);
        assert_eq!(stats.white.moves, 2);
        assert_eq!(stats.white.blunders, 1);
        assert_eq!(stats.white.avg_cp_loss, (10.0 + 380.0) / 2.0);
        assert_eq!(stats.black.moves, 1);
        assert_eq!(stats.black.inaccuracies, 1);
        assert_eq!(stats.black.avg_cp_loss, 60.0);
    }

    #[test]
    fn test_evaluations_are_clamped_and_gaps_skipped() {
        let evals = [Some(5000), Some(-5000), None, Some(0)];
        let stats = GameStats::from_evaluations(Color::White, &evals);
        // +1000 → -1000 として扱う
        assert_eq!(stats.white.moves, 1);
        assert_eq!(stats.white.avg_cp_loss, 2000.0);
        assert_eq!(stats.black.moves, 0);
        assert_eq!(stats.black.avg_cp_loss, 0.0);
    }

    #[test]
    fn test_render_pgn_with_comments() {
        let game = GameRecord {
            id: "g1".to_string(),
            start_fen: STARTPOS_FEN.to_string(),
            moves: vec![UciMove::from("e2e4"), UciMove::from("e7e5"), UciMove::from("g1f3")],
        };
        let analysis = GameAnalysis {
            evaluations: vec![Some(20), Some(35), None, Some(-5)],
        };
        let pgn = render_pgn(&StandardChess, &game, &analysis).unwrap();
        assert!(pgn.starts_with("[Event \"g1\"]\n\n"));
        assert!(pgn.ends_with("1. e4 {+0.35} e5 2. Nf3 {-0.05} *\n"));
    }

    #[test]
    fn test_render_pgn_from_black_to_move() {
        let fen = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";
        let game = GameRecord {
            id: "g2".to_string(),
            start_fen: fen.to_string(),
            moves: vec![UciMove::from("c7c5"), UciMove::from("g1f3")],
        };
        let pgn = render_pgn(&StandardChess, &game, &GameAnalysis::default()).unwrap();
        assert!(pgn.contains("[FEN \""));
        assert!(pgn.ends_with("1... c5 2. Nf3 *\n"));
    }
}
