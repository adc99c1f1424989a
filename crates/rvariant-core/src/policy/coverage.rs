use std::sync::Arc;

use super::{PolicyContext, QueryFailure};
use crate::builder::{BuildError, QueryStats};
use crate::database::{MoveStats, OpeningDatabase};
use crate::position::PositionService;
use crate::queue::ExclusiveQueue;
use crate::types::{Color, UciMove};

/// 棋譜データベースの集計から手を選ぶ。
///
/// 相手側の手番では実戦で多く指された手を、累積頻度が `coverage_percent` に
/// 達するまで（最低 `min_book_moves` 手）採用する。自動化側の手番では
/// 最も勝率の高い手を1手だけ採用する。
pub struct CoverageGuided {
    database: Arc<dyn OpeningDatabase>,
    queue: ExclusiveQueue,
    positions: Arc<dyn PositionService>,
    automated_color: Color,
    coverage_percent: f64,
    min_book_moves: usize,
    min_games: u64,
}

impl CoverageGuided {
    pub fn new(
        database: Arc<dyn OpeningDatabase>,
        queue: ExclusiveQueue,
        positions: Arc<dyn PositionService>,
        automated_color: Color,
    ) -> Self {
        Self {
            database,
            queue,
            positions,
            automated_color,
            coverage_percent: 80.0,
            min_book_moves: 1,
            min_games: 1,
        }
    }

    pub fn with_coverage(mut self, coverage_percent: f64, min_book_moves: usize) -> Self {
        self.coverage_percent = coverage_percent;
        self.min_book_moves = min_book_moves;
        self
    }

    pub fn with_min_games(mut self, min_games: u64) -> Self {
        self.min_games = min_games;
        self
    }

    pub async fn propose(
        &self,
        ctx: &PolicyContext<'_>,
        stats: &mut QueryStats,
    ) -> Result<Vec<UciMove>, BuildError> {
        let rows = match self.query(ctx.fen, stats).await {
            Ok(rows) => rows,
            Err(QueryFailure::Fatal(e)) => return Err(e),
            Err(QueryFailure::Skip) => return Ok(Vec::new()),
        };

        // 表記を UCI に揃え、解釈できない・非合法な手は捨てる
        let rows: Vec<MoveStats> = rows
            .into_iter()
            .filter_map(|row| match self.positions.parse_move(ctx.fen, &row.mv) {
                Ok(uci) => Some(MoveStats { mv: uci.into_string(), ..row }),
                Err(e) => {
                    log::debug!("dropping database move: {e}");
                    None
                }
            })
            .collect();
        let rows = merge_by_move(rows);

        let picked: Vec<usize> = if ctx.side_to_move == self.automated_color {
            select_best_scoring(&rows, ctx.side_to_move, self.min_games)
                .into_iter()
                .collect()
        } else {
            select_by_coverage(&rows, self.coverage_percent, self.min_book_moves)
        };
        Ok(picked.into_iter().map(|i| UciMove::new(rows[i].mv.clone())).collect())
    }

    async fn query(&self, fen: &str, stats: &mut QueryStats) -> Result<Vec<MoveStats>, QueryFailure> {
        let first = stats.begin_query();
        stats.database_queries += 1;

        let database = self.database.clone();
        let fen_owned = fen.to_string();
        let result = self
            .queue
            .run(async move { database.stats_for_position(&fen_owned).await })
            .await;

        match result {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) if first => Err(QueryFailure::Fatal(BuildError::DatabaseUnavailable(e))),
            Err(e) if first => Err(QueryFailure::Fatal(BuildError::Queue(e))),
            Ok(Err(e)) => {
                log::warn!("skipping {fen}: {e}");
                Err(QueryFailure::Skip)
            }
            Err(e) => {
                log::warn!("skipping {fen}: {e}");
                Err(QueryFailure::Skip)
            }
        }
    }
}

/// 同じ手の行（SAN と UCI の表記違いなど）を1行にまとめる。順序は初出順。
fn merge_by_move(rows: Vec<MoveStats>) -> Vec<MoveStats> {
    let mut merged: Vec<MoveStats> = Vec::with_capacity(rows.len());
    for row in rows {
        match merged.iter_mut().find(|m| m.mv == row.mv) {
            Some(m) => {
                m.white_wins += row.white_wins;
                m.black_wins += row.black_wins;
                m.draws += row.draws;
            }
            None => merged.push(row),
        }
    }
    merged
}

/// 対局数の多い順に、累積割合が `coverage_percent` に達するまで選ぶ。
///
/// 少なくとも `min_moves` 手（候補がそれ以上あれば）を選ぶ。対局数が同じ手は入力順。
/// 返り値は `stats` の添字。
pub fn select_by_coverage(stats: &[MoveStats], coverage_percent: f64, min_moves: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..stats.len()).filter(|&i| stats[i].total() > 0).collect();
    order.sort_by(|&a, &b| stats[b].total().cmp(&stats[a].total()));

    let grand_total: u64 = order.iter().map(|&i| stats[i].total()).sum();
    if grand_total == 0 {
        return Vec::new();
    }
    let target = coverage_percent / 100.0;

    let mut picked = Vec::new();
    let mut covered = 0u64;
    for i in order {
        if picked.len() >= min_moves && covered as f64 / grand_total as f64 >= target {
            break;
        }
        picked.push(i);
        covered += stats[i].total();
    }
    picked
}

/// 手番側から見たスコアが最も高い手。同点なら入力順で先のもの。
pub fn select_best_scoring(stats: &[MoveStats], mover: Color, min_games: u64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, s) in stats.iter().enumerate() {
        if s.total() < min_games.max(1) {
            continue;
        }
        let Some(score) = s.score_for(mover) else {
            continue;
        };
        if best.is_none_or(|(_, b)| score > b) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coverage_stops_once_target_reached() {
        let stats = vec![
            MoveStats::new("e2e4", 50, 30, 20),
            MoveStats::new("d2d4", 20, 10, 10),
            MoveStats::new("c2c4", 5, 3, 2),
        ];
        // e4 単独で 66.7%、d4 を加えて 93.3%
        assert_eq!(select_by_coverage(&stats, 80.0, 1), vec![0, 1]);
        assert_eq!(select_by_coverage(&stats, 60.0, 1), vec![0]);
        assert_eq!(select_by_coverage(&stats, 60.0, 3), vec![0, 1, 2]);
        assert_eq!(select_by_coverage(&stats, 100.0, 1), vec![0, 1, 2]);
    }

    #[test]
    fn test_rows_for_the_same_move_are_merged() {
        let merged = merge_by_move(vec![
            MoveStats::new("e2e4", 30, 5, 5),
            MoveStats::new("d2d4", 50, 0, 0),
            MoveStats::new("e2e4", 10, 20, 10),
        ]);
        assert_eq!(
            merged,
            vec![MoveStats::new("e2e4", 40, 25, 15), MoveStats::new("d2d4", 50, 0, 0)]
        );
    }

    #[test]
    fn test_coverage_orders_by_frequency() {
        let stats = vec![
            MoveStats::new("a2a3", 1, 0, 0),
            MoveStats::new("e2e4", 10, 0, 0),
            MoveStats::new("h2h3", 0, 0, 0),
        ];
        assert_eq!(select_by_coverage(&stats, 95.0, 1), vec![1, 0]);
        assert!(select_by_coverage(&[], 80.0, 1).is_empty());
    }

    #[test]
    fn test_best_scoring_respects_mover_and_min_games() {
        let stats = vec![
            MoveStats::new("e7e5", 40, 40, 20),
            MoveStats::new("c7c5", 30, 50, 20),
            MoveStats::new("a7a6", 0, 2, 0),
        ];
        assert_eq!(select_best_scoring(&stats, Color::Black, 1), Some(2));
        assert_eq!(select_best_scoring(&stats, Color::Black, 10), Some(1));
        assert_eq!(select_best_scoring(&stats, Color::White, 10), Some(0));
        assert_eq!(select_best_scoring(&[], Color::White, 1), None);
    }
}
