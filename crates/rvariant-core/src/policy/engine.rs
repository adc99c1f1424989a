use std::sync::Arc;

use super::{PolicyContext, QueryFailure};
use crate::builder::{BuildError, QueryStats};
use crate::cache::{CacheLookup, RecommendationCache};
use crate::engine::{Engine, EngineLine};
use crate::identity::canonicalize;
use crate::position::PositionService;
use crate::queue::ExclusiveQueue;
use crate::types::UciMove;

/// エンジンの推奨手を1手だけ提案する。
pub struct EngineGuided {
    engine: Arc<dyn Engine>,
    queue: ExclusiveQueue,
    cache: Arc<RecommendationCache>,
    positions: Arc<dyn PositionService>,
    budget_ms: u64,
    min_lines: usize,
    tie_break_cp: i32,
}

impl EngineGuided {
    pub fn new(
        engine: Arc<dyn Engine>,
        queue: ExclusiveQueue,
        cache: Arc<RecommendationCache>,
        positions: Arc<dyn PositionService>,
    ) -> Self {
        Self {
            engine,
            queue,
            cache,
            positions,
            budget_ms: 1000,
            min_lines: crate::config::DEFAULT_MIN_LINES,
            tie_break_cp: crate::config::DEFAULT_TIE_BREAK_CP,
        }
    }

    pub fn with_budget_ms(mut self, budget_ms: u64) -> Self {
        self.budget_ms = budget_ms;
        self
    }

    pub fn with_min_lines(mut self, min_lines: usize) -> Self {
        self.min_lines = min_lines.max(1);
        self
    }

    pub fn with_tie_break_cp(mut self, tie_break_cp: i32) -> Self {
        self.tie_break_cp = tie_break_cp;
        self
    }

    pub async fn propose(
        &self,
        ctx: &PolicyContext<'_>,
        stats: &mut QueryStats,
    ) -> Result<Option<UciMove>, BuildError> {
        let key = canonicalize(ctx.fen);
        let engine_id = self.engine.id().to_string();

        match self.cache.lookup(&key, &engine_id, self.budget_ms).await {
            CacheLookup::Fresh(rec) | CacheLookup::Reused { rec, .. } => {
                if self.positions.parse_move(ctx.fen, rec.recommended_move.as_str()).is_ok() {
                    stats.cache_hits += 1;
                    return Ok(Some(rec.recommended_move));
                }
                log::debug!("cached move {} is illegal at {}, re-querying", rec.recommended_move, key);
            }
            CacheLookup::Stale(rec) => {
                log::debug!(
                    "cached move for {key} searched {}ms < {}ms, re-querying",
                    rec.search_budget_ms,
                    self.budget_ms
                );
            }
            CacheLookup::Miss => {}
        }

        let lines = match self.query(ctx.fen, stats).await {
            Ok(lines) => lines,
            Err(QueryFailure::Fatal(e)) => return Err(e),
            Err(QueryFailure::Skip) => return Ok(None),
        };

        // 合法手だけを残し、表記を正規化する
        let lines: Vec<EngineLine> = lines
            .into_iter()
            .filter_map(|line| match self.positions.parse_move(ctx.fen, line.uci.as_str()) {
                Ok(uci) => Some(EngineLine::new(uci, line.score_cp)),
                Err(e) => {
                    log::debug!("{}: dropping engine line: {e}", self.engine.id());
                    None
                }
            })
            .collect();
        let Some(top) = lines.first() else {
            log::debug!("{}: no legal candidate at {}", self.engine.id(), ctx.path);
            return Ok(None);
        };

        // キャッシュには常に第1候補を記録する
        self.cache.put(&key, &engine_id, &top.uci, self.budget_ms).await;

        let chosen = choose_line(&lines, self.tie_break_cp, |mv| self.reinforces_tree(ctx, mv));
        if chosen.uci != top.uci {
            log::debug!(
                "{}: preferring {} over {} at {} (already in tree)",
                self.engine.id(),
                chosen.uci,
                top.uci,
                ctx.path
            );
        }
        Ok(Some(chosen.uci.clone()))
    }

    async fn query(
        &self,
        fen: &str,
        stats: &mut QueryStats,
    ) -> Result<Vec<EngineLine>, QueryFailure> {
        let first = stats.begin_query();
        stats.engine_queries += 1;

        let engine = self.engine.clone();
        let fen_owned = fen.to_string();
        let (min_lines, budget_ms) = (self.min_lines, self.budget_ms);
        let result = self
            .queue
            .run(async move { engine.best_lines(&fen_owned, min_lines, budget_ms).await })
            .await;

        match result {
            Ok(Ok(lines)) => Ok(lines),
            Ok(Err(e)) if first => Err(QueryFailure::Fatal(BuildError::EngineUnavailable(e))),
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

    /// 次善手を選ぶと既存ツリーを補強するか。
    ///
    /// 同じ SAN の子が既にある、または手の後の局面を別のパスが所有している場合。
    fn reinforces_tree(&self, ctx: &PolicyContext<'_>, mv: &UciMove) -> bool {
        if let Ok(san) = self.positions.to_san(ctx.fen, mv) {
            if ctx.tree.child_by_san(ctx.node, &san).is_some() {
                return true;
            }
        }
        match self.positions.apply(ctx.fen, mv) {
            Ok(fen) => ctx.ownership.owner(&canonicalize(&fen)).is_some(),
            Err(_) => false,
        }
    }
}

/// 上位2候補の差が `tie_break_cp` 以内で、第2候補が `prefer` を満たすなら第2候補を選ぶ。
///
/// 評価値のない候補（詰みなど）が絡む場合は常に第1候補。`lines` は空であってはならない。
pub fn choose_line<F>(lines: &[EngineLine], tie_break_cp: i32, prefer: F) -> &EngineLine
where
    F: Fn(&UciMove) -> bool,
{
    let top = &lines[0];
    if let Some(second) = lines.get(1) {
        if let (Some(a), Some(b)) = (top.score_cp, second.score_cp) {
            let diff = a.saturating_sub(b);
            if (0..=tie_break_cp).contains(&diff) && prefer(&second.uci) {
                return second;
            }
        }
    }
    top
}
