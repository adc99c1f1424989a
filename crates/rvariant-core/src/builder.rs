//! バリエーションツリーの自動構築
//!
//! 開始ノードから深さ優先に展開する。各局面で
//! 1. キャンセル確認
//! 2. 他のパスが同じ局面を所有していれば展開しない（トランスポジション）
//! 3. 手番に応じてポリシーに手を問い合わせる
//! 4. 提案された手を順に子として追加し、その子を展開する
//!
//! 深さは自動化側の手を指すたびに1減る。再帰の代わりに明示的なスタックを使う。

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::cache::RecommendationCache;
use crate::cancel::CancelFlag;
use crate::config::{BuildConfig, ConfigError, SelectionMode};
use crate::database::{DatabaseError, OpeningDatabase};
use crate::engine::{Engine, EngineError};
use crate::identity::{PositionKey, canonicalize};
use crate::ownership::{Claim, OwnershipMap};
use crate::policy::{CoverageGuided, EngineGuided, MoveSelectionPolicy, PolicyContext};
use crate::position::{PositionError, PositionService};
use crate::queue::{ExclusiveQueue, QueueError};
use crate::tree::{MoveTree, NodeId, Path};
use crate::types::UciMove;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("start position at {path} is invalid: {source}")]
    InvalidStartPosition {
        path: String,
        #[source]
        source: PositionError,
    },

    #[error("start path {0} does not exist in the tree")]
    InvalidPath(String),

    #[error("engine unavailable: {0}")]
    EngineUnavailable(#[source] EngineError),

    #[error("opening database unavailable: {0}")]
    DatabaseUnavailable(#[source] DatabaseError),

    #[error("no move source configured for {0} mode")]
    NoSelectionSource(SelectionMode),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// 外部サービスへの問い合わせ回数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryStats {
    pub engine_queries: usize,
    pub database_queries: usize,
    pub cache_hits: usize,
}

impl QueryStats {
    /// まだ1度も問い合わせていないか（呼び出し側はこの後で件数を増やす）
    pub(crate) fn begin_query(&self) -> bool {
        self.engine_queries + self.database_queries == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub nodes_added: usize,
    #[serde(flatten)]
    pub queries: QueryStats,
    /// 既に他のパスが所有する局面に到達して展開しなかった子
    pub transpositions: usize,
    /// 提案が空だった（または問い合わせに失敗した）局面
    pub skipped_nodes: usize,
    pub added_paths: Vec<Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Completed(BuildReport),
    /// 1手も追加されなかった
    NoProgress(BuildReport),
    Cancelled(BuildReport),
}

impl BuildOutcome {
    pub fn report(&self) -> &BuildReport {
        match self {
            BuildOutcome::Completed(r) | BuildOutcome::NoProgress(r) | BuildOutcome::Cancelled(r) => r,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BuildOutcome::Completed(_) => "completed",
            BuildOutcome::NoProgress(_) => "no progress",
            BuildOutcome::Cancelled(_) => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuilderState {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// ノード追加の通知先
pub trait BuildProgress: Send + Sync {
    fn node_added(&self, path: &Path, san: &str, nodes_added: usize);
}

impl<F> BuildProgress for F
where
    F: Fn(&Path, &str, usize) + Send + Sync,
{
    fn node_added(&self, path: &Path, san: &str, nodes_added: usize) {
        self(path, san, nodes_added)
    }
}

struct EngineSource {
    engine: Arc<dyn Engine>,
    queue: ExclusiveQueue,
}

struct DatabaseSource {
    database: Arc<dyn OpeningDatabase>,
    queue: ExclusiveQueue,
}

pub struct TreeBuilder {
    positions: Arc<dyn PositionService>,
    cache: Arc<RecommendationCache>,
    engine: Option<EngineSource>,
    database: Option<DatabaseSource>,
    state: BuilderState,
}

impl TreeBuilder {
    pub fn new(positions: Arc<dyn PositionService>, cache: Arc<RecommendationCache>) -> Self {
        Self {
            positions,
            cache,
            engine: None,
            database: None,
            state: BuilderState::Idle,
        }
    }

    /// エンジンを登録する。`queue` はそのエンジン専用であること。
    pub fn with_engine(mut self, engine: Arc<dyn Engine>, queue: ExclusiveQueue) -> Self {
        self.engine = Some(EngineSource { engine, queue });
        self
    }

    pub fn with_database(mut self, database: Arc<dyn OpeningDatabase>, queue: ExclusiveQueue) -> Self {
        self.database = Some(DatabaseSource { database, queue });
        self
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    /// `start` のノードから展開する。
    ///
    /// 追加されたノードは `tree` に残る（キャンセル時も含む）。
    pub async fn run(
        &mut self,
        tree: &mut MoveTree,
        start: &Path,
        config: &BuildConfig,
        cancel: &CancelFlag,
        progress: Option<&dyn BuildProgress>,
    ) -> Result<BuildOutcome, BuildError> {
        self.state = BuilderState::Running;
        let result = self.run_inner(tree, start, config, cancel, progress).await;
        self.state = match &result {
            Ok(BuildOutcome::Cancelled(_)) => BuilderState::Cancelled,
            Ok(_) => BuilderState::Completed,
            Err(_) => BuilderState::Failed,
        };
        result
    }

    async fn run_inner(
        &self,
        tree: &mut MoveTree,
        start: &Path,
        config: &BuildConfig,
        cancel: &CancelFlag,
        progress: Option<&dyn BuildProgress>,
    ) -> Result<BuildOutcome, BuildError> {
        config.validate()?;
        let start_id = tree
            .resolve(start)
            .ok_or_else(|| BuildError::InvalidPath(start.to_string()))?;
        self.positions
            .validate(tree.node(start_id).fen())
            .map_err(|source| BuildError::InvalidStartPosition {
                path: start.to_string(),
                source,
            })?;

        let policies = self.policies(config)?;
        self.cache.reset_availability();
        let ownership = OwnershipMap::seeded_from(tree);
        let mut run = BuildRun {
            tree,
            config,
            positions: self.positions.as_ref(),
            policies,
            ownership,
            created_keys: HashSet::new(),
            report: BuildReport::default(),
            cancel,
            progress,
        };
        log::info!(
            "building from {start} (policy={}, automated={}, depth={}, known positions={})",
            run.policies.automated.name(),
            config.automated_color,
            config.max_depth,
            run.ownership.len()
        );

        let cancelled = run.expand_from(start_id, start.clone()).await?;
        let report = run.report;
        log::info!(
            "build finished: {} nodes added, {} engine / {} database queries, {} cache hits, {} transpositions",
            report.nodes_added,
            report.queries.engine_queries,
            report.queries.database_queries,
            report.queries.cache_hits,
            report.transpositions
        );
        Ok(if cancelled {
            BuildOutcome::Cancelled(report)
        } else if report.nodes_added == 0 {
            BuildOutcome::NoProgress(report)
        } else {
            BuildOutcome::Completed(report)
        })
    }

    fn engine_policy(&self, config: &BuildConfig) -> Option<EngineGuided> {
        self.engine.as_ref().map(|src| {
            EngineGuided::new(
                src.engine.clone(),
                src.queue.clone(),
                self.cache.clone(),
                self.positions.clone(),
            )
            .with_budget_ms(config.search_budget_ms)
            .with_min_lines(config.min_lines)
            .with_tie_break_cp(config.tie_break_cp)
        })
    }

    fn book_policy(&self, config: &BuildConfig) -> Option<CoverageGuided> {
        self.database.as_ref().map(|src| {
            CoverageGuided::new(
                src.database.clone(),
                src.queue.clone(),
                self.positions.clone(),
                config.automated_color,
            )
            .with_coverage(config.coverage_percent, config.min_book_moves)
            .with_min_games(config.min_games)
        })
    }

    fn policies(&self, config: &BuildConfig) -> Result<Policies, BuildError> {
        let automated = match config.mode {
            SelectionMode::Engine => self.engine_policy(config).map(MoveSelectionPolicy::from),
            SelectionMode::Database => self.book_policy(config).map(MoveSelectionPolicy::from),
        }
        .ok_or(BuildError::NoSelectionSource(config.mode))?;
        Ok(Policies {
            automated,
            book: self.book_policy(config),
            engine: self.engine_policy(config),
        })
    }
}

/// 手番ごとの問い合わせ先
///
/// - 自動化側: `automated`。DB モードで候補がなければ `engine` で補う。
/// - 相手側: `book` のカバー率。DB がない、または候補がなければ `engine` の応手1手。
struct Policies {
    automated: MoveSelectionPolicy,
    book: Option<CoverageGuided>,
    engine: Option<EngineGuided>,
}

impl Policies {
    async fn for_automated(
        &self,
        ctx: &PolicyContext<'_>,
        stats: &mut QueryStats,
    ) -> Result<Vec<UciMove>, BuildError> {
        let moves = self.automated.propose(ctx, stats).await?;
        if !moves.is_empty() || matches!(self.automated, MoveSelectionPolicy::Engine(_)) {
            return Ok(moves);
        }
        self.engine_reply(ctx, stats).await
    }

    async fn for_opponent(
        &self,
        ctx: &PolicyContext<'_>,
        stats: &mut QueryStats,
    ) -> Result<Vec<UciMove>, BuildError> {
        if let Some(book) = &self.book {
            let moves = book.propose(ctx, stats).await?;
            if !moves.is_empty() {
                return Ok(moves);
            }
        }
        self.engine_reply(ctx, stats).await
    }

    async fn engine_reply(
        &self,
        ctx: &PolicyContext<'_>,
        stats: &mut QueryStats,
    ) -> Result<Vec<UciMove>, BuildError> {
        match &self.engine {
            Some(engine) => Ok(engine.propose(ctx, stats).await?.into_iter().collect()),
            None => Ok(Vec::new()),
        }
    }
}

/// 展開待ちの局面1つ分。`pending` が未作成なら、まだポリシーに問い合わせていない。
struct Frame {
    node: NodeId,
    path: Path,
    depth_left: u32,
    pending: Option<VecDeque<UciMove>>,
}

/// 1回の実行の状態
struct BuildRun<'a> {
    tree: &'a mut MoveTree,
    config: &'a BuildConfig,
    positions: &'a dyn PositionService,
    policies: Policies,
    ownership: OwnershipMap,
    /// この実行で作ったノードの同一性キー
    created_keys: HashSet<PositionKey>,
    report: BuildReport,
    cancel: &'a CancelFlag,
    progress: Option<&'a dyn BuildProgress>,
}

impl BuildRun<'_> {
    /// 深さ優先で展開する。キャンセルされたら true。
    async fn expand_from(&mut self, start: NodeId, start_path: Path) -> Result<bool, BuildError> {
        let mut stack = vec![Frame {
            node: start,
            path: start_path,
            depth_left: self.config.max_depth,
            pending: None,
        }];

        while let Some(frame) = stack.last_mut() {
            if frame.pending.is_none() {
                if self.cancel.is_cancelled() {
                    return Ok(true);
                }
                let moves = self.propose_at(frame.node, &frame.path, frame.depth_left).await?;
                frame.pending = Some(moves.into());
            }

            let next = frame.pending.as_mut().and_then(|p| p.pop_front());
            let Some(mv) = next else {
                stack.pop();
                continue;
            };
            let (parent, parent_path, depth_left) = (frame.node, frame.path.clone(), frame.depth_left);

            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            if let Some(child) = self.add_child(parent, &parent_path, depth_left, &mv)? {
                stack.push(child);
            }
        }
        Ok(false)
    }

    /// この局面で追加すべき手。展開対象外なら空。
    async fn propose_at(
        &mut self,
        node: NodeId,
        path: &Path,
        depth_left: u32,
    ) -> Result<Vec<UciMove>, BuildError> {
        if depth_left == 0 {
            return Ok(Vec::new());
        }
        let fen = self.tree.node(node).fen().to_string();
        let key = canonicalize(&fen);
        if self.ownership.is_owned_by_other(&key, path) {
            self.report.transpositions += 1;
            log::debug!("{path}: position is expanded elsewhere, skipping");
            return Ok(Vec::new());
        }
        self.ownership.claim(key, path);

        let side_to_move = self.positions.side_to_move(&fen)?;
        let ctx = PolicyContext {
            tree: &*self.tree,
            ownership: &self.ownership,
            node,
            path,
            fen: &fen,
            side_to_move,
        };

        let moves = if side_to_move == self.config.automated_color {
            self.policies.for_automated(&ctx, &mut self.report.queries).await?
        } else {
            self.policies.for_opponent(&ctx, &mut self.report.queries).await?
        };

        if moves.is_empty() {
            self.report.skipped_nodes += 1;
            log::debug!("{path}: no move proposed for {side_to_move}");
        }
        Ok(moves)
    }

    /// 子を追加（または既存の子を再利用）し、展開すべきなら次のフレームを返す。
    fn add_child(
        &mut self,
        parent: NodeId,
        parent_path: &Path,
        depth_left: u32,
        mv: &UciMove,
    ) -> Result<Option<Frame>, BuildError> {
        let parent_fen = self.tree.node(parent).fen().to_string();
        let mover = self.positions.side_to_move(&parent_fen)?;

        // この実行で作ったノードへの合流は、ノードを作らずに打ち切る
        let san = self.positions.to_san(&parent_fen, mv)?;
        if self.tree.child_by_san(parent, &san).is_none() {
            let key = canonicalize(&self.positions.apply(&parent_fen, mv)?);
            if self.created_keys.contains(&key) {
                if let Some(owner) = self.ownership.owner(&key) {
                    self.report.transpositions += 1;
                    log::debug!("{parent_path}: {san} transposes into {owner}, not added");
                    return Ok(None);
                }
            }
        }

        let added = self.tree.add_move(self.positions, parent, mv)?;
        let child_path = parent_path.child(added.index);
        let child = self.tree.node(added.id);
        let san = child.san().unwrap_or_default().to_string();
        let key = canonicalize(child.fen());

        if added.created {
            self.created_keys.insert(key.clone());
            self.report.nodes_added += 1;
            self.report.added_paths.push(child_path.clone());
            log::debug!("{child_path}: added {san}");
            if let Some(progress) = self.progress {
                progress.node_added(&child_path, &san, self.report.nodes_added);
            }
        }

        if let Claim::OwnedBy(owner) = self.ownership.claim(key, &child_path) {
            self.report.transpositions += 1;
            log::debug!("{child_path}: {san} transposes into {owner}");
            return Ok(None);
        }

        let depth_left = if mover == self.config.automated_color {
            depth_left.saturating_sub(1)
        } else {
            depth_left
        };
        Ok(Some(Frame {
            node: added.id,
            path: child_path,
            depth_left,
            pending: None,
        }))
    }
}
