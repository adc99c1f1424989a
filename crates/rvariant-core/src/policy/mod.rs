//! 指し手選択ポリシー
//!
//! ビルダーは各局面で「どの手を子として追加するか」をポリシーに問い合わせる。
//! - `EngineGuided`: エンジンの最善手（キャッシュ・タイブレーク付き）
//! - `CoverageGuided`: 棋譜データベースの集計（相手側はカバー率、自動化側は勝率）

mod coverage;
mod engine;

pub use coverage::{CoverageGuided, select_best_scoring, select_by_coverage};
pub use engine::{EngineGuided, choose_line};

use crate::builder::{BuildError, QueryStats};
use crate::ownership::OwnershipMap;
use crate::tree::{MoveTree, NodeId, Path};
use crate::types::{Color, UciMove};

/// 1局面分の問い合わせ内容
pub struct PolicyContext<'a> {
    pub tree: &'a MoveTree,
    pub ownership: &'a OwnershipMap,
    pub node: NodeId,
    pub path: &'a Path,
    pub fen: &'a str,
    pub side_to_move: Color,
}

/// 外部サービスへの問い合わせの結果を分類する。
///
/// その実行で最初の問い合わせが失敗した場合だけ致命的エラーとし、
/// 以降の失敗はその局面をスキップする（空の提案）。
pub(crate) enum QueryFailure {
    Fatal(BuildError),
    Skip,
}

pub enum MoveSelectionPolicy {
    Engine(EngineGuided),
    Coverage(CoverageGuided),
}

impl MoveSelectionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            MoveSelectionPolicy::Engine(_) => "engine",
            MoveSelectionPolicy::Coverage(_) => "coverage",
        }
    }

    /// 追加すべき手を優先順に返す。空ならこの局面は展開しない。
    pub async fn propose(
        &self,
        ctx: &PolicyContext<'_>,
        stats: &mut QueryStats,
    ) -> Result<Vec<UciMove>, BuildError> {
        match self {
            MoveSelectionPolicy::Engine(p) => Ok(p.propose(ctx, stats).await?.into_iter().collect()),
            MoveSelectionPolicy::Coverage(p) => p.propose(ctx, stats).await,
        }
    }
}

impl From<EngineGuided> for MoveSelectionPolicy {
    fn from(p: EngineGuided) -> Self {
        MoveSelectionPolicy::Engine(p)
    }
}

impl From<CoverageGuided> for MoveSelectionPolicy {
    fn from(p: CoverageGuided) -> Self {
        MoveSelectionPolicy::Coverage(p)
    }
}
