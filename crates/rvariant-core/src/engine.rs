//! エンジン（外部探索プロセス）とのインターフェース

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::UciMove;

/// エンジンが返す候補手1本分
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineLine {
    pub uci: UciMove,
    /// 手番側から見た評価値（センチポーン）。詰みなどで数値がない場合は None。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_cp: Option<i32>,
}

impl EngineLine {
    pub fn new(uci: impl Into<UciMove>, score_cp: Option<i32>) -> Self {
        Self {
            uci: uci.into(),
            score_cp,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{engine}: engine unreachable: {reason}")]
    Unreachable { engine: String, reason: String },

    #[error("{engine}: search failed: {reason}")]
    Search { engine: String, reason: String },
}

/// 局面を評価して候補手を返す外部エンジン。
///
/// 実装は1セッション分の状態を持つ前提で、同時呼び出しの直列化は
/// 呼び出し側（`ExclusiveQueue`）の責任。
#[async_trait]
pub trait Engine: Send + Sync {
    /// キャッシュのキーに使う識別子（エンジン名 + 設定など）
    fn id(&self) -> &str;

    /// 少なくとも `min_lines` 本（合法手が足りなければそれ以下）の候補を順位順に返す。
    async fn best_lines(
        &self,
        fen: &str,
        min_lines: usize,
        budget_ms: u64,
    ) -> Result<Vec<EngineLine>, EngineError>;

    /// 実行中の探索を止める。
    async fn stop(&self, session_id: u64) -> Result<(), EngineError>;
}
