//! 局面同一性キー
//!
//! FEN から手数カウンタ（halfmove / fullmove）を取り除き、
//! 盤面・手番・キャスリング権・アンパッサン対象だけを残したものを同一性キーとする。
//! 手順違い（トランスポジション）で到達した局面は同じキーになる。

use serde::{Deserialize, Serialize};

/// 同一性キーを構成する FEN フィールド数（盤面, 手番, キャスリング, ep）
const IDENTITY_FIELDS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionKey(String);

impl PositionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// FEN を同一性キーへ正規化する。
///
/// 全域関数。フィールドが4つに満たない入力は空白を正規化しただけのものを返す。
pub fn canonicalize(fen: &str) -> PositionKey {
    let fields: Vec<&str> = fen.split_whitespace().take(IDENTITY_FIELDS).collect();
    PositionKey(fields.join(" "))
}
