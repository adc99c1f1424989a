//! 参照棋譜データベースとのインターフェース

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Color;

/// ある局面で指された1手の集計
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveStats {
    /// UCI または SAN
    #[serde(rename = "move")]
    pub mv: String,
    pub white_wins: u64,
    pub black_wins: u64,
    pub draws: u64,
}

impl MoveStats {
    pub fn new(mv: impl Into<String>, white_wins: u64, black_wins: u64, draws: u64) -> Self {
        Self {
            mv: mv.into(),
            white_wins,
            black_wins,
            draws,
        }
    }

    pub fn total(&self) -> u64 {
        self.white_wins + self.black_wins + self.draws
    }

    pub fn wins_for(&self, color: Color) -> u64 {
        match color {
            Color::White => self.white_wins,
            Color::Black => self.black_wins,
        }
    }

    /// `(手番側の勝ち + 0.5 * 引き分け) / 総数`。総数 0 なら None。
    pub fn score_for(&self, mover: Color) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        Some((self.wins_for(mover) as f64 + 0.5 * self.draws as f64) / total as f64)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("opening database unreachable: {0}")]
    Unreachable(String),

    #[error("opening database query failed: {0}")]
    Query(String),
}

#[async_trait]
pub trait OpeningDatabase: Send + Sync {
    /// 局面で指された手の集計。データがなければ空。
    async fn stats_for_position(&self, fen: &str) -> Result<Vec<MoveStats>, DatabaseError>;
}
