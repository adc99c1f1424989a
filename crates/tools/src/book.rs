//! JSON ファイルの棋譜集計を `OpeningDatabase` として使う。
//!
//! 形式は FEN をキー、その局面で指された手の集計を値とするオブジェクト:
//!
//! ```json
//! { "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1":
//!     [ { "move": "e4", "white_wins": 50, "black_wins": 30, "draws": 20 } ] }
//! ```
//!
//! キーは読み込み時に同一性キーへ正規化するので、手数欄は一致しなくてよい。

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rvariant_core::database::DatabaseError;
use rvariant_core::{MoveStats, OpeningDatabase, PositionKey, canonicalize};

use crate::common::io::open_reader;

#[derive(Debug, Default)]
pub struct JsonBookDatabase {
    entries: HashMap<PositionKey, Vec<MoveStats>>,
}

impl JsonBookDatabase {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let mut text = String::new();
        open_reader(p)
            .and_then(|mut r| r.read_to_string(&mut text))
            .with_context(|| format!("failed to read book {}", p.display()))?;
        Self::from_json_str(&text).with_context(|| format!("invalid book {}", p.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, Vec<MoveStats>> = serde_json::from_str(text)?;
        let mut entries: HashMap<PositionKey, Vec<MoveStats>> = HashMap::new();
        for (fen, moves) in raw {
            // 手数違いの同一局面は集計を連結する
            entries.entry(canonicalize(&fen)).or_default().extend(moves);
        }
        log::info!("loaded opening book with {} positions", entries.len());
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl OpeningDatabase for JsonBookDatabase {
    async fn stats_for_position(&self, fen: &str) -> Result<Vec<MoveStats>, DatabaseError> {
        Ok(self.entries.get(&canonicalize(fen)).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvariant_core::STARTPOS_FEN;

    #[tokio::test]
    async fn lookup_ignores_move_counters() {
        let book = JsonBookDatabase::from_json_str(
            r#"{
                "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 7": [
                    { "move": "e4", "white_wins": 5, "black_wins": 3, "draws": 2 },
                    { "move": "d2d4", "white_wins": 4, "black_wins": 4, "draws": 2 }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(book.len(), 1);
        let stats = book.stats_for_position(STARTPOS_FEN).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].mv, "e4");
        assert!(book.stats_for_position("8/8/8/8/8/8/8/K6k w - - 0 1").await.unwrap().is_empty());
    }

    #[test]
    fn malformed_book_is_an_error() {
        assert!(JsonBookDatabase::from_json_str("[1, 2]").is_err());
    }
}
