//! 局面サービス
//!
//! FEN 文字列を単位として、合法手列挙・指し手適用・手番判定・SAN 生成を行う。
//! ルールそのものは持たず、`StandardChess` が shakmaty に委譲する。

use shakmaty::fen::Fen;
use shakmaty::san::{San, SanPlus};
use shakmaty::uci::UciMove as Uci;
use shakmaty::{CastlingMode, Chess, EnPassantMode, Move, Position};
use thiserror::Error;

use crate::types::{Color, UciMove};

/// 平手初期局面
pub const STARTPOS_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PositionError {
    #[error("invalid FEN '{fen}': {reason}")]
    InvalidFen { fen: String, reason: String },

    #[error("illegal move '{mv}' in position '{fen}'")]
    IllegalMove { fen: String, mv: String },

    #[error("unparsable move '{mv}'")]
    UnparsableMove { mv: String },
}

/// 局面に関する問い合わせ。
///
/// 実装は純粋関数であること（同じ入力に対して常に同じ結果を返す）。
/// ツリーの FEN 不変条件（子の FEN は親の FEN と指し手から決まる）はこれに依存する。
pub trait PositionService: Send + Sync {
    fn legal_moves(&self, fen: &str) -> Result<Vec<UciMove>, PositionError>;

    /// 指し手を適用した後の FEN を返す。
    fn apply(&self, fen: &str, mv: &UciMove) -> Result<String, PositionError>;

    fn side_to_move(&self, fen: &str) -> Result<Color, PositionError>;

    fn to_san(&self, fen: &str, mv: &UciMove) -> Result<String, PositionError>;

    /// UCI と SAN のどちらで書かれた指し手も受け付け、UCI に正規化する。
    fn parse_move(&self, fen: &str, text: &str) -> Result<UciMove, PositionError>;

    /// FEN が解釈可能かどうか。
    fn validate(&self, fen: &str) -> Result<(), PositionError> {
        self.side_to_move(fen).map(|_| ())
    }
}

/// 標準ルールのチェス（shakmaty 実装）。
///
/// 出力 FEN のアンパッサン欄は、実際にアンパッサンが可能な場合のみ記録する。
/// そのため手順違いで同じ局面に到達した場合に FEN が一致する。
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardChess;

impl StandardChess {
    fn parse(&self, fen: &str) -> Result<Chess, PositionError> {
        let invalid = |reason: String| PositionError::InvalidFen {
            fen: fen.to_string(),
            reason,
        };
        let parsed = Fen::from_ascii(fen.trim().as_bytes()).map_err(|e| invalid(e.to_string()))?;
        parsed
            .into_position(CastlingMode::Standard)
            .map_err(|e| invalid(e.to_string()))
    }

    fn resolve(&self, pos: &Chess, fen: &str, mv: &UciMove) -> Result<Move, PositionError> {
        let uci = Uci::from_ascii(mv.as_str().as_bytes()).map_err(|_| {
            PositionError::UnparsableMove {
                mv: mv.to_string(),
            }
        })?;
        uci.to_move(pos).map_err(|_| PositionError::IllegalMove {
            fen: fen.to_string(),
            mv: mv.to_string(),
        })
    }

    fn fen_of(pos: Chess) -> String {
        Fen::from_position(&pos, EnPassantMode::Legal).to_string()
    }
}

impl PositionService for StandardChess {
    fn legal_moves(&self, fen: &str) -> Result<Vec<UciMove>, PositionError> {
        let pos = self.parse(fen)?;
        Ok(pos
            .legal_moves()
            .iter()
            .map(|m| UciMove::new(m.to_uci(CastlingMode::Standard).to_string()))
            .collect())
    }

    fn apply(&self, fen: &str, mv: &UciMove) -> Result<String, PositionError> {
        let mut pos = self.parse(fen)?;
        let m = self.resolve(&pos, fen, mv)?;
        pos.play_unchecked(m);
        Ok(Self::fen_of(pos))
    }

    fn side_to_move(&self, fen: &str) -> Result<Color, PositionError> {
        Ok(self.parse(fen)?.turn().into())
    }

    fn to_san(&self, fen: &str, mv: &UciMove) -> Result<String, PositionError> {
        let pos = self.parse(fen)?;
        let m = self.resolve(&pos, fen, mv)?;
        Ok(SanPlus::from_move(pos, m).to_string())
    }

    fn parse_move(&self, fen: &str, text: &str) -> Result<UciMove, PositionError> {
        let pos = self.parse(fen)?;
        let text = text.trim();
        if let Ok(uci) = Uci::from_ascii(text.as_bytes()) {
            if let Ok(m) = uci.to_move(&pos) {
                return Ok(UciMove::new(m.to_uci(CastlingMode::Standard).to_string()));
            }
        }
        // SAN の末尾記号（+, #, !, ?）は解釈に不要なので落とす
        let bare = text.trim_end_matches(['+', '#', '!', '?']);
        let san = San::from_ascii(bare.as_bytes()).map_err(|_| PositionError::UnparsableMove {
            mv: text.to_string(),
        })?;
        let m = san.to_move(&pos).map_err(|_| PositionError::IllegalMove {
            fen: fen.to_string(),
            mv: text.to_string(),
        })?;
        Ok(UciMove::new(m.to_uci(CastlingMode::Standard).to_string()))
    }
}
