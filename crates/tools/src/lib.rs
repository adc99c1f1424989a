//! rvariant のコマンドラインツール群が使う外部実装
//!
//! - `uci`: UCI エンジンプロセス（`Engine` 実装）
//! - `book`: JSON の棋譜集計（`OpeningDatabase` 実装）
//! - `analysis`: 棋譜一括解析の解析器と結果の書き出し

pub mod analysis;
pub mod book;
pub mod common;
pub mod uci;
