//! UCI `info` 行の解析
//!
//! MultiPV 探索では `multipv N` ごとに最新の行で上書きし、最後に順位順に並べる。

use std::collections::BTreeMap;
use std::time::Duration;

use rvariant_core::Color;
use rvariant_core::batch::EVAL_CLAMP_CP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Cp(i32),
    /// 手番側から見た詰みまでの手数（負なら詰まされる）
    Mate(i32),
}

impl Score {
    /// 手番側から見たセンチポーン。詰みは None。
    pub fn cp(self) -> Option<i32> {
        match self {
            Score::Cp(v) => Some(v),
            Score::Mate(_) => None,
        }
    }

    /// 白から見た評価値。詰みは `±EVAL_CLAMP_CP` に丸める。
    pub fn white_cp(self, side_to_move: Color) -> i32 {
        let own = match self {
            Score::Cp(v) => v,
            Score::Mate(m) if m > 0 => EVAL_CLAMP_CP,
            Score::Mate(_) => -EVAL_CLAMP_CP,
        };
        match side_to_move {
            Color::White => own,
            Color::Black => -own,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvLine {
    pub multipv: u32,
    pub depth: Option<u32>,
    pub score: Option<Score>,
    pub pv: Vec<String>,
}

impl PvLine {
    pub fn first_move(&self) -> Option<&str> {
        self.pv.first().map(String::as_str)
    }
}

/// 探索中に届いた info 行を multipv ごとに集める。
#[derive(Debug, Default, Clone)]
pub struct MultiPvCollector {
    lines: BTreeMap<u32, PvLine>,
}

impl MultiPvCollector {
    pub fn update_from_line(&mut self, line: &str) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first().copied() != Some("info") {
            return;
        }
        let mut multipv = 1u32;
        let mut depth = None;
        let mut score = None;
        let mut pv = Vec::new();
        let mut i = 1;
        while i < tokens.len() {
            match tokens[i] {
                "multipv" if i + 1 < tokens.len() => {
                    multipv = tokens[i + 1].parse().unwrap_or(1);
                    i += 1;
                }
                "depth" if i + 1 < tokens.len() => {
                    depth = tokens[i + 1].parse().ok();
                    i += 1;
                }
                "score" if i + 2 < tokens.len() => {
                    let value = tokens[i + 2].parse::<i32>().ok();
                    score = match tokens[i + 1] {
                        "cp" => value.map(Score::Cp),
                        "mate" => value.map(Score::Mate),
                        _ => None,
                    };
                    i += 2;
                }
                "pv" => {
                    pv = tokens[i + 1..].iter().map(|t| t.to_string()).collect();
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        // 手のない info（currmove など）は無視する
        if pv.is_empty() {
            return;
        }
        self.lines.insert(
            multipv,
            PvLine {
                multipv,
                depth,
                score,
                pv,
            },
        );
    }

    /// multipv 順の候補
    pub fn into_lines(self) -> Vec<PvLine> {
        self.lines.into_values().collect()
    }
}

pub struct SearchRequest<'a> {
    pub fen: &'a str,
    pub movetime_ms: u64,
    pub multipv: usize,
    pub timeout_margin_ms: u64,
}

pub struct SearchOutcome {
    pub bestmove: Option<String>,
    pub lines: Vec<PvLine>,
    pub elapsed_ms: u64,
    pub timed_out: bool,
}

pub fn duration_to_millis(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_keeps_latest_line_per_multipv() {
        let mut c = MultiPvCollector::default();
        c.update_from_line("info depth 10 multipv 1 score cp 34 nodes 100 pv e2e4 e7e5");
        c.update_from_line("info depth 10 multipv 2 score cp 20 pv d2d4 d7d5");
        c.update_from_line("info depth 11 multipv 1 score cp 31 pv e2e4 c7c5");
        c.update_from_line("info depth 11 currmove g1f3 currmovenumber 3");

        let lines = c.into_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].depth, Some(11));
        assert_eq!(lines[0].score, Some(Score::Cp(31)));
        assert_eq!(lines[0].first_move(), Some("e2e4"));
        assert_eq!(lines[1].first_move(), Some("d2d4"));
    }

    #[test]
    fn single_pv_and_mate_scores() {
        let mut c = MultiPvCollector::default();
        c.update_from_line("info depth 5 score mate -2 pv h7h8");
        let lines = c.into_lines();
        assert_eq!(lines[0].multipv, 1);
        assert_eq!(lines[0].score, Some(Score::Mate(-2)));
        assert_eq!(lines[0].score.and_then(Score::cp), None);
    }

    #[test]
    fn white_perspective() {
        assert_eq!(Score::Cp(40).white_cp(Color::White), 40);
        assert_eq!(Score::Cp(40).white_cp(Color::Black), -40);
        assert_eq!(Score::Mate(3).white_cp(Color::Black), -EVAL_CLAMP_CP);
        assert_eq!(Score::Mate(0).white_cp(Color::White), -EVAL_CLAMP_CP);
    }
}
