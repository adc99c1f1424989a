#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rvariant_core::database::DatabaseError;
use rvariant_core::engine::EngineError;
use rvariant_core::{
    Engine, EngineLine, MoveStats, OpeningDatabase, PositionKey, PositionService, STARTPOS_FEN,
    StandardChess, UciMove, canonicalize,
};

/// SAN の手順で到達する局面の FEN
pub fn fen_after(moves: &[&str]) -> String {
    let svc = StandardChess;
    let mut fen = STARTPOS_FEN.to_string();
    for san in moves {
        let mv = svc.parse_move(&fen, san).unwrap();
        fen = svc.apply(&fen, &mv).unwrap();
    }
    fen
}

pub fn key_after(moves: &[&str]) -> PositionKey {
    canonicalize(&fen_after(moves))
}

/// 局面ごとに決めた候補手を返すエンジン
pub struct ScriptedEngine {
    id: String,
    lines: HashMap<PositionKey, Vec<EngineLine>>,
    first_legal_fallback: bool,
    fail_from_call: Option<usize>,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<PositionKey>>,
}

impl ScriptedEngine {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            lines: HashMap::new(),
            first_legal_fallback: false,
            fail_from_call: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 台本にない局面では最初の合法手を返す
    pub fn with_first_legal_fallback(mut self) -> Self {
        self.first_legal_fallback = true;
        self
    }

    /// `n` 回目（1始まり）以降の呼び出しを失敗させる
    pub fn failing_from_call(mut self, n: usize) -> Self {
        self.fail_from_call = Some(n);
        self
    }

    pub fn line(mut self, after: &[&str], candidates: &[(&str, i32)]) -> Self {
        self.lines.insert(
            key_after(after),
            candidates
                .iter()
                .map(|(uci, cp)| EngineLine::new(*uci, Some(*cp)))
                .collect(),
        );
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn id(&self) -> &str {
        &self.id
    }

    async fn best_lines(
        &self,
        fen: &str,
        _min_lines: usize,
        _budget_ms: u64,
    ) -> Result<Vec<EngineLine>, EngineError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_from_call.is_some_and(|from| n >= from) {
            return Err(EngineError::Unreachable {
                engine: self.id.clone(),
                reason: "process exited".to_string(),
            });
        }
        let key = canonicalize(fen);
        self.seen.lock().unwrap().push(key.clone());
        if let Some(lines) = self.lines.get(&key) {
            return Ok(lines.clone());
        }
        if self.first_legal_fallback {
            let first = StandardChess.legal_moves(fen).unwrap().into_iter().next();
            return Ok(first.map(|mv| EngineLine::new(mv, Some(0))).into_iter().collect());
        }
        Ok(Vec::new())
    }

    async fn stop(&self, _session_id: u64) -> Result<(), EngineError> {
        Ok(())
    }
}

/// 局面ごとの集計を返すデータベース
#[derive(Default)]
pub struct ScriptedDatabase {
    rows: HashMap<PositionKey, Vec<MoveStats>>,
    fail: bool,
    pub calls: AtomicUsize,
}

impl ScriptedDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// `rows` は (手, 白勝ち, 黒勝ち, 引き分け)
    pub fn position(mut self, after: &[&str], rows: &[(&str, u64, u64, u64)]) -> Self {
        self.rows.insert(
            key_after(after),
            rows.iter()
                .map(|(mv, w, b, d)| MoveStats::new(*mv, *w, *b, *d))
                .collect(),
        );
        self
    }
}

#[async_trait]
impl OpeningDatabase for ScriptedDatabase {
    async fn stats_for_position(&self, fen: &str) -> Result<Vec<MoveStats>, DatabaseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DatabaseError::Unreachable("connection refused".to_string()));
        }
        Ok(self.rows.get(&canonicalize(fen)).cloned().unwrap_or_default())
    }
}

pub fn positions() -> Arc<dyn PositionService> {
    Arc::new(StandardChess)
}

pub fn uci(s: &str) -> UciMove {
    UciMove::from(s)
}
