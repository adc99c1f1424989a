//! 棋譜解析の外部実装
//!
//! - `UciGameAnalyzer`: 対局ごとに UCI エンジンを1本起動し、全局面を固定時間で評価する
//! - `JsonlResultSink`: 解析結果を JSONL に追記する

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde::Serialize;

use rvariant_core::{
    AnalysisSettings, BatchError, GameAnalysis, GameAnalyzer, GameRecord, GameStats,
    PositionService, ResultSink, StandardChess,
};

use crate::common::io::{Writer, open_writer};
use crate::uci::{EngineProcess, SearchRequest, UciEngineConfig};

pub struct UciGameAnalyzer {
    config: UciEngineConfig,
    sessions: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl UciGameAnalyzer {
    pub fn new(config: UciEngineConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, session_id: u64) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(session_id, flag.clone());
        }
        flag
    }

    fn unregister(&self, session_id: u64) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&session_id);
        }
    }
}

#[async_trait]
impl GameAnalyzer for UciGameAnalyzer {
    async fn analyze(
        &self,
        session_id: u64,
        game: &GameRecord,
        settings: &AnalysisSettings,
    ) -> Result<GameAnalysis, BatchError> {
        let stop = self.register(session_id);
        let config = UciEngineConfig {
            threads: settings.threads,
            ..self.config.clone()
        };
        let budget_ms = settings.budget_ms;
        let owned = game.clone();
        let joined =
            tokio::task::spawn_blocking(move || evaluate_game(&config, &owned, budget_ms, stop)).await;
        self.unregister(session_id);

        let failed = |reason: String| BatchError::Analysis {
            game_id: game.id.clone(),
            reason,
        };
        match joined {
            Ok(Ok(analysis)) => Ok(analysis),
            Ok(Err(e)) => Err(failed(format!("{e:#}"))),
            Err(e) => Err(failed(e.to_string())),
        }
    }

    async fn stop(&self, session_id: u64) {
        if let Some(flag) = self.sessions.lock().ok().and_then(|s| s.get(&session_id).cloned()) {
            log::debug!("stopping analysis session {session_id}");
            flag.store(true, Ordering::Relaxed);
        }
    }
}

/// 開始局面と各手の後の局面を評価する（白から見た値）。
fn evaluate_game(
    config: &UciEngineConfig,
    game: &GameRecord,
    budget_ms: u64,
    stop: Arc<AtomicBool>,
) -> Result<GameAnalysis> {
    let positions = StandardChess;
    let mut engine = EngineProcess::spawn(config, stop.clone())?;
    engine.new_game()?;

    let mut fen = game.start_fen.clone();
    let mut evaluations = Vec::with_capacity(game.moves.len() + 1);
    for ply in 0..=game.moves.len() {
        if stop.load(Ordering::Relaxed) {
            bail!("stopped after {ply} positions");
        }
        let side = positions.side_to_move(&fen)?;
        let outcome = engine.search(&SearchRequest {
            fen: &fen,
            movetime_ms: budget_ms,
            multipv: 1,
            timeout_margin_ms: config.timeout_margin_ms,
        })?;
        if outcome.timed_out {
            bail!("ply {ply}: search timed out after {}ms", outcome.elapsed_ms);
        }
        let score = outcome.lines.first().and_then(|l| l.score);
        evaluations.push(score.map(|s| s.white_cp(side)));

        if let Some(mv) = game.moves.get(ply) {
            fen = positions
                .apply(&fen, mv)
                .map_err(|e| anyhow!("ply {}: {e}", ply + 1))?;
        }
    }
    Ok(GameAnalysis { evaluations })
}

#[derive(Serialize)]
struct SavedGame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    game_id: &'a str,
    pgn: &'a str,
    stats: &'a GameStats,
}

/// 解析結果を1局1行の JSONL として書き出す。
pub struct JsonlResultSink {
    writer: Mutex<Option<Writer>>,
}

impl JsonlResultSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_writer(open_writer(path)?))
    }

    pub fn from_writer(writer: Writer) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }

    /// 先頭に任意のメタ情報を書く。
    pub fn write_meta(&self, meta: &impl Serialize) -> Result<()> {
        self.with_writer(|w| w.write_json_line(meta))
    }

    pub fn close(&self) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("result writer lock poisoned"))?
            .take();
        if let Some(w) = writer {
            w.close()?;
        }
        Ok(())
    }

    fn with_writer(&self, f: impl FnOnce(&mut Writer) -> Result<()>) -> Result<()> {
        let mut guard = self.writer.lock().map_err(|_| anyhow!("result writer lock poisoned"))?;
        let writer = guard.as_mut().ok_or_else(|| anyhow!("result writer already closed"))?;
        f(writer)?;
        std::io::Write::flush(writer)?;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for JsonlResultSink {
    async fn save(&self, game_id: &str, pgn: &str, stats: &GameStats) -> Result<(), BatchError> {
        let record = SavedGame {
            kind: "game",
            game_id,
            pgn,
            stats,
        };
        self.with_writer(|w| w.write_json_line(&record))
            .map_err(|e| BatchError::Save {
                game_id: game_id.to_string(),
                reason: format!("{e:#}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvariant_core::batch::SideStats;

    #[tokio::test]
    async fn sink_writes_one_line_per_game() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let sink = JsonlResultSink::create(&path).unwrap();
        sink.write_meta(&serde_json::json!({ "type": "meta" })).unwrap();
        let stats = GameStats {
            white: SideStats {
                moves: 1,
                avg_cp_loss: 12.0,
                ..SideStats::default()
            },
            black: SideStats::default(),
        };
        sink.save("g1", "1. e4 *\n", &stats).await.unwrap();
        sink.save("g2", "1. d4 *\n", &stats).await.unwrap();
        sink.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1]["game_id"], "g1");
        assert_eq!(lines[1]["stats"]["white"]["avg_cp_loss"], 12.0);
        assert_eq!(lines[2]["pgn"], "1. d4 *\n");

        // 閉じた後の保存は失敗として報告される
        assert!(matches!(
            sink.save("g3", "*", &stats).await,
            Err(BatchError::Save { .. })
        ));
    }

    #[tokio::test]
    async fn missing_engine_fails_the_game_only() {
        let analyzer = UciGameAnalyzer::new(UciEngineConfig::new("/nonexistent/engine-binary"));
        let game = GameRecord {
            id: "g1".to_string(),
            start_fen: rvariant_core::STARTPOS_FEN.to_string(),
            moves: Vec::new(),
        };
        let err = analyzer
            .analyze(1, &game, &AnalysisSettings::single_threaded(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Analysis { ref game_id, .. } if game_id == "g1"));
        // 終了済みのセッションの停止は何もしない
        analyzer.stop(1).await;
    }
}
