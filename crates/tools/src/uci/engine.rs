use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rvariant_core::engine::EngineError;
use rvariant_core::{Engine, EngineLine};

use super::info::SearchRequest;
use super::process::{EngineProcess, UciEngineConfig};

/// 外部 UCI エンジンを `Engine` として使う。
///
/// プロセスは最初の探索時に起動し、以後使い回す。探索に失敗した、または
/// 時間切れになったプロセスは破棄し、次の探索で起動し直す。
pub struct UciEngine {
    id: String,
    config: UciEngineConfig,
    process: Arc<Mutex<Option<EngineProcess>>>,
    stop_requested: Arc<AtomicBool>,
}

impl UciEngine {
    pub fn new(config: UciEngineConfig) -> Self {
        Self {
            id: config.label(),
            config,
            process: Arc::new(Mutex::new(None)),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Engine for UciEngine {
    fn id(&self) -> &str {
        &self.id
    }

    async fn best_lines(
        &self,
        fen: &str,
        min_lines: usize,
        budget_ms: u64,
    ) -> Result<Vec<EngineLine>, EngineError> {
        let process = self.process.clone();
        let config = self.config.clone();
        let stop_requested = self.stop_requested.clone();
        let fen = fen.to_string();
        let id = self.id.clone();
        let unreachable = |reason: String| EngineError::Unreachable {
            engine: self.id.clone(),
            reason,
        };

        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = process.lock().map_err(|_| EngineError::Unreachable {
                engine: id.clone(),
                reason: "engine lock poisoned".to_string(),
            })?;
            stop_requested.store(false, Ordering::Relaxed);
            let proc = match guard.as_mut() {
                Some(proc) => proc,
                None => {
                    let spawned = EngineProcess::spawn(&config, stop_requested).map_err(|e| {
                        EngineError::Unreachable {
                            engine: id.clone(),
                            reason: format!("{e:#}"),
                        }
                    })?;
                    guard.insert(spawned)
                }
            };
            let req = SearchRequest {
                fen: &fen,
                movetime_ms: budget_ms,
                multipv: min_lines,
                timeout_margin_ms: config.timeout_margin_ms,
            };
            match proc.search(&req) {
                Ok(outcome) => {
                    if outcome.timed_out {
                        // 遅れて届く出力を次の局面で読まないよう、プロセスごと捨てる
                        log::warn!("{id}: search timed out after {}ms, restarting engine", outcome.elapsed_ms);
                        *guard = None;
                    }
                    let mut lines: Vec<EngineLine> = outcome
                        .lines
                        .iter()
                        .filter_map(|l| {
                            l.first_move()
                                .map(|mv| EngineLine::new(mv, l.score.and_then(|s| s.cp())))
                        })
                        .collect();
                    // info に手がない場合は bestmove だけでも返す
                    if lines.is_empty() {
                        lines.extend(outcome.bestmove.map(|mv| EngineLine::new(mv, None)));
                    }
                    Ok(lines)
                }
                Err(e) => {
                    *guard = None;
                    Err(EngineError::Search {
                        engine: id.clone(),
                        reason: format!("{e:#}"),
                    })
                }
            }
        })
        .await;

        joined.map_err(|e| unreachable(e.to_string()))?
    }

    async fn stop(&self, _session_id: u64) -> Result<(), EngineError> {
        // 探索ループが次のポーリングで stop を送る
        self.stop_requested.store(true, Ordering::Relaxed);
        Ok(())
    }
}
