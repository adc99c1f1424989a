//! シェルスクリプトの UCI エンジンを相手にした探索ループの検証
#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rvariant_core::{Engine, EngineLine, STARTPOS_FEN};
use tools::uci::{EngineProcess, SearchRequest, UciEngine, UciEngineConfig};

const AFTER_E4: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";

/// movetime ごとに振る舞いを変える UCI エンジン
///
/// - 10: 0.3 秒遅れて答える
/// - 20: bestmove だけを返す
/// - 5000: stop が来るまで答えない
/// - その他: 手番に応じた MultiPV 2本
const SCRIPTED_ENGINE: &str = r#"#!/bin/sh
fen=""
while read -r line; do
  case "$line" in
    uci)
      echo "id name scripted"
      echo "option name MultiPV type spin default 1 min 1 max 8"
      echo "uciok" ;;
    isready) echo "readyok" ;;
    "position fen "*) fen="${line#position fen }" ;;
    "go movetime 10")
      sleep 0.3
      echo "info depth 1 multipv 1 score cp 99 pv a2a3"
      echo "bestmove a2a3" ;;
    "go movetime 20")
      echo "bestmove g1f3" ;;
    "go movetime 5000")
      while read -r cmd; do
        [ "$cmd" = "stop" ] && break
      done
      echo "info depth 3 multipv 1 score cp 5 pv b1c3"
      echo "bestmove b1c3" ;;
    "go "*)
      case "$fen" in
        *" b "*)
          echo "info depth 8 multipv 1 score cp 20 pv e7e5 g1f3"
          echo "info depth 8 multipv 2 score cp 10 pv c7c5"
          echo "bestmove e7e5" ;;
        *)
          echo "info depth 8 multipv 1 score cp 30 pv e2e4 e7e5"
          echo "info depth 8 multipv 2 score mate 3 pv d2d4"
          echo "bestmove e2e4" ;;
      esac ;;
    quit) exit 0 ;;
  esac
done
"#;

fn scripted_engine(dir: &Path) -> UciEngineConfig {
    let script = dir.join("scripted-engine.sh");
    std::fs::write(&script, SCRIPTED_ENGINE).unwrap();
    UciEngineConfig {
        args: vec![script.display().to_string()],
        label: Some("scripted-engine".to_string()),
        timeout_margin_ms: 10,
        ..UciEngineConfig::new("/bin/sh")
    }
}

fn request(fen: &str, movetime_ms: u64, multipv: usize) -> SearchRequest<'_> {
    SearchRequest {
        fen,
        movetime_ms,
        multipv,
        timeout_margin_ms: 10,
    }
}

#[test]
fn search_collects_multipv_lines_in_rank_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine =
        EngineProcess::spawn(&scripted_engine(dir.path()), Arc::new(AtomicBool::new(false))).unwrap();

    let outcome = engine.search(&request(STARTPOS_FEN, 100, 2)).unwrap();
    assert!(!outcome.timed_out);
    assert_eq!(outcome.bestmove.as_deref(), Some("e2e4"));
    let firsts: Vec<_> = outcome.lines.iter().map(|l| l.first_move()).collect();
    assert_eq!(firsts, vec![Some("e2e4"), Some("d2d4")]);

    // 同じプロセスで続けて探索できる
    let next = engine.search(&request(AFTER_E4, 100, 2)).unwrap();
    assert_eq!(next.bestmove.as_deref(), Some("e7e5"));
}

#[test]
fn timed_out_process_refuses_further_searches() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine =
        EngineProcess::spawn(&scripted_engine(dir.path()), Arc::new(AtomicBool::new(false))).unwrap();

    let outcome = engine.search(&request(STARTPOS_FEN, 10, 1)).unwrap();
    assert!(outcome.timed_out);
    assert_eq!(outcome.bestmove, None);

    // 遅れて届く a2a3 を別の局面の結果として読んではいけない
    std::thread::sleep(Duration::from_millis(400));
    assert!(engine.search(&request(AFTER_E4, 100, 1)).is_err());
}

#[test]
fn stop_request_ends_the_search_early() {
    let dir = tempfile::tempdir().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let mut engine = EngineProcess::spawn(&scripted_engine(dir.path()), stop.clone()).unwrap();

    stop.store(true, Ordering::Relaxed);
    let outcome = engine
        .search(&SearchRequest {
            timeout_margin_ms: 1000,
            ..request(STARTPOS_FEN, 5000, 1)
        })
        .unwrap();
    assert!(!outcome.timed_out);
    assert_eq!(outcome.bestmove.as_deref(), Some("b1c3"));
    assert!(outcome.elapsed_ms < 5000);
}

#[tokio::test]
async fn uci_engine_restarts_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let engine = UciEngine::new(scripted_engine(dir.path()));
    assert_eq!(engine.id(), "scripted-engine");

    let late = engine.best_lines(STARTPOS_FEN, 1, 10).await.unwrap();
    assert!(late.is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let lines = engine.best_lines(AFTER_E4, 2, 100).await.unwrap();
    assert_eq!(
        lines,
        vec![EngineLine::new("e7e5", Some(20)), EngineLine::new("c7c5", Some(10))]
    );
}

#[tokio::test]
async fn uci_engine_mate_scores_and_bestmove_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let engine = UciEngine::new(scripted_engine(dir.path()));

    let lines = engine.best_lines(STARTPOS_FEN, 2, 100).await.unwrap();
    assert_eq!(
        lines,
        vec![EngineLine::new("e2e4", Some(30)), EngineLine::new("d2d4", None)]
    );

    // info に手がなければ bestmove だけを評価値なしで返す
    let bare = engine.best_lines(STARTPOS_FEN, 1, 20).await.unwrap();
    assert_eq!(bare, vec![EngineLine::new("g1f3", None)]);
}

#[tokio::test]
async fn uci_engine_stop_interrupts_a_long_search() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(UciEngine::new(UciEngineConfig {
        timeout_margin_ms: 1000,
        ..scripted_engine(dir.path())
    }));

    let searching = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.best_lines(STARTPOS_FEN, 1, 5000).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.stop(0).await.unwrap();

    let lines = searching.await.unwrap().unwrap();
    assert_eq!(lines, vec![EngineLine::new("b1c3", Some(5))]);
}
