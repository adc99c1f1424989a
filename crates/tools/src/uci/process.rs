use std::collections::HashSet;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};

use super::info::{MultiPvCollector, SearchOutcome, SearchRequest, duration_to_millis};

pub const ENGINE_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const ENGINE_QUIT_TIMEOUT: Duration = Duration::from_millis(300);
pub const ENGINE_QUIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// 外部からの停止要求を確認する間隔
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// エンジンプロセス起動時の設定。
#[derive(Debug, Clone)]
pub struct UciEngineConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// キャッシュのキーになる識別子。None なら実行ファイル名。
    pub label: Option<String>,
    pub threads: usize,
    pub hash_mb: u32,
    /// 追加の UCI オプション (Name=Value 形式)
    pub uci_options: Vec<String>,
    pub timeout_margin_ms: u64,
}

impl UciEngineConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            label: None,
            threads: 1,
            hash_mb: 64,
            uci_options: Vec::new(),
            timeout_margin_ms: 1000,
        }
    }

    pub fn label(&self) -> String {
        self.label.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string())
        })
    }
}

/// 1本の UCI エンジンに対する入出力をカプセル化する。
pub struct EngineProcess {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    rx: Receiver<String>,
    opt_names: HashSet<String>,
    multipv: usize,
    stop_requested: Arc<AtomicBool>,
    /// 打ち切った探索の出力がまだ届く可能性がある
    desynced: bool,
    pub label: String,
}

impl EngineProcess {
    pub fn spawn(cfg: &UciEngineConfig, stop_requested: Arc<AtomicBool>) -> Result<Self> {
        let mut cmd = Command::new(&cfg.path);
        if !cfg.args.is_empty() {
            cmd.args(&cfg.args);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn engine at {}", cfg.path.display()))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;
        let (tx, rx) = mpsc::channel::<String>();
        std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut proc = Self {
            child,
            stdin: BufWriter::new(stdin),
            rx,
            opt_names: HashSet::new(),
            multipv: 1,
            stop_requested,
            desynced: false,
            label: cfg.label(),
        };
        proc.initialize(cfg)?;
        Ok(proc)
    }

    fn initialize(&mut self, cfg: &UciEngineConfig) -> Result<()> {
        self.write_line("uci")?;
        loop {
            let line = self.recv_line(ENGINE_READY_TIMEOUT)?;
            if let Some(rest) = line.strip_prefix("option ") {
                if let Some(name) = parse_option_name(rest) {
                    self.opt_names.insert(name);
                }
            } else if line == "uciok" {
                break;
            }
        }
        self.set_option_if_available("Threads", &cfg.threads.to_string())?;
        self.set_option_if_available("Hash", &cfg.hash_mb.to_string())?;
        for opt in &cfg.uci_options {
            match opt.split_once('=') {
                Some((name, value)) => self.set_option_if_available(name.trim(), value.trim())?,
                // "=" がない場合はボタン型オプションとみなす
                None => self.write_line(&format!("setoption name {}", opt.trim()))?,
            }
        }
        self.sync_ready()?;
        self.write_line("ucinewgame")?;
        log::debug!("{}: engine ready", self.label);
        Ok(())
    }

    pub fn new_game(&mut self) -> Result<()> {
        self.write_line("ucinewgame")?;
        self.sync_ready()
    }

    fn set_multipv(&mut self, n: usize) -> Result<()> {
        let n = n.max(1);
        if n != self.multipv {
            self.set_option_if_available("MultiPV", &n.to_string())?;
            self.multipv = n;
        }
        Ok(())
    }

    /// 固定時間で探索し、候補を multipv 順に返す。
    ///
    /// 時間内に `bestmove` が来なければ `stop` を送り、それでも来なければ打ち切る。
    /// 打ち切った後のプロセスは前の局面の出力が混ざるので、以後の探索はエラーになる。
    pub fn search(&mut self, req: &SearchRequest<'_>) -> Result<SearchOutcome> {
        if self.desynced {
            bail!("{}: engine output is out of sync after a timed-out search", self.label);
        }
        self.set_multipv(req.multipv)?;
        self.write_line(&format!("position fen {}", req.fen))?;
        self.write_line(&format!("go movetime {}", req.movetime_ms))?;

        let start = Instant::now();
        let soft_limit = Duration::from_millis(req.movetime_ms.saturating_add(req.timeout_margin_ms));
        let hard_limit = soft_limit + Duration::from_millis(req.timeout_margin_ms);
        let mut stop_sent = false;
        let mut collector = MultiPvCollector::default();

        loop {
            if !stop_sent && self.stop_requested.load(Ordering::Relaxed) {
                self.write_line("stop")?;
                stop_sent = true;
            }
            let elapsed = start.elapsed();
            let deadline = if stop_sent { hard_limit } else { soft_limit };
            if elapsed >= deadline {
                if !stop_sent {
                    self.write_line("stop")?;
                    stop_sent = true;
                    continue;
                }
                self.desynced = true;
                return Ok(SearchOutcome {
                    bestmove: None,
                    lines: collector.into_lines(),
                    elapsed_ms: duration_to_millis(elapsed),
                    timed_out: true,
                });
            }

            let wait = deadline.saturating_sub(elapsed).min(STOP_POLL_INTERVAL);
            match self.rx.recv_timeout(wait) {
                Ok(line) => {
                    if line.starts_with("info") {
                        collector.update_from_line(&line);
                        continue;
                    }
                    if let Some(rest) = line.strip_prefix("bestmove ") {
                        let mv = rest.split_whitespace().next().unwrap_or_default();
                        let bestmove = (mv != "(none)" && !mv.is_empty()).then(|| mv.to_string());
                        return Ok(SearchOutcome {
                            bestmove,
                            lines: collector.into_lines(),
                            elapsed_ms: duration_to_millis(start.elapsed()),
                            timed_out: false,
                        });
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    bail!("{}: engine exited unexpectedly", self.label);
                }
            }
        }
    }

    pub fn sync_ready(&mut self) -> Result<()> {
        self.write_line("isready")?;
        loop {
            let line = self.recv_line(ENGINE_READY_TIMEOUT)?;
            if line == "readyok" {
                break;
            }
        }
        Ok(())
    }

    pub fn recv_line(&self, timeout: Duration) -> Result<String> {
        self.rx
            .recv_timeout(timeout)
            .map_err(|_| anyhow!("{}: engine read timeout", self.label))
    }

    pub fn set_option_if_available(&mut self, name: &str, value: &str) -> Result<()> {
        if self.opt_names.is_empty() || self.opt_names.contains(name) {
            self.write_line(&format!("setoption name {name} value {value}"))?;
        }
        Ok(())
    }

    pub fn write_line(&mut self, msg: &str) -> Result<()> {
        self.stdin.write_all(msg.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        let _ = self.write_line("quit");
        let deadline = Instant::now() + ENGINE_QUIT_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            std::thread::sleep(ENGINE_QUIT_POLL_INTERVAL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// `option name <NAME...> type ...` からオプション名を取り出す。
pub fn parse_option_name(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    tokens.by_ref().find(|tok| *tok == "name")?;
    let parts: Vec<&str> = tokens.take_while(|tok| *tok != "type").collect();
    (!parts.is_empty()).then(|| parts.join(" "))
}
