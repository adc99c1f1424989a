//! 排他キュー
//!
//! 状態を持つ外部リソース（エンジンプロセス、データベース）への要求を
//! 1件ずつ、投入順に実行する。リソースごとに1つのワーカータスクが
//! チャネルからジョブを取り出して順に await する。
//!
//! 同一プロセスのエンジンに同時に2つの探索を投げると結果が混ざるため、
//! これは性能のためではなく正しさのための直列化である。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("exclusive queue '{0}' is closed")]
    Closed(String),

    /// タスクが結果を返す前に中断された（panic など）
    #[error("task on exclusive queue '{0}' was aborted")]
    TaskAborted(String),
}

/// 単一実行のタスクキュー。clone すると同じワーカーを共有する。
#[derive(Clone)]
pub struct ExclusiveQueue {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    label: Arc<str>,
}

impl ExclusiveQueue {
    /// ワーカーを起動する。tokio ランタイム内で呼ぶこと。
    pub fn new(label: impl Into<String>) -> Self {
        let label: Arc<str> = Arc::from(label.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker_label = label.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                // ジョブごとに別タスクで実行し、panic をワーカーに波及させない
                if let Err(e) = tokio::spawn(job).await {
                    log::warn!("{worker_label}: queued task aborted: {e}");
                }
            }
            log::debug!("{worker_label}: exclusive queue worker stopped");
        });
        Self {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            label,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// 投入済みで未完了のタスク数
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// タスクを末尾に積み、その結果を待つ。
    ///
    /// タスク自身の失敗は `T`（通常は `Result`）として呼び出し元に返る。
    pub async fn run<F, T>(&self, task: F) -> Result<T, QueueError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = self.pending.clone();
        pending.fetch_add(1, Ordering::SeqCst);
        let job: Job = Box::pin(async move {
            // panic 時も件数を戻す
            let _guard = PendingGuard(pending);
            let out = task.await;
            let _ = reply_tx.send(out);
        });
        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed(self.label.to_string()));
        }
        reply_rx.await.map_err(|_| QueueError::TaskAborted(self.label.to_string()))
    }
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_run_in_submission_order_without_overlap() {
        let queue = ExclusiveQueue::new("test");
        let events = Arc::new(Mutex::new(Vec::new()));

        let task = |name: &'static str, delay_ms: u64| {
            let events = events.clone();
            async move {
                events.lock().unwrap().push(format!("{name}+"));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                events.lock().unwrap().push(format!("{name}-"));
                name
            }
        };

        // 後のタスクほど短くしても順序は変わらない
        let (a, b, c) = tokio::join!(
            queue.run(task("A", 30)),
            queue.run(task("B", 10)),
            queue.run(task("C", 1)),
        );
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), ("A", "B", "C"));
        assert_eq!(*events.lock().unwrap(), vec!["A+", "A-", "B+", "B-", "C+", "C-"]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters_never_overlap() {
        let queue = ExclusiveQueue::new("engine");
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let queue = queue.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_task_failure_is_propagated_and_queue_survives_panic() {
        let queue = ExclusiveQueue::new("db");
        let failed: Result<Result<u32, String>, QueueError> =
            queue.run(async { Err("no such position".to_string()) }).await;
        assert_eq!(failed.unwrap(), Err("no such position".to_string()));

        let panicked = queue
            .run(async {
                panic!("engine crashed");
            })
            .await;
        assert_eq!(panicked, Err::<(), _>(QueueError::TaskAborted("db".to_string())));

        assert_eq!(queue.run(async { 7 }).await, Ok(7));
        assert_eq!(queue.pending(), 0);
    }
}
