//! 推奨手キャッシュ
//!
//! (同一性キー, エンジンID) → (推奨手, 探索時間) を永続化する。
//! 探索時間が要求以上のエントリだけがそのまま再利用でき、不足するエントリは
//! 再探索の対象になる（結果は上書きされる）。
//!
//! ストレージが失敗した場合はキャッシュミスとして扱い、その実行中は
//! ストレージを使わない。警告は1回だけ出す。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::PositionKey;
use crate::types::UciMove;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRecommendation {
    pub recommended_move: UciMove,
    pub search_budget_ms: u64,
}

impl CachedRecommendation {
    /// 要求された探索時間を満たすか
    #[inline]
    pub fn satisfies(&self, requested_budget_ms: u64) -> bool {
        self.search_budget_ms >= requested_budget_ms
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache file {path} is malformed: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cache storage unavailable: {0}")]
    Unavailable(String),
}

/// 永続ストレージ
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(
        &self,
        key: &PositionKey,
        engine_id: &str,
    ) -> Result<Option<CachedRecommendation>, CacheError>;

    async fn store(
        &self,
        key: &PositionKey,
        engine_id: &str,
        rec: &CachedRecommendation,
    ) -> Result<(), CacheError>;

    /// 同じ局面に対する全エンジンのエントリ（エンジンID順）
    async fn entries_for(
        &self,
        key: &PositionKey,
    ) -> Result<Vec<(String, CachedRecommendation)>, CacheError>;
}

/// プロセス内メモリのみのストア
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<BTreeMap<(PositionKey, String), CachedRecommendation>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> CacheError {
        CacheError::Unavailable("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load(
        &self,
        key: &PositionKey,
        engine_id: &str,
    ) -> Result<Option<CachedRecommendation>, CacheError> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(entries.get(&(key.clone(), engine_id.to_string())).cloned())
    }

    async fn store(
        &self,
        key: &PositionKey,
        engine_id: &str,
        rec: &CachedRecommendation,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.insert((key.clone(), engine_id.to_string()), rec.clone());
        Ok(())
    }

    async fn entries_for(
        &self,
        key: &PositionKey,
    ) -> Result<Vec<(String, CachedRecommendation)>, CacheError> {
        let entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(entries
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|((_, engine), rec)| (engine.clone(), rec.clone()))
            .collect())
    }
}

/// JSON ファイル1つに全エントリを保存するストア。
///
/// 初回アクセス時に読み込み、書き込みのたびに一時ファイル経由で置き換える。
/// キーは `"<engine_id>\t<identity>"`。
pub struct JsonFileCacheStore {
    path: PathBuf,
    entries: tokio::sync::Mutex<Option<BTreeMap<String, CachedRecommendation>>>,
}

impl JsonFileCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry_key(key: &PositionKey, engine_id: &str) -> String {
        format!("{engine_id}\t{key}")
    }

    async fn read_file(&self) -> Result<BTreeMap<String, CachedRecommendation>, CacheError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => serde_json::from_str(&text).map_err(|source| CacheError::Format {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(CacheError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn write_file(
        &self,
        entries: &BTreeMap<String, CachedRecommendation>,
    ) -> Result<(), CacheError> {
        let io_err = |source| CacheError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(entries).map_err(|source| CacheError::Format {
            path: self.path.clone(),
            source,
        })?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, text).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for JsonFileCacheStore {
    async fn load(
        &self,
        key: &PositionKey,
        engine_id: &str,
    ) -> Result<Option<CachedRecommendation>, CacheError> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_file().await?);
        }
        Ok(guard
            .as_ref()
            .and_then(|entries| entries.get(&Self::entry_key(key, engine_id)).cloned()))
    }

    async fn store(
        &self,
        key: &PositionKey,
        engine_id: &str,
        rec: &CachedRecommendation,
    ) -> Result<(), CacheError> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_file().await?);
        }
        let entries = guard.get_or_insert_with(BTreeMap::new);
        entries.insert(Self::entry_key(key, engine_id), rec.clone());
        self.write_file(entries).await
    }

    async fn entries_for(
        &self,
        key: &PositionKey,
    ) -> Result<Vec<(String, CachedRecommendation)>, CacheError> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_file().await?);
        }
        let suffix = format!("\t{key}");
        Ok(guard
            .iter()
            .flatten()
            .filter_map(|(k, rec)| {
                k.strip_suffix(suffix.as_str())
                    .map(|engine| (engine.to_string(), rec.clone()))
            })
            .collect())
    }
}

/// `RecommendationCache::lookup` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// 現在のエンジンのエントリが要求を満たす
    Fresh(CachedRecommendation),
    /// 別エンジンのエントリが要求を満たしたので、現在のエンジンIDで保存し直した
    Reused {
        from_engine: String,
        rec: CachedRecommendation,
    },
    /// エントリはあるが探索時間が足りない（再探索の下限として扱う）
    Stale(CachedRecommendation),
    Miss,
}

pub struct RecommendationCache {
    store: Arc<dyn CacheStore>,
    available: AtomicBool,
}

impl RecommendationCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            available: AtomicBool::new(true),
        }
    }

    /// メモリのみのキャッシュ
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// 次の実行に向けてストレージを再び有効にする。
    pub fn reset_availability(&self) {
        self.available.store(true, Ordering::Relaxed);
    }

    fn degrade(&self, op: &str, err: &CacheError) {
        // 最初の失敗だけを報告する
        if self.available.swap(false, Ordering::Relaxed) {
            log::warn!("recommendation cache disabled for this run ({op} failed): {err}");
        }
    }

    pub async fn get(&self, key: &PositionKey, engine_id: &str) -> Option<CachedRecommendation> {
        if !self.is_available() {
            return None;
        }
        match self.store.load(key, engine_id).await {
            Ok(rec) => rec,
            Err(e) => {
                self.degrade("get", &e);
                None
            }
        }
    }

    /// 既存エントリを無条件に上書きする。
    pub async fn put(&self, key: &PositionKey, engine_id: &str, mv: &UciMove, budget_ms: u64) {
        if !self.is_available() {
            return;
        }
        let rec = CachedRecommendation {
            recommended_move: mv.clone(),
            search_budget_ms: budget_ms,
        };
        if let Err(e) = self.store.store(key, engine_id, &rec).await {
            self.degrade("put", &e);
        }
    }

    pub async fn lookup(
        &self,
        key: &PositionKey,
        engine_id: &str,
        requested_budget_ms: u64,
    ) -> CacheLookup {
        let own = self.get(key, engine_id).await;
        if let Some(rec) = own.as_ref().filter(|r| r.satisfies(requested_budget_ms)) {
            return CacheLookup::Fresh(rec.clone());
        }

        // 再利用可否はエンジンIDではなく探索時間で決まる
        if self.is_available() {
            match self.store.entries_for(key).await {
                Ok(entries) => {
                    let best = entries
                        .into_iter()
                        .filter(|(engine, rec)| {
                            engine != engine_id && rec.satisfies(requested_budget_ms)
                        })
                        .max_by_key(|(_, rec)| rec.search_budget_ms);
                    if let Some((from_engine, rec)) = best {
                        self.put(key, engine_id, &rec.recommended_move, rec.search_budget_ms)
                            .await;
                        return CacheLookup::Reused { from_engine, rec };
                    }
                }
                Err(e) => self.degrade("lookup", &e),
            }
        }

        match own {
            Some(rec) => CacheLookup::Stale(rec),
            None => CacheLookup::Miss,
        }
    }
}
