//! rvariant-core: チェスのオープニング研究用バリエーションツリー
//!
//! - `tree`: 指し手ツリー（アリーナ + パス）
//! - `builder`: エンジン／棋譜データベースを使ったツリーの自動展開
//! - `batch`: 棋譜の一括解析
//!
//! エンジン・データベース・キャッシュの永続化はトレイトで抽象化しており、
//! 具体的な実装は `tools` クレートにある。

pub mod batch;
pub mod builder;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod database;
pub mod engine;
pub mod identity;
pub mod ownership;
pub mod policy;
pub mod position;
pub mod queue;
pub mod tree;
pub mod types;

pub use batch::{
    AnalysisSettings, BatchAnalysisCoordinator, BatchError, BatchOutcome, BatchProgress,
    GameAnalysis, GameAnalyzer, GameRecord, GameStats, ResultSink,
};
pub use builder::{BuildError, BuildOutcome, BuildProgress, BuildReport, BuilderState, TreeBuilder};
pub use cache::{CacheStore, JsonFileCacheStore, MemoryCacheStore, RecommendationCache};
pub use cancel::CancelFlag;
pub use config::{BatchConfig, BuildConfig, SelectionMode};
pub use database::{MoveStats, OpeningDatabase};
pub use engine::{Engine, EngineLine};
pub use identity::{PositionKey, canonicalize};
pub use position::{PositionService, STARTPOS_FEN, StandardChess};
pub use queue::ExclusiveQueue;
pub use tree::{MoveTree, NodeId, Path};
pub use types::{Color, UciMove};
