//! UCI エンジンとの対話

pub mod engine;
pub mod info;
pub mod process;

pub use engine::UciEngine;
pub use info::{MultiPvCollector, PvLine, Score, SearchOutcome, SearchRequest};
pub use process::{EngineProcess, UciEngineConfig};
