//! ビルド・バッチ解析の設定
//!
//! TOML から読み込める。未指定のフィールドは `Default` の値になる。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Color;

/// 候補2本の評価差がこの値以内なら「実質同等」とみなす（センチポーン）
pub const DEFAULT_TIE_BREAK_CP: i32 = 20;
/// エンジンに要求する候補手の本数
pub const DEFAULT_MIN_LINES: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// 自動化側の手を何で決めるか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    #[default]
    Engine,
    Database,
}

impl std::fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SelectionMode::Engine => "engine",
            SelectionMode::Database => "database",
        })
    }
}

impl std::str::FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "engine" => Ok(SelectionMode::Engine),
            "database" | "db" | "book" => Ok(SelectionMode::Database),
            other => Err(format!("invalid mode '{other}' (expected engine or database)")),
        }
    }
}

/// `TreeBuilder::run` に渡す設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// 自動で最善手を選ぶ側（レパートリーの持ち主）
    pub automated_color: Color,
    /// 自動化側の手番の数で数えた展開の深さ
    pub max_depth: u32,
    pub mode: SelectionMode,
    /// エンジン1局面あたりの探索時間
    pub search_budget_ms: u64,
    pub min_lines: usize,
    pub tie_break_cp: i32,
    /// 相手側の手をカバー率で選ぶときの目標（%）
    pub coverage_percent: f64,
    /// 相手側の手として最低限採用する数
    pub min_book_moves: usize,
    /// 勝率で選ぶ際に考慮する最低対局数
    pub min_games: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            automated_color: Color::White,
            max_depth: 5,
            mode: SelectionMode::Engine,
            search_budget_ms: 1000,
            min_lines: DEFAULT_MIN_LINES,
            tie_break_cp: DEFAULT_TIE_BREAK_CP,
            coverage_percent: 80.0,
            min_book_moves: 1,
            min_games: 1,
        }
    }
}

impl BuildConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: BuildConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".to_string()));
        }
        if self.min_lines == 0 {
            return Err(ConfigError::Invalid("min_lines must be at least 1".to_string()));
        }
        if !(0.0..=100.0).contains(&self.coverage_percent) {
            return Err(ConfigError::Invalid(format!(
                "coverage_percent must be within 0..=100 (got {})",
                self.coverage_percent
            )));
        }
        if self.tie_break_cp < 0 {
            return Err(ConfigError::Invalid("tie_break_cp must not be negative".to_string()));
        }
        Ok(())
    }
}

/// バッチ解析の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// 同時に解析する対局数。None なら CPU 数から決める。
    pub batch_size: Option<usize>,
    /// 1局面あたりの探索時間
    pub search_budget_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            search_budget_ms: 500,
        }
    }
}

impl BatchConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.unwrap_or_else(default_batch_size).max(1)
    }
}

/// `max(1, floor(available_parallelism / 4))`
pub fn default_batch_size() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cpus / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_overrides_defaults() {
        let cfg = BuildConfig::from_toml_str(
            r#"
            automated_color = "black"
            max_depth = 3
            mode = "database"
            coverage_percent = 90.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.automated_color, Color::Black);
        assert_eq!(cfg.max_depth, 3);
        assert_eq!(cfg.mode, SelectionMode::Database);
        assert_eq!(cfg.tie_break_cp, DEFAULT_TIE_BREAK_CP);
        assert_eq!(cfg.min_lines, DEFAULT_MIN_LINES);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(BuildConfig::from_toml_str("max_depth = 0").is_err());
        assert!(BuildConfig::from_toml_str("coverage_percent = 150.0").is_err());
        assert!(matches!(
            BuildConfig::from_toml_str("unknown_key = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_batch_size_is_at_least_one() {
        assert!(default_batch_size() >= 1);
        let cfg = BatchConfig {
            batch_size: Some(0),
            ..BatchConfig::default()
        };
        assert_eq!(cfg.effective_batch_size(), 1);
    }
}
