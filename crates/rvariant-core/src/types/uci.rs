//! UCI 形式の指し手（`e2e4`, `e7e8q`）

use serde::{Deserialize, Serialize};

/// UCI 形式の指し手文字列。
///
/// 合法性はここでは検証しない。局面に対する解釈は `PositionService` が行う。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UciMove(String);

impl UciMove {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for UciMove {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UciMove {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UciMove {
    fn from(s: String) -> Self {
        Self(s)
    }
}
