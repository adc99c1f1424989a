//! 基本型

mod color;
mod uci;

pub use color::Color;
pub use uci::UciMove;
