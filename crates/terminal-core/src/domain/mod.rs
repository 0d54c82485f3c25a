//! 터미널 도메인 모델.

mod equity;
mod execution;
mod market;
mod order;
mod position;

pub use equity::*;
pub use execution::*;
pub use market::*;
pub use order::*;
pub use position::*;
