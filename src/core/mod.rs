//! 核心：错误类型与符号化错误码

pub mod error;

pub use error::{ErrorCode, OrchestratorError};
