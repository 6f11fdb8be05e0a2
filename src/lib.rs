//! Staylens - 酒店比价请求编排层
//!
//! 模块划分：
//! - **itinerary**: 行程参数、行程键、请求指纹、节流键
//! - **store**: 页面上下文（内存）、上下文令牌（内存 + 持久 KV）
//! - **cache**: 带 TTL 的比价结果缓存
//! - **inflight**: 同指纹在途调用去重
//! - **outcome**: 结果质量追踪与 hint 重试判定
//! - **throttle**: 手动刷新冷却
//! - **recovery**: 会话上下文恢复（内存 → 持久层 → 握手）
//! - **remote**: 远端比价客户端抽象与实现（HTTP / 重试 / Mock）
//! - **gateway**: Dispatcher 与消息协议
//! - **config** / **observability** / **core**: 配置、日志、错误类型

pub mod cache;
pub mod config;
pub mod core;
pub mod gateway;
pub mod inflight;
pub mod itinerary;
pub mod observability;
pub mod outcome;
pub mod recovery;
pub mod remote;
pub mod store;
pub mod throttle;

pub use crate::core::{ErrorCode, OrchestratorError};
pub use gateway::{Dispatcher, GatewayMessage, Request, Response};
