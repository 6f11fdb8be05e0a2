//! 网关：请求编排与消息协议
//!
//! - **DispatcherBuilder**：注入共享的存储句柄，未注入的按配置创建
//! - **Dispatcher**：把会话请求路由到上下文/令牌存储、结果缓存、去重、节流与远端客户端
//! - **message**：与传输层无关的请求/响应，以及 stdio 等传输使用的 `GatewayMessage` 信封

mod builder;
mod dispatcher;
mod message;

pub use builder::DispatcherBuilder;
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use message::{CompareReply, GatewayMessage, MessageType, Request, Response};
