//! 远端比价 API 边界：客户端抽象与实现（HTTP / 重试包装 / Mock）

pub mod http;
pub mod mock;
pub mod retry;
pub mod traits;

pub use http::HttpRemoteClient;
pub use mock::MockRemoteClient;
pub use retry::{RetryConfig, RetryingRemoteClient};
pub use traits::{
    CompareRequest, ComparePayload, MatchInfo, Offer, PrefetchResult, RemoteClient, RemoteError,
};
