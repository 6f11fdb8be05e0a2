//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 未设置 RUST_LOG 时的默认过滤
const DEFAULT_DIRECTIVE: &str = "staylens=info";

/// 初始化日志；日志写到 stderr，stdout 留给 JSON 行协议
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
