//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `STAYLENS__*` 覆盖（双下划线表示嵌套，如 `STAYLENS__REMOTE__BASE_URL=http://...`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::remote::RetryConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// [remote] 段：比价服务地址与超时
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 单次 HTTP 请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            retry: RetrySection::default(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

/// [remote.retry] 段：限流 / 瞬时错误的重试
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    300
}

fn default_max_delay_ms() -> u64 {
    3000
}

/// [orchestrator] 段：缓存 TTL、刷新冷却、握手超时、低置信阈值
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    #[serde(default = "default_refresh_cooldown_secs")]
    pub refresh_cooldown_secs: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            result_ttl_secs: default_result_ttl_secs(),
            refresh_cooldown_secs: default_refresh_cooldown_secs(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            low_confidence_threshold: default_low_confidence_threshold(),
        }
    }
}

impl OrchestratorSection {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.refresh_cooldown_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_result_ttl_secs() -> u64 {
    300
}

fn default_refresh_cooldown_secs() -> u64 {
    60
}

fn default_handshake_timeout_ms() -> u64 {
    3000
}

fn default_low_confidence_threshold() -> f64 {
    0.65
}

/// [storage] 段：持久化 KV 文件；未设置时只保存在内存
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    pub durable_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 STAYLENS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 STAYLENS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STAYLENS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_fixed_policy() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.result_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.orchestrator.refresh_cooldown(), Duration::from_secs(60));
        assert_eq!(cfg.orchestrator.handshake_timeout(), Duration::from_secs(3));
        assert!((cfg.orchestrator.low_confidence_threshold - 0.65).abs() < f64::EPSILON);
        assert!(cfg.storage.durable_path.is_none());
    }

    #[test]
    fn test_load_repo_default_file() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.remote.base_url, "http://127.0.0.1:8787");
        assert_eq!(cfg.orchestrator.handshake_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("staylens.toml");
        std::fs::write(
            &path,
            "[remote]\nbase_url = \"https://compare.example\"\n\n[remote.retry]\nmax_retries = 4\n\n[orchestrator]\nrefresh_cooldown_secs = 30\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.remote.base_url, "https://compare.example");
        assert_eq!(cfg.remote.retry.to_retry_config().max_retries, 4);
        assert_eq!(cfg.orchestrator.refresh_cooldown_secs, 30);
        assert_eq!(cfg.orchestrator.result_ttl_secs, 300);
    }
}
