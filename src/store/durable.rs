//! 持久化 KV 存储抽象
//!
//! 只使用 get / set / remove 契约；进程重启后仍可读取。提供内存版与单文件 JSON 版。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// 持久化 KV 接口
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// 内存版（测试与未配置持久化路径时使用）
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// 单文件 JSON 持久化：整个 KV 表存为一个 JSON 对象，每次写入整体落盘
#[derive(Debug)]
pub struct JsonFileDurableStore {
    path: PathBuf,
    /// 首次访问时从磁盘加载
    entries: Mutex<Option<HashMap<String, Value>>>,
}

impl JsonFileDurableStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<HashMap<String, Value>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) if data.trim().is_empty() => Ok(HashMap::new()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn flush(&self, entries: &HashMap<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for JsonFileDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(guard.as_ref().and_then(|m| m.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().await;
        let mut entries = match guard.take() {
            Some(m) => m,
            None => self.load().await?,
        };
        entries.insert(key.to_string(), value);
        let result = self.flush(&entries).await;
        *guard = Some(entries);
        result
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().await;
        let mut entries = match guard.take() {
            Some(m) => m,
            None => self.load().await?,
        };
        let existed = entries.remove(key).is_some();
        let result = if existed { self.flush(&entries).await } else { Ok(()) };
        *guard = Some(entries);
        result
    }
}

/// 创建持久化存储
///
/// 提供 path 时使用 JSON 文件，否则使用内存存储（进程重启后丢失）
pub fn create_durable_store(path: Option<&Path>) -> Arc<dyn DurableStore> {
    match path {
        Some(path) => {
            tracing::info!("Using JSON file durable store: {:?}", path);
            Arc::new(JsonFileDurableStore::new(path))
        }
        None => {
            tracing::info!("Using in-memory durable store");
            Arc::new(MemoryDurableStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryDurableStore::new();
        assert!(store.get("k").await.unwrap().is_none());
        store.set("k", json!({"token": "abc"})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"token": "abc"})));
        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("durable.json");

        let store = JsonFileDurableStore::new(&path);
        store.set("session:tab-1", json!({"token": "t1"})).await.unwrap();
        store.set("other", json!(1)).await.unwrap();
        store.remove("other").await.unwrap();
        drop(store);

        let reopened = JsonFileDurableStore::new(&path);
        assert_eq!(
            reopened.get("session:tab-1").await.unwrap(),
            Some(json!({"token": "t1"}))
        );
        assert!(reopened.get("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_file_store_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("durable.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonFileDurableStore::new(&path);
        assert!(matches!(store.get("k").await, Err(StoreError::Serde(_))));
    }
}
