//! 会话级存储：页面上下文、持久化 KV、上下文令牌

mod context;
mod durable;
mod token;

pub use context::{ContextStore, PageContext};
pub use durable::{
    create_durable_store, DurableStore, JsonFileDurableStore, MemoryDurableStore, StoreError,
};
pub use token::{ContextToken, TokenStore};
