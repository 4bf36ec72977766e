//! 存储模块 - 本地优先的数据持久化层
//!
//! 分层：
//! - KvStore: sled 之上的命名空间化键值存储
//! - LocalCache / SharedCache: 带写入来源标签的缓存视图与跨标签页变更广播
//! - Entities: 同步实体定义

pub mod cache;
pub mod entities;
pub mod kv;

pub use cache::{keys, CacheChange, LocalCache, SharedCache, TabId, WriteOrigin, WriteSource};
pub use entities::*;
pub use kv::{KvStore, Namespace};
