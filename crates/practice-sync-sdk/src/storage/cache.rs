//! 本地缓存 - KvStore 之上的「键 → JSON」读写 + 变更广播
//!
//! 每次写入都会在共享的变更总线上发布一条 `CacheChange`，携带写入来源标签（哪个标签页、哪条路径）。
//! 同一个 `SharedCache` 上打开的多个 `LocalCache` 相当于同源的多个浏览器标签页。

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::kv::{KvStore, Namespace};

/// 缓存键
pub mod keys {
    /// 评价集合
    pub const RATINGS: &str = "problemRatings";
    /// 收藏集合
    pub const STARRED: &str = "starredProblems";
    /// 复习任务集合
    pub const RECALLS: &str = "problemRecalls";
    /// 练习会话集合
    pub const SESSIONS: &str = "marathonSessions";
    /// 当前练习会话 ID（仅本地）
    pub const CURRENT_SESSION: &str = "marathonCurrentSessionId";
    /// 毕业题目集合（仅本地，只增不减）
    pub const GRADUATED: &str = "graduatedProblems";
    /// 用户资料
    pub const PROFILE: &str = "userProfile";
    /// 旧数据迁移完成标记（匿名命名空间）
    pub const LEGACY_MIGRATION_DONE: &str = "legacyMigrationCompleted";
}

/// 标签页 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(pub u64);

/// 写入路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteSource {
    /// 外部/批量写入（同步引擎之外的写入者）
    External,
    /// 乐观更新路径
    Optimistic,
    /// 登录水合
    Hydration,
    /// 旧数据迁移
    Migration,
}

/// 写入来源标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteOrigin {
    pub tab: TabId,
    pub source: WriteSource,
}

/// 缓存变更通知（不保证携带值，接收方需重新读取缓存）
#[derive(Debug, Clone)]
pub struct CacheChange {
    pub key: String,
    pub namespace: Namespace,
    pub origin: WriteOrigin,
}

/// 多个标签页共享的缓存：KvStore + 变更总线
pub struct SharedCache {
    kv: Arc<KvStore>,
    changes: broadcast::Sender<CacheChange>,
    next_tab: AtomicU64,
}

impl SharedCache {
    /// 在目录下打开共享缓存
    pub async fn open(base_path: &Path, bus_capacity: usize) -> Result<Arc<Self>> {
        let kv = KvStore::new(base_path).await?;
        Ok(Self::from_store(Arc::new(kv), bus_capacity))
    }

    pub fn from_store(kv: Arc<KvStore>, bus_capacity: usize) -> Arc<Self> {
        let (changes, _) = broadcast::channel(bus_capacity.max(16));
        Arc::new(Self {
            kv,
            changes,
            next_tab: AtomicU64::new(1),
        })
    }

    /// 打开一个新的标签页视图（初始为匿名命名空间）
    pub fn open_tab(self: &Arc<Self>) -> LocalCache {
        let tab = TabId(self.next_tab.fetch_add(1, Ordering::Relaxed));
        debug!("打开缓存标签页: {:?}", tab);
        LocalCache {
            shared: self.clone(),
            tab,
            namespace: Arc::new(RwLock::new(Namespace::Anonymous)),
        }
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }
}

/// 单个标签页的缓存视图
#[derive(Clone)]
pub struct LocalCache {
    shared: Arc<SharedCache>,
    tab: TabId,
    namespace: Arc<RwLock<Namespace>>,
}

impl LocalCache {
    pub fn tab(&self) -> TabId {
        self.tab
    }

    pub fn origin(&self, source: WriteSource) -> WriteOrigin {
        WriteOrigin {
            tab: self.tab,
            source,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace.read().clone()
    }

    pub fn set_namespace(&self, ns: Namespace) {
        *self.namespace.write() = ns;
    }

    pub fn shared(&self) -> &Arc<SharedCache> {
        &self.shared
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.shared.subscribe()
    }

    /// 读取当前命名空间下的值；缺失或损坏时返回默认值
    pub fn read<T>(&self, key: &str) -> T
    where
        T: DeserializeOwned + Default,
    {
        let ns = self.namespace();
        self.read_in(&ns, key)
    }

    /// 读取指定命名空间下的值；解析失败视为空，不向上抛错
    pub fn read_in<T>(&self, ns: &Namespace, key: &str) -> T
    where
        T: DeserializeOwned + Default,
    {
        match self.shared.kv.get::<T>(ns, key) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                warn!("⚠️ 缓存 {} 读取失败，按空值处理: {}", key, e);
                T::default()
            }
        }
    }

    /// 读取原始字节（用于变更摘要）
    pub fn read_raw(&self, key: &str) -> Option<Vec<u8>> {
        let ns = self.namespace();
        match self.shared.kv.get_raw(&ns, key) {
            Ok(v) => v,
            Err(e) => {
                warn!("⚠️ 缓存 {} 读取失败: {}", key, e);
                None
            }
        }
    }

    pub fn contains_in(&self, ns: &Namespace, key: &str) -> bool {
        self.shared.kv.exists(ns, key).unwrap_or(false)
    }

    /// 写入当前命名空间并广播变更
    pub fn write<T>(&self, key: &str, value: &T, source: WriteSource) -> Result<()>
    where
        T: Serialize,
    {
        let ns = self.namespace();
        self.write_in(&ns, key, value, source)
    }

    pub fn write_in<T>(&self, ns: &Namespace, key: &str, value: &T, source: WriteSource) -> Result<()>
    where
        T: Serialize,
    {
        self.shared.kv.set(ns, key, value)?;
        self.publish(ns, key, source);
        Ok(())
    }

    /// 删除并广播变更
    pub fn remove_in(&self, ns: &Namespace, key: &str, source: WriteSource) -> Result<()> {
        if self.shared.kv.remove(ns, key)? {
            self.publish(ns, key, source);
        }
        Ok(())
    }

    fn publish(&self, ns: &Namespace, key: &str, source: WriteSource) {
        let change = CacheChange {
            key: key.to_string(),
            namespace: ns.clone(),
            origin: self.origin(source),
        };
        // 没有订阅者时 send 会失败，属正常场景
        if self.shared.changes.send(change).is_err() {
            debug!("缓存变更无订阅者: {}", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_are_broadcast_with_origin() {
        let temp_dir = TempDir::new().unwrap();
        let shared = SharedCache::open(temp_dir.path(), 64).await.unwrap();
        let tab_a = shared.open_tab();
        let tab_b = shared.open_tab();
        assert_ne!(tab_a.tab(), tab_b.tab());

        let mut rx = tab_b.subscribe();
        let mut ratings: BTreeMap<u64, String> = BTreeMap::new();
        ratings.insert(42, "yum".to_string());
        tab_a.write(keys::RATINGS, &ratings, WriteSource::External).unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, keys::RATINGS);
        assert_eq!(change.origin.tab, tab_a.tab());
        assert_eq!(change.origin.source, WriteSource::External);

        let seen: BTreeMap<u64, String> = tab_b.read(keys::RATINGS);
        assert_eq!(seen, ratings);
    }

    #[tokio::test]
    async fn corrupted_entry_reads_as_default() {
        let temp_dir = TempDir::new().unwrap();
        let shared = SharedCache::open(temp_dir.path(), 64).await.unwrap();
        let tab = shared.open_tab();
        shared
            .kv()
            .set_raw(&Namespace::Anonymous, keys::STARRED, b"[oops".to_vec())
            .unwrap();

        let starred: BTreeMap<u64, bool> = tab.read(keys::STARRED);
        assert!(starred.is_empty());
    }
}
