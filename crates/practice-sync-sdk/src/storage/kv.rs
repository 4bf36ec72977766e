//! KV 存储模块 - 基于 sled 的本地持久化缓存
//!
//! 每个命名空间对应一个 Tree：登录用户各自一个，未登录时使用匿名 Tree。
//! 多个引擎实例（标签页）共享同一个 KvStore。

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{info, warn};

use crate::error::{PracticeSyncError, Result};

/// 打开数据库的最多尝试次数
const OPEN_ATTEMPTS: u32 = 6;
const OPEN_RETRY_BASE: Duration = Duration::from_millis(100);

/// 缓存命名空间
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// 未登录状态（也是旧版本地数据所在的位置）
    Anonymous,
    /// 登录用户
    User(String),
}

impl Namespace {
    fn tree_name(&self) -> String {
        match self {
            Self::Anonymous => "anonymous".to_string(),
            Self::User(uid) => format!("user_{}", uid),
        }
    }
}

/// 上一个标签页进程可能刚退出，文件锁尚未释放
fn is_lock_contention(error: &sled::Error) -> bool {
    match error {
        sled::Error::Io(e) => {
            e.kind() == std::io::ErrorKind::WouldBlock || e.to_string().contains("could not acquire lock")
        }
        _ => false,
    }
}

/// 打开 sled 数据库；文件锁被占用时指数退避重试
async fn open_db(path: &Path) -> Result<Db> {
    let mut attempt = 1;
    let mut delay = OPEN_RETRY_BASE;
    loop {
        match sled::open(path) {
            Ok(db) => return Ok(db),
            Err(e) if attempt < OPEN_ATTEMPTS && is_lock_contention(&e) => {
                warn!("⏳ KV 数据库被占用，{:?} 后第 {} 次重试", delay, attempt);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(PracticeSyncError::KvStore(format!("打开 sled 数据库失败: {}", e))),
        }
    }
}

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    db: Db,
    /// 已打开的命名空间 Tree
    trees: RwLock<HashMap<Namespace, Tree>>,
}

impl KvStore {
    pub async fn new(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| PracticeSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        let db = open_db(&kv_path).await?;
        info!("✅ KV 存储已打开: {}", kv_path.display());
        Ok(Self {
            db,
            trees: RwLock::new(HashMap::new()),
        })
    }

    /// 获取命名空间对应的 Tree（首次访问时打开）
    fn tree(&self, ns: &Namespace) -> Result<Tree> {
        if let Some(tree) = self.trees.read().get(ns) {
            return Ok(tree.clone());
        }
        let tree = self.db.open_tree(ns.tree_name())?;
        self.trees.write().insert(ns.clone(), tree.clone());
        Ok(tree)
    }

    pub fn get_raw(&self, ns: &Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree(ns)?.get(key)?.map(|v| v.to_vec()))
    }

    pub fn set_raw(&self, ns: &Namespace, key: &str, value: Vec<u8>) -> Result<()> {
        self.tree(ns)?.insert(key, value)?;
        Ok(())
    }

    /// JSON 序列化后写入
    pub fn set<V: Serialize>(&self, ns: &Namespace, key: &str, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| PracticeSyncError::Serialization(format!("序列化值失败: {}", e)))?;
        self.set_raw(ns, key, bytes)
    }

    /// 读取并反序列化；损坏的值返回 `Serialization` 错误
    pub fn get<V>(&self, ns: &Namespace, key: &str) -> Result<Option<V>>
    where
        V: for<'de> Deserialize<'de>,
    {
        match self.get_raw(ns, key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PracticeSyncError::Serialization(format!("反序列化值失败: {}", e))),
            None => Ok(None),
        }
    }

    /// 删除键，返回是否存在过
    pub fn remove(&self, ns: &Namespace, key: &str) -> Result<bool> {
        Ok(self.tree(ns)?.remove(key)?.is_some())
    }

    pub fn exists(&self, ns: &Namespace, key: &str) -> Result<bool> {
        Ok(self.tree(ns)?.contains_key(key)?)
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();
        let ns = Namespace::User("test_user".to_string());

        let test_data = json!({ "42": "challenging" });
        store.set(&ns, "problemRatings", &test_data).unwrap();
        let retrieved: serde_json::Value = store.get(&ns, "problemRatings").unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        assert!(store.exists(&ns, "problemRatings").unwrap());
        assert!(!store.exists(&ns, "starredProblems").unwrap());

        assert!(store.remove(&ns, "problemRatings").unwrap());
        assert!(!store.remove(&ns, "problemRatings").unwrap());
        let deleted: Option<serde_json::Value> = store.get(&ns, "problemRatings").unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();
        let alice = Namespace::User("alice".to_string());
        let anon = Namespace::Anonymous;

        store.set(&alice, "k", &1u32).unwrap();
        store.set(&anon, "k", &2u32).unwrap();
        assert_eq!(store.get::<u32>(&alice, "k").unwrap(), Some(1));
        assert_eq!(store.get::<u32>(&anon, "k").unwrap(), Some(2));

        store.remove(&alice, "k").unwrap();
        assert_eq!(store.get::<u32>(&alice, "k").unwrap(), None);
        assert_eq!(store.get::<u32>(&anon, "k").unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_corrupted_blob_is_a_serialization_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();
        let ns = Namespace::Anonymous;

        store.set_raw(&ns, "broken", b"{not json".to_vec()).unwrap();
        let result: Result<Option<serde_json::Value>> = store.get(&ns, "broken");
        assert!(matches!(result, Err(PracticeSyncError::Serialization(_))));
        assert!(store.exists(&ns, "broken").unwrap());
    }

    #[tokio::test]
    async fn test_reopen_after_drop_sees_data() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = KvStore::new(temp_dir.path()).await.unwrap();
            store.set(&Namespace::Anonymous, "k", &7u32).unwrap();
            store.flush().await.unwrap();
        }
        let store = KvStore::new(temp_dir.path()).await.unwrap();
        assert_eq!(store.get::<u32>(&Namespace::Anonymous, "k").unwrap(), Some(7));
    }

    #[test]
    fn only_lock_errors_are_retried() {
        let locked = sled::Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "could not acquire lock on \"db\"",
        ));
        assert!(is_lock_contention(&locked));
        assert!(!is_lock_contention(&sled::Error::Unsupported("x".to_string())));
    }
}
