//! 内存远端 - 离线演示与测试用的 RemoteCollection 实现
//!
//! 支持注入失败（接下来 N 次调用失败 / 整体离线）、逐次延迟，并记录调用日志。

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{RemoteCollection, RemoteError, RemoteResult, RemoteStore};
use crate::storage::entities::{PracticeSession, Profile, Rating, RecallAssignment, StarredFlag};
use crate::sync::SyncEntity;

/// 远端调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp<K> {
    GetAll,
    Upsert(K),
    Delete(K),
}

pub struct MemoryRemote<E: SyncEntity> {
    rows: Mutex<BTreeMap<E::Key, E>>,
    /// 接下来失败的调用次数
    fail_next: AtomicUsize,
    offline: AtomicBool,
    /// 逐次调用的延迟（用完后无延迟）
    latencies: Mutex<VecDeque<Duration>>,
    log: Mutex<Vec<RemoteOp<E::Key>>>,
}

impl<E: SyncEntity> Default for MemoryRemote<E> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            fail_next: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            latencies: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
        }
    }
}

impl<E: SyncEntity> MemoryRemote<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前远端数据快照
    pub fn snapshot(&self) -> BTreeMap<E::Key, E> {
        self.rows.lock().clone()
    }

    pub fn get(&self, key: &E::Key) -> Option<E> {
        self.rows.lock().get(key).cloned()
    }

    /// 直接写入远端（模拟另一台设备），不记录调用日志
    pub fn seed(&self, key: E::Key, entity: E) {
        self.rows.lock().insert(key, entity);
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 为下一次调用追加延迟
    pub fn push_latency(&self, latency: Duration) {
        self.latencies.lock().push_back(latency);
    }

    pub fn ops(&self) -> Vec<RemoteOp<E::Key>> {
        self.log.lock().clone()
    }

    pub fn get_all_count(&self) -> usize {
        self.log.lock().iter().filter(|op| matches!(op, RemoteOp::GetAll)).count()
    }

    pub fn write_count(&self) -> usize {
        self.log.lock().iter().filter(|op| !matches!(op, RemoteOp::GetAll)).count()
    }

    async fn enter(&self, op: RemoteOp<E::Key>) -> RemoteResult<()> {
        let latency = self.latencies.lock().pop_front();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.log.lock().push(op);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("offline".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RemoteError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<E: SyncEntity> RemoteCollection<E> for MemoryRemote<E> {
    async fn get_all(&self) -> RemoteResult<BTreeMap<E::Key, E>> {
        self.enter(RemoteOp::GetAll).await?;
        Ok(self.snapshot())
    }

    async fn upsert(&self, key: &E::Key, entity: &E) -> RemoteResult<()> {
        self.enter(RemoteOp::Upsert(key.clone())).await?;
        self.rows.lock().insert(key.clone(), entity.clone());
        Ok(())
    }

    async fn delete(&self, key: &E::Key) -> RemoteResult<()> {
        self.enter(RemoteOp::Delete(key.clone())).await?;
        self.rows.lock().remove(key);
        Ok(())
    }
}

/// 一组内存远端，持有具体类型以便测试直接检查
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub ratings: Arc<MemoryRemote<Rating>>,
    pub starred: Arc<MemoryRemote<StarredFlag>>,
    pub recalls: Arc<MemoryRemote<RecallAssignment>>,
    pub sessions: Arc<MemoryRemote<PracticeSession>>,
    pub profiles: Arc<MemoryRemote<Profile>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> RemoteStore {
        RemoteStore {
            ratings: self.ratings.clone(),
            starred: self.starred.clone(),
            recalls: self.recalls.clone(),
            sessions: self.sessions.clone(),
            profiles: self.profiles.clone(),
        }
    }

    /// 所有集合同时离线/恢复
    pub fn set_offline(&self, offline: bool) {
        self.ratings.set_offline(offline);
        self.starred.set_offline(offline);
        self.recalls.set_offline(offline);
        self.sessions.set_offline(offline);
        self.profiles.set_offline(offline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::RatingValue;

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let remote: MemoryRemote<Rating> = MemoryRemote::new();
        remote.fail_next(1);

        let first = remote.upsert(&1, &Rating::new(1, RatingValue::Yum)).await;
        assert!(matches!(first, Err(RemoteError::Unavailable(_))));
        assert!(remote.get(&1).is_none());

        remote.upsert(&1, &Rating::new(1, RatingValue::Yum)).await.unwrap();
        assert_eq!(remote.get(&1).unwrap().value, RatingValue::Yum);
        assert_eq!(remote.ops(), vec![RemoteOp::Upsert(1), RemoteOp::Upsert(1)]);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let remote: MemoryRemote<Rating> = MemoryRemote::new();
        let rating = Rating::new(5, RatingValue::Challenging);
        remote.upsert(&5, &rating).await.unwrap();
        remote.upsert(&5, &rating).await.unwrap();
        assert_eq!(remote.snapshot().len(), 1);
        assert_eq!(remote.write_count(), 2);
    }

    #[tokio::test]
    async fn offline_rejects_everything() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        let store = backend.store();
        assert!(store.ratings.get_all().await.is_err());
        assert!(store.starred.delete(&3).await.is_err());
        backend.set_offline(false);
        assert!(store.ratings.get_all().await.unwrap().is_empty());
    }
}
