//! 乐观更新路径
//!
//! `set_value` 同步地把新值应用到内存（UI 立刻可见）并写入缓存，随后在后台执行一次远端写入：
//! - 同一实体 ID 的写入按发出顺序串行（每个写入等待前一个写入的完成信号）
//! - 失败时移除该写入：内存回到写入前的值，缓存同步回滚
//! - 成功时在释放下一个写入之前调用 `ConfirmHook`，钩子看到的 `previous` 一定是上一个已确认值
//!
//! 可见值 = 该键最新的未决写入，否则为已确认值。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::events::{EventManager, SyncEvent};
use crate::remote::RemoteCollection;
use crate::storage::cache::{LocalCache, WriteSource};
use crate::sync::entity::{decode_collection, SyncEntity};

/// 一次乐观写入的结果：远端确认返回 true，回滚返回 false
pub type PendingWrite = BoxFuture<'static, bool>;

/// 写入被远端确认后的回调
#[async_trait]
pub trait ConfirmHook<E: SyncEntity>: Send + Sync {
    async fn on_confirmed(&self, key: &E::Key, previous: Option<&E>, current: Option<&E>);
}

/// 查询当前有未决乐观写入的键
pub trait PendingKeys: Send + Sync {
    fn pending_keys(&self) -> HashSet<String>;
}

struct Pending<E> {
    seq: u64,
    value: Option<E>,
}

struct State<E: SyncEntity> {
    confirmed: BTreeMap<E::Key, E>,
    pending: HashMap<E::Key, VecDeque<Pending<E>>>,
    /// reset 时递增，旧纪元的写入结果被丢弃
    epoch: u64,
}

impl<E: SyncEntity> State<E> {
    fn visible(&self, key: &E::Key) -> Option<E> {
        match self.pending.get(key).and_then(|queue| queue.back()) {
            Some(pending) => pending.value.clone(),
            None => self.confirmed.get(key).cloned(),
        }
    }

    fn snapshot(&self) -> BTreeMap<E::Key, E> {
        let mut view = self.confirmed.clone();
        for (key, queue) in &self.pending {
            if let Some(pending) = queue.back() {
                match &pending.value {
                    Some(value) => {
                        view.insert(key.clone(), value.clone());
                    }
                    None => {
                        view.remove(key);
                    }
                }
            }
        }
        view
    }
}

struct Inner<E: SyncEntity> {
    cache: LocalCache,
    remote: Arc<dyn RemoteCollection<E>>,
    events: Arc<EventManager>,
    state: RwLock<State<E>>,
    /// 每个键最后一个写入的 (seq, 完成信号)
    chains: Mutex<HashMap<E::Key, (u64, oneshot::Receiver<()>)>>,
    hook: RwLock<Option<Arc<dyn ConfirmHook<E>>>>,
    next_seq: AtomicU64,
    remote_enabled: AtomicBool,
}

impl<E: SyncEntity> Inner<E> {
    fn persist_locked(&self, state: &State<E>) {
        if let Err(e) = self.cache.write(E::CACHE_KEY, &state.snapshot(), WriteSource::Optimistic) {
            warn!("⚠️ {} 写入本地缓存失败: {}", E::NAME, e);
        }
    }

    async fn complete(&self, seq: u64, epoch: u64, online: bool, key: &E::Key, value: Option<E>) -> bool {
        let previous = {
            let state = self.state.read();
            // 排队期间用户已切换，远端会话可能已属于下一个用户
            if state.epoch != epoch {
                debug!("{} 写入 {} 所属会话已结束，跳过远端写入", E::NAME, key);
                return false;
            }
            state.confirmed.get(key).cloned()
        };

        let result = if online {
            match &value {
                Some(entity) => self.remote.upsert(key, entity).await,
                None => self.remote.delete(key).await,
            }
        } else {
            Ok(())
        };

        {
            let mut state = self.state.write();
            if state.epoch != epoch {
                debug!("{} 写入 {} 所属会话已结束，丢弃结果", E::NAME, key);
                return result.is_ok();
            }
            let emptied = match state.pending.get_mut(key) {
                Some(queue) => {
                    queue.retain(|p| p.seq != seq);
                    queue.is_empty()
                }
                None => false,
            };
            if emptied {
                state.pending.remove(key);
            }
            match &result {
                Ok(()) => match &value {
                    Some(entity) => {
                        state.confirmed.insert(key.clone(), entity.clone());
                    }
                    None => {
                        state.confirmed.remove(key);
                    }
                },
                Err(_) => self.persist_locked(&state),
            }
        }

        match result {
            Ok(()) => {
                if online {
                    self.events.emit(SyncEvent::WriteConfirmed {
                        collection: E::NAME.to_string(),
                        key: key.to_string(),
                    });
                }
                let hook = self.hook.read().clone();
                if let Some(hook) = hook {
                    hook.on_confirmed(key, previous.as_ref(), value.as_ref()).await;
                }
                true
            }
            Err(e) => {
                warn!("↩️ {} 写入 {} 失败，已回滚: {}", E::NAME, key, e);
                self.events.emit(SyncEvent::WriteRolledBack {
                    collection: E::NAME.to_string(),
                    key: key.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }
}

/// 单个实体集合的乐观更新入口
pub struct OptimisticCollection<E: SyncEntity> {
    inner: Arc<Inner<E>>,
}

impl<E: SyncEntity> Clone for OptimisticCollection<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: SyncEntity> OptimisticCollection<E> {
    pub fn new(cache: LocalCache, remote: Arc<dyn RemoteCollection<E>>, events: Arc<EventManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                remote,
                events,
                state: RwLock::new(State {
                    confirmed: BTreeMap::new(),
                    pending: HashMap::new(),
                    epoch: 0,
                }),
                chains: Mutex::new(HashMap::new()),
                hook: RwLock::new(None),
                next_seq: AtomicU64::new(1),
                remote_enabled: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_hook(&self, hook: Arc<dyn ConfirmHook<E>>) {
        *self.inner.hook.write() = Some(hook);
    }

    /// 关闭时只写本地（未登录）
    pub fn set_remote_enabled(&self, enabled: bool) {
        self.inner.remote_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn remote_enabled(&self) -> bool {
        self.inner.remote_enabled.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &E::Key) -> Option<E> {
        self.inner.state.read().visible(key)
    }

    pub fn snapshot(&self) -> BTreeMap<E::Key, E> {
        self.inner.state.read().snapshot()
    }

    /// 仅已确认值（不含未决写入）
    pub fn confirmed_snapshot(&self) -> BTreeMap<E::Key, E> {
        self.inner.state.read().confirmed.clone()
    }

    pub fn has_pending(&self, key: &E::Key) -> bool {
        self.inner.state.read().pending.contains_key(key)
    }

    /// 乐观写入；`None` 表示删除
    ///
    /// 必须在 tokio 运行时内调用。返回的 future 可以丢弃，写入仍会完成。
    pub fn set_value(&self, key: E::Key, value: Option<E>) -> PendingWrite {
        let inner = self.inner.clone();
        let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let online = inner.remote_enabled.load(Ordering::SeqCst);

        let epoch = {
            let mut state = inner.state.write();
            state
                .pending
                .entry(key.clone())
                .or_default()
                .push_back(Pending { seq, value: value.clone() });
            inner.persist_locked(&state);
            state.epoch
        };

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let predecessor = inner
            .chains
            .lock()
            .insert(key.clone(), (seq, done_rx))
            .map(|(_, rx)| rx);

        let (result_tx, result_rx) = oneshot::channel::<bool>();
        tokio::spawn(async move {
            if let Some(predecessor) = predecessor {
                // 前一个写入的任务若已退出，同样视为完成
                let _ = predecessor.await;
            }
            let ok = inner.complete(seq, epoch, online, &key, value).await;
            {
                let mut chains = inner.chains.lock();
                if chains.get(&key).map_or(false, |(last, _)| *last == seq) {
                    chains.remove(&key);
                }
            }
            let _ = done_tx.send(());
            let _ = result_tx.send(ok);
        });

        Box::pin(async move { result_rx.await.unwrap_or(false) })
    }

    /// 从缓存重新加载已确认值（未决写入保留）
    pub fn load_from_cache(&self) {
        let loaded = self
            .inner
            .cache
            .read_raw(E::CACHE_KEY)
            .and_then(|bytes| decode_collection::<E>(&bytes))
            .unwrap_or_default();
        self.inner.state.write().confirmed = loaded;
    }

    /// 替换已确认值（不写缓存）
    pub fn replace_confirmed(&self, entries: BTreeMap<E::Key, E>) {
        self.inner.state.write().confirmed = entries;
    }

    /// 把当前可见值写入缓存
    pub fn persist(&self, source: WriteSource) -> crate::error::Result<()> {
        let state = self.inner.state.read();
        self.inner.cache.write(E::CACHE_KEY, &state.snapshot(), source)
    }

    /// 丢弃全部内存状态；排队中的写入不再访问远端，进行中的写入结果被丢弃
    pub fn reset(&self) {
        let mut state = self.inner.state.write();
        state.epoch += 1;
        state.confirmed.clear();
        state.pending.clear();
    }
}

impl<E: SyncEntity> PendingKeys for OptimisticCollection<E> {
    fn pending_keys(&self) -> HashSet<String> {
        self.inner
            .state
            .read()
            .pending
            .keys()
            .map(|key| key.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::remote::RemoteOp;
    use crate::storage::cache::keys;
    use crate::storage::entities::{Rating, RatingValue};
    use crate::storage::SharedCache;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn ratings() -> (TempDir, OptimisticCollection<Rating>, Arc<MemoryRemote<Rating>>) {
        let temp_dir = TempDir::new().unwrap();
        let shared = SharedCache::open(temp_dir.path(), 64).await.unwrap();
        let remote = Arc::new(MemoryRemote::<Rating>::new());
        let collection =
            OptimisticCollection::new(shared.open_tab(), remote.clone(), Arc::new(EventManager::new(64)));
        collection.set_remote_enabled(true);
        (temp_dir, collection, remote)
    }

    fn cached(collection: &OptimisticCollection<Rating>) -> BTreeMap<u64, Rating> {
        collection.inner.cache.read(keys::RATINGS)
    }

    #[tokio::test]
    async fn applies_immediately_and_confirms() {
        let (_dir, ratings, remote) = ratings().await;
        let write = ratings.set_value(42, Some(Rating::new(42, RatingValue::Challenging)));

        assert_eq!(ratings.get(&42).unwrap().value, RatingValue::Challenging);
        assert!(ratings.has_pending(&42));
        assert!(write.await);

        assert!(!ratings.has_pending(&42));
        assert_eq!(remote.get(&42).unwrap().value, RatingValue::Challenging);
        assert_eq!(cached(&ratings)[&42].value, RatingValue::Challenging);
    }

    #[tokio::test]
    async fn failure_rolls_back_memory_and_cache() {
        let (_dir, ratings, remote) = ratings().await;
        assert!(ratings.set_value(7, Some(Rating::new(7, RatingValue::Yum))).await);

        remote.fail_next(1);
        let write = ratings.set_value(7, Some(Rating::new(7, RatingValue::Exhausting)));
        assert_eq!(ratings.get(&7).unwrap().value, RatingValue::Exhausting);
        assert!(!write.await);

        assert_eq!(ratings.get(&7).unwrap().value, RatingValue::Yum);
        assert_eq!(cached(&ratings)[&7].value, RatingValue::Yum);

        remote.fail_next(1);
        assert!(!ratings.set_value(7, None).await);
        assert_eq!(ratings.get(&7).unwrap().value, RatingValue::Yum);
    }

    #[tokio::test]
    async fn same_key_writes_complete_in_issue_order() {
        let (_dir, ratings, remote) = ratings().await;
        remote.push_latency(Duration::from_millis(80));

        let first = ratings.set_value(1, Some(Rating::new(1, RatingValue::Challenging)));
        let second = ratings.set_value(1, Some(Rating::new(1, RatingValue::Desirable)));
        let other = ratings.set_value(2, Some(Rating::new(2, RatingValue::Yum)));

        let (a, b, c) = tokio::join!(first, second, other);
        assert!(a && b && c);
        assert_eq!(remote.get(&1).unwrap().value, RatingValue::Desirable);
        assert_eq!(ratings.get(&1).unwrap().value, RatingValue::Desirable);

        let ops_for_one: Vec<_> = remote
            .ops()
            .into_iter()
            .filter(|op| matches!(op, RemoteOp::Upsert(1)))
            .collect();
        assert_eq!(ops_for_one.len(), 2);
    }

    struct Recorder(Mutex<Vec<(Option<RatingValue>, Option<RatingValue>)>>);

    #[async_trait]
    impl ConfirmHook<Rating> for Recorder {
        async fn on_confirmed(&self, _key: &u64, previous: Option<&Rating>, current: Option<&Rating>) {
            self.0.lock().push((previous.map(|r| r.value), current.map(|r| r.value)));
        }
    }

    #[tokio::test]
    async fn hook_sees_previous_confirmed_value() {
        let (_dir, ratings, remote) = ratings().await;
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        ratings.set_hook(recorder.clone());

        remote.push_latency(Duration::from_millis(50));
        let a = ratings.set_value(9, Some(Rating::new(9, RatingValue::Incomprehensible)));
        let b = ratings.set_value(9, Some(Rating::new(9, RatingValue::Yum)));
        let c = ratings.set_value(9, None);
        let _ = tokio::join!(a, b, c);

        assert_eq!(
            *recorder.0.lock(),
            vec![
                (None, Some(RatingValue::Incomprehensible)),
                (Some(RatingValue::Incomprehensible), Some(RatingValue::Yum)),
                (Some(RatingValue::Yum), None),
            ]
        );
    }

    #[tokio::test]
    async fn local_only_mode_skips_remote() {
        let (_dir, ratings, remote) = ratings().await;
        ratings.set_remote_enabled(false);
        assert!(ratings.set_value(3, Some(Rating::new(3, RatingValue::Yum))).await);
        assert!(remote.ops().is_empty());
        assert_eq!(ratings.get(&3).unwrap().value, RatingValue::Yum);
    }

    #[tokio::test]
    async fn reset_discards_in_flight_results() {
        let (_dir, ratings, remote) = ratings().await;
        remote.push_latency(Duration::from_millis(50));
        let write = ratings.set_value(5, Some(Rating::new(5, RatingValue::Yum)));
        // 等待远端调用开始
        tokio::time::sleep(Duration::from_millis(10)).await;
        ratings.reset();
        assert!(write.await);
        assert!(ratings.get(&5).is_none());
        assert!(ratings.pending_keys().is_empty());
    }

    #[tokio::test]
    async fn queued_writes_skip_remote_after_reset() {
        let (_dir, ratings, remote) = ratings().await;
        remote.push_latency(Duration::from_millis(80));
        let first = ratings.set_value(5, Some(Rating::new(5, RatingValue::Challenging)));
        let second = ratings.set_value(5, Some(Rating::new(5, RatingValue::Desirable)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        ratings.reset();
        let (first, second) = tokio::join!(first, second);
        assert!(first);
        assert!(!second);
        assert_eq!(remote.ops(), vec![RemoteOp::Upsert(5)]);
        assert_eq!(remote.get(&5).unwrap().value, RatingValue::Challenging);
        assert!(ratings.get(&5).is_none());
    }
}
