//! 变更监听器 - 吸收乐观路径之外的缓存写入并批量对账到远端
//!
//! 每个逻辑键独立维护：
//! - 防抖计时器：新写入取消并重启计时器，同一键的连续写入合并为一轮对账
//! - 进行中标记：计时器到期时若已有对账在进行，只记下 `rerun`，当前轮结束后立即重新对账
//! - 上次同步摘要：缓存内容的 sha256，与摘要一致时跳过网络请求
//!
//! 写入来源决定处理方式：外部写入与迁移写入触发对账；乐观写入与其他标签页的水合只使摘要失效；
//! 本标签页的水合由水合流程显式更新摘要。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PracticeSyncError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::remote::{RemoteCollection, RemoteError, RemoteStore};
use crate::storage::cache::{CacheChange, LocalCache, WriteSource};
use crate::storage::entities::{PracticeSession, Rating, RecallAssignment, StarredFlag};
use crate::sync::entity::{decode_collection, plan_reconcile, SyncEntity};
use crate::sync::optimistic::PendingKeys;
use crate::sync::sync_key::SyncKey;

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// 一轮对账的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub upserted: usize,
    pub deleted: usize,
    /// 因有未决乐观写入而跳过的条目
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileReport {
    /// 本地状态已完整反映到远端
    pub fn is_clean(&self) -> bool {
        self.skipped == 0 && self.failed == 0
    }
}

/// 本地优先对账：推送本地新增/变更，删除本地已不存在的远端条目
///
/// 单个条目失败只记录，不中断本轮。
pub async fn reconcile_collection<E: SyncEntity>(
    remote: &dyn RemoteCollection<E>,
    local: &BTreeMap<E::Key, E>,
    skip: &HashSet<String>,
) -> std::result::Result<ReconcileReport, RemoteError> {
    let remote_entries = remote.get_all().await?;
    let plan = plan_reconcile::<E>(local, &remote_entries);
    let mut report = ReconcileReport::default();

    for key in plan.upserts {
        if skip.contains(&key.to_string()) {
            report.skipped += 1;
            continue;
        }
        let Some(entity) = local.get(&key) else {
            continue;
        };
        match remote.upsert(&key, entity).await {
            Ok(()) => report.upserted += 1,
            Err(e) => {
                warn!("⚠️ {} 推送 {} 失败: {}", E::NAME, key, e);
                report.failed += 1;
            }
        }
    }

    for key in plan.deletes {
        if skip.contains(&key.to_string()) {
            report.skipped += 1;
            continue;
        }
        match remote.delete(&key).await {
            Ok(()) => report.deleted += 1,
            Err(e) => {
                warn!("⚠️ {} 删除 {} 失败: {}", E::NAME, key, e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

#[derive(Default)]
struct KeyState {
    /// (代数, 计时器)
    timer: Option<(u64, CancellationToken)>,
    timer_generation: u64,
    in_flight: bool,
    rerun: bool,
    memo: Option<String>,
    passes: u64,
}

struct WatcherInner {
    cache: LocalCache,
    remote: RemoteStore,
    events: Arc<EventManager>,
    debounce: Duration,
    keys: Mutex<HashMap<SyncKey, KeyState>>,
    pending: RwLock<HashMap<SyncKey, Arc<dyn PendingKeys>>>,
    active: AtomicBool,
    shutdown: CancellationToken,
}

impl WatcherInner {
    fn observe(self: &Arc<Self>, change: &CacheChange) {
        let Some(key) = SyncKey::from_cache_key(&change.key) else {
            return;
        };
        if change.namespace != self.cache.namespace() || !self.active.load(Ordering::SeqCst) {
            return;
        }
        let own_tab = change.origin.tab == self.cache.tab();
        match change.origin.source {
            WriteSource::External | WriteSource::Migration => self.schedule(key),
            WriteSource::Hydration if own_tab => {}
            WriteSource::Optimistic | WriteSource::Hydration => self.invalidate(key),
        }
    }

    fn invalidate(&self, key: SyncKey) {
        if let Some(state) = self.keys.lock().get_mut(&key) {
            state.memo = None;
        }
    }

    fn schedule(self: &Arc<Self>, key: SyncKey) {
        let token = self.shutdown.child_token();
        let generation = {
            let mut keys = self.keys.lock();
            let state = keys.entry(key).or_default();
            state.timer_generation += 1;
            if let Some((_, previous)) = state.timer.replace((state.timer_generation, token.clone())) {
                previous.cancel();
            }
            state.timer_generation
        };
        debug!("⏱️ {} 防抖计时重启", key);

        let inner = self.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(debounce) => {
                    {
                        let mut keys = inner.keys.lock();
                        if let Some(state) = keys.get_mut(&key) {
                            if state.timer.as_ref().map_or(false, |(g, _)| *g == generation) {
                                state.timer = None;
                            }
                        }
                    }
                    inner.run_pass(key).await;
                }
            }
        });
    }

    /// 执行对账；已有对账进行中时只标记重跑
    async fn run_pass(self: &Arc<Self>, key: SyncKey) {
        {
            let mut keys = self.keys.lock();
            let state = keys.entry(key).or_default();
            if state.in_flight {
                debug!("{} 对账进行中，结束后重跑", key);
                state.rerun = true;
                return;
            }
            state.in_flight = true;
        }

        loop {
            self.reconcile_once(key).await;

            let again = {
                let mut keys = self.keys.lock();
                let state = keys.entry(key).or_default();
                if state.rerun {
                    state.rerun = false;
                    true
                } else {
                    state.in_flight = false;
                    false
                }
            };
            if !again {
                break;
            }
        }
    }

    async fn reconcile_once(&self, key: SyncKey) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        // 键不存在（例如水合拉取失败）时没有可对账的本地数据
        let Some(bytes) = self.cache.read_raw(key.cache_key()) else {
            debug!("{} 缓存不存在，跳过对账", key);
            return;
        };
        let raw = bytes.as_slice();
        let fingerprint = digest(raw);

        let unchanged = self
            .keys
            .lock()
            .get(&key)
            .and_then(|state| state.memo.as_ref())
            .map_or(false, |memo| *memo == fingerprint);
        if unchanged {
            debug!("{} 与上次同步一致，跳过", key);
            return;
        }

        let skip = self
            .pending
            .read()
            .get(&key)
            .map(|source| source.pending_keys())
            .unwrap_or_default();

        self.events.emit(SyncEvent::SyncStarted {
            sync_key: key.as_str().to_string(),
        });
        let result = match key {
            SyncKey::Ratings => Self::reconcile_typed::<Rating>(&*self.remote.ratings, raw, &skip).await,
            SyncKey::Starred => Self::reconcile_typed::<StarredFlag>(&*self.remote.starred, raw, &skip).await,
            SyncKey::Recalls => {
                Self::reconcile_typed::<RecallAssignment>(&*self.remote.recalls, raw, &skip).await
            }
            SyncKey::Sessions => {
                Self::reconcile_typed::<PracticeSession>(&*self.remote.sessions, raw, &skip).await
            }
        };

        match result {
            Ok(report) => {
                {
                    let mut keys = self.keys.lock();
                    let state = keys.entry(key).or_default();
                    state.passes += 1;
                    if report.is_clean() {
                        state.memo = Some(fingerprint);
                    }
                }
                if report.failed > 0 {
                    self.events.emit(SyncEvent::SyncFailed {
                        sync_key: key.as_str().to_string(),
                        error: format!("{} 个条目推送失败", report.failed),
                    });
                } else {
                    info!(
                        "🔄 {} 对账完成: upsert={}, delete={}, skipped={}",
                        key, report.upserted, report.deleted, report.skipped
                    );
                    self.events.emit(SyncEvent::SyncCompleted {
                        sync_key: key.as_str().to_string(),
                        upserted: report.upserted,
                        deleted: report.deleted,
                    });
                }
            }
            Err(e) => {
                warn!("⚠️ {} 对账失败，等待下一次写入: {}", key, e);
                self.events.emit(SyncEvent::SyncFailed {
                    sync_key: key.as_str().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn reconcile_typed<E: SyncEntity>(
        remote: &dyn RemoteCollection<E>,
        raw: &[u8],
        skip: &HashSet<String>,
    ) -> Result<ReconcileReport> {
        // 整体无法解析时不能当成空集合，否则会删除远端全部条目
        let local = decode_collection::<E>(raw)
            .ok_or_else(|| PracticeSyncError::Serialization(format!("{} 缓存已损坏", E::NAME)))?;
        Ok(reconcile_collection(remote, &local, skip).await?)
    }
}

/// 缓存变更监听器
#[derive(Clone)]
pub struct ChangeLogWatcher {
    inner: Arc<WatcherInner>,
}

impl ChangeLogWatcher {
    pub fn new(cache: LocalCache, remote: RemoteStore, events: Arc<EventManager>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                cache,
                remote,
                events,
                debounce,
                keys: Mutex::new(HashMap::new()),
                pending: RwLock::new(HashMap::new()),
                active: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// 注册乐观路径的未决写入查询，对账时跳过这些条目
    pub fn register_pending(&self, key: SyncKey, source: Arc<dyn PendingKeys>) {
        self.inner.pending.write().insert(key, source);
    }

    /// 启动缓存变更监听任务
    pub fn start(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut changes = inner.cache.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(change) => inner.observe(&change),
                        Err(RecvError::Lagged(missed)) => {
                            warn!("⚠️ 缓存变更积压，丢失 {} 条通知，全量重新对账", missed);
                            for key in SyncKey::ALL {
                                inner.invalidate(key);
                                inner.schedule(key);
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("缓存变更监听任务退出");
        })
    }

    /// 有登录用户时才对账
    pub fn set_active(&self, active: bool) {
        self.inner.active.store(active, Ordering::SeqCst);
    }

    /// 手动触发某个键的防抖对账
    pub fn schedule(&self, key: SyncKey) {
        self.inner.schedule(key);
    }

    pub fn invalidate(&self, key: SyncKey) {
        self.inner.invalidate(key);
    }

    /// 记录某个键刚被同步到与 `value` 一致的状态
    pub fn mark_synced<T: Serialize>(&self, key: SyncKey, value: &T) {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.inner.keys.lock().entry(key).or_default().memo = Some(digest(&bytes));
            }
            Err(e) => warn!("⚠️ {} 摘要计算失败: {}", key, e),
        }
    }

    /// 立即执行所有尚在防抖中的对账
    pub async fn flush(&self) {
        let due: Vec<SyncKey> = {
            let mut keys = self.inner.keys.lock();
            keys.iter_mut()
                .filter_map(|(key, state)| {
                    state.timer.take().map(|(_, token)| {
                        token.cancel();
                        *key
                    })
                })
                .collect()
        };
        futures::future::join_all(due.into_iter().map(|key| self.inner.run_pass(key))).await;
    }

    /// 忽略摘要，对所有键立即执行一轮完整对账
    pub async fn force_resync(&self) {
        {
            let mut keys = self.inner.keys.lock();
            for key in SyncKey::ALL {
                let state = keys.entry(key).or_default();
                state.memo = None;
                if let Some((_, token)) = state.timer.take() {
                    token.cancel();
                }
            }
        }
        info!("🔁 强制重新对账");
        futures::future::join_all(SyncKey::ALL.into_iter().map(|key| self.inner.run_pass(key))).await;
    }

    /// 取消所有计时器并清空摘要（切换用户时调用）
    pub fn reset(&self) {
        let mut keys = self.inner.keys.lock();
        for state in keys.values_mut() {
            if let Some((_, token)) = state.timer.take() {
                token.cancel();
            }
            state.memo = None;
        }
    }

    /// 实际访问了远端的对账轮数
    pub fn pass_count(&self, key: SyncKey) -> u64 {
        self.inner.keys.lock().get(&key).map_or(0, |state| state.passes)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}
