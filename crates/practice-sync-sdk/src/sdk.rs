//! 统一 SDK 接口 - PracticeSyncSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! PracticeSyncSDK (业务逻辑层)
//!   ├── CollectionSet (乐观更新层)
//!   ├── ChangeLogWatcher (批量对账层)
//!   ├── Hydrator / LegacyMigrator (登录引导层)
//!   ├── RecallScheduler / PracticeSessionManager (业务规则层)
//!   ├── LocalCache (存储层)
//!   └── EventManager (事件系统层)
//! ```
//!
//! 一个 SDK 实例对应一个「标签页」：多个实例共享同一个 `SharedCache` 时，
//! 彼此通过缓存变更总线感知对方的写入并重新加载内存状态。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MigrationMode, SignOutPolicy, SyncConfig};
use crate::error::{PracticeSyncError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::recall::{GraduationLedger, RecallScheduler};
use crate::remote::{RestClient, RemoteStore};
use crate::sessions::PracticeSessionManager;
use crate::storage::cache::{keys, LocalCache, SharedCache, WriteSource};
use crate::storage::entities::{
    is_solved, ProblemId, Profile, Rating, RatingValue, RecallAssignment, StarredFlag,
};
use crate::storage::kv::Namespace;
use crate::sync::{ChangeLogWatcher, CollectionSet, Hydrator, LegacyMigrator, MigrationReport, PendingWrite};
use crate::utils::{Clock, SystemClock};

/// 退出登录时清除的用户缓存键（毕业集合保留）
const CLEARED_ON_SIGN_OUT: [&str; 6] = [
    keys::RATINGS,
    keys::STARRED,
    keys::RECALLS,
    keys::SESSIONS,
    keys::CURRENT_SESSION,
    keys::PROFILE,
];

/// SDK 主接口
pub struct PracticeSyncSDK {
    config: SyncConfig,
    cache: LocalCache,
    events: Arc<EventManager>,
    collections: CollectionSet,
    watcher: ChangeLogWatcher,
    hydrator: Hydrator,
    migrator: LegacyMigrator,
    scheduler: Arc<RecallScheduler>,
    sessions: PracticeSessionManager,
    clock: Arc<dyn Clock>,

    /// 当前登录用户
    current_user: RwLock<Option<String>>,
    /// 串行化登录/退出
    auth_lock: tokio::sync::Mutex<()>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
}

impl PracticeSyncSDK {
    /// 在共享缓存上打开一个新的标签页
    pub async fn initialize(config: SyncConfig, shared: Arc<SharedCache>, remote: RemoteStore) -> Result<Arc<Self>> {
        Self::initialize_with_clock(config, shared, remote, Arc::new(SystemClock)).await
    }

    /// 按配置打开缓存目录并连接 REST 远端
    ///
    /// 返回的 `RestClient` 由调用方在认证状态变化时设置会话。
    pub async fn open(config: SyncConfig) -> Result<(Arc<Self>, Arc<RestClient>)> {
        let rest = config
            .rest
            .clone()
            .ok_or_else(|| PracticeSyncError::Config("未配置远端 REST 服务".to_string()))?;
        let client = RestClient::new(rest)?;
        let shared = SharedCache::open(&config.data_dir, config.cache_bus_capacity).await?;
        let sdk = Self::initialize(config, shared, client.remote_store()).await?;
        Ok((sdk, client))
    }

    pub async fn initialize_with_clock(
        config: SyncConfig,
        shared: Arc<SharedCache>,
        remote: RemoteStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 PracticeSyncSDK...");
        config.validate()?;

        // === 第1层：缓存与事件 ===
        let cache = shared.open_tab();
        let events = Arc::new(EventManager::new(config.event_capacity));

        // === 第2层：乐观集合与监听器 ===
        let collections = CollectionSet::new(&cache, &remote, &events);
        let watcher = ChangeLogWatcher::new(cache.clone(), remote.clone(), events.clone(), config.debounce());
        collections.register_with(&watcher);

        // === 第3层：业务规则 ===
        let ledger = GraduationLedger::new(cache.clone());
        let scheduler = Arc::new(RecallScheduler::new(
            collections.recalls.clone(),
            ledger,
            clock.clone(),
            events.clone(),
        ));
        collections.ratings.set_hook(scheduler.clone());
        let sessions = PracticeSessionManager::new(collections.sessions.clone(), cache.clone(), clock.clone());

        // === 第4层：登录引导 ===
        let hydrator = Hydrator::new(collections.clone(), remote.clone(), watcher.clone(), events.clone());
        let migrator = LegacyMigrator::new(cache.clone(), remote, collections.clone(), events.clone());

        let sdk = Arc::new(Self {
            config,
            cache,
            events,
            collections,
            watcher,
            hydrator,
            migrator,
            scheduler,
            sessions,
            clock,
            current_user: RwLock::new(None),
            auth_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        });

        // 未登录：匿名命名空间，只写本地
        sdk.load_namespace(Namespace::Anonymous);

        let watcher_task = sdk.watcher.start();
        let listener_task = sdk.spawn_cross_tab_listener();
        sdk.tasks.lock().extend([watcher_task, listener_task]);

        info!("✅ PracticeSyncSDK 初始化完成 (tab={:?})", sdk.cache.tab());
        Ok(sdk)
    }

    fn load_namespace(&self, ns: Namespace) {
        let signed_in = ns != Namespace::Anonymous;
        self.cache.set_namespace(ns);
        self.collections.reset();
        self.collections.load_from_cache();
        self.collections.set_remote_enabled(signed_in);
        self.scheduler.ledger().load();
        self.sessions.load_current();
    }

    /// 监听其他标签页的写入，重新加载对应集合
    fn spawn_cross_tab_listener(&self) -> JoinHandle<()> {
        let mut changes = self.cache.subscribe();
        let cache = self.cache.clone();
        let collections = self.collections.clone();
        let ledger = self.scheduler.ledger().clone();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(change) => change,
                        Err(RecvError::Lagged(missed)) => {
                            warn!("⚠️ 跨标签页通知积压 {} 条，全量重新加载", missed);
                            collections.load_from_cache();
                            ledger.merge_from_cache();
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    }
                };

                if change.namespace != cache.namespace() {
                    continue;
                }
                let remote_tab = change.origin.tab != cache.tab();
                // 本标签页的同步写入已在内存中
                if !remote_tab && change.origin.source != WriteSource::External {
                    continue;
                }

                let reloaded = if change.key == keys::GRADUATED {
                    ledger.merge_from_cache();
                    true
                } else {
                    collections.reload_key(&change.key)
                };
                if reloaded {
                    debug!("🔃 重新加载 {} (来自 {:?})", change.key, change.origin);
                    events.emit(SyncEvent::DataChanged {
                        cache_key: change.key.clone(),
                        remote_tab,
                    });
                }
            }
            debug!("跨标签页监听任务退出");
        })
    }

    fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PracticeSyncError::ShuttingDown("SDK 正在关闭".to_string()));
        }
        Ok(())
    }

    // ========== 认证 ==========

    /// 认证状态变化：`Some(uid)` 登录，`None` 退出
    pub async fn set_user(&self, user_id: Option<String>) -> Result<()> {
        self.check_running()?;
        let _guard = self.auth_lock.lock().await;

        let previous = self.current_user.read().clone();
        if previous == user_id {
            debug!("认证状态未变化");
            return Ok(());
        }
        if let Some(previous) = previous {
            self.sign_out(&previous).await?;
        }

        match &user_id {
            Some(uid) => {
                info!("🔑 用户登录: {}", uid);
                self.watcher.reset();
                self.load_namespace(Namespace::User(uid.clone()));
                self.watcher.set_active(true);
                *self.current_user.write() = Some(uid.clone());
                self.events.emit(SyncEvent::AuthChanged {
                    user_id: user_id.clone(),
                });

                self.hydrator.hydrate(uid).await?;
                self.offer_migration().await?;
            }
            None => {
                self.load_namespace(Namespace::Anonymous);
                self.events.emit(SyncEvent::AuthChanged { user_id: None });
            }
        }
        Ok(())
    }

    async fn offer_migration(&self) -> Result<()> {
        let Some(legacy) = self.migrator.detect() else {
            return Ok(());
        };
        match self.config.migration_mode {
            MigrationMode::Auto => match self.migrator.migrate().await {
                Ok(_) => {}
                Err(PracticeSyncError::PartialMigration(failed)) => {
                    warn!("⚠️ 自动迁移有 {} 条失败，下次登录重试", failed);
                }
                Err(e) => return Err(e),
            },
            MigrationMode::Offer => {
                info!("📦 检测到 {} 条旧数据，等待确认迁移", legacy.entry_count());
                self.events.emit(SyncEvent::LegacyDataDetected {
                    entries: legacy.entry_count(),
                });
            }
        }
        self.scheduler.ledger().merge_from_cache();
        Ok(())
    }

    async fn sign_out(&self, user_id: &str) -> Result<()> {
        info!("🚪 用户退出: {} (策略 {:?})", user_id, self.config.sign_out_policy);
        self.watcher.flush().await;
        self.watcher.set_active(false);
        self.watcher.reset();
        self.hydrator.reset();
        self.collections.set_remote_enabled(false);
        self.collections.reset();
        self.sessions.reset();
        *self.current_user.write() = None;

        if self.config.sign_out_policy == SignOutPolicy::ClearLocal {
            let ns = Namespace::User(user_id.to_string());
            let kv = self.cache.shared().kv();
            for key in CLEARED_ON_SIGN_OUT {
                kv.remove(&ns, key)?;
            }
            debug!("🧹 已清除用户 {} 的同步缓存", user_id);
        }
        Ok(())
    }

    pub fn current_user(&self) -> Option<String> {
        self.current_user.read().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.current_user.read().is_some()
    }

    // ========== 评价 ==========

    pub fn ratings(&self) -> BTreeMap<ProblemId, Rating> {
        self.collections.ratings.snapshot()
    }

    pub fn rating(&self, problem_id: ProblemId) -> Option<Rating> {
        self.collections.ratings.get(&problem_id)
    }

    /// 设置或清除评价；保留已有备注
    pub fn set_rating(&self, problem_id: ProblemId, value: Option<RatingValue>) -> PendingWrite {
        let next = value.map(|value| {
            let notes = self.rating(problem_id).and_then(|r| r.notes);
            Rating {
                problem_id,
                value,
                notes,
            }
        });
        self.collections.ratings.set_value(problem_id, next)
    }

    pub fn is_solved(&self, problem_id: ProblemId) -> bool {
        is_solved(self.rating(problem_id).as_ref())
    }

    // ========== 收藏 ==========

    pub fn starred(&self) -> BTreeSet<ProblemId> {
        self.collections
            .starred
            .snapshot()
            .into_values()
            .filter(|flag| flag.starred)
            .map(|flag| flag.problem_id)
            .collect()
    }

    pub fn is_starred(&self, problem_id: ProblemId) -> bool {
        self.collections
            .starred
            .get(&problem_id)
            .map_or(false, |flag| flag.starred)
    }

    /// 取消收藏即删除条目，远端只保存已收藏的题目
    pub fn set_starred(&self, problem_id: ProblemId, starred: bool) -> PendingWrite {
        let value = starred.then_some(StarredFlag { problem_id, starred });
        self.collections.starred.set_value(problem_id, value)
    }

    // ========== 复习 ==========

    pub fn recall(&self, problem_id: ProblemId) -> Option<RecallAssignment> {
        self.collections.recalls.get(&problem_id)
    }

    /// 在 `now_ms` 时已到期的复习任务
    pub fn due_recalls(&self, now_ms: i64) -> Vec<RecallAssignment> {
        self.scheduler.due(now_ms)
    }

    pub fn due_recalls_now(&self) -> Vec<RecallAssignment> {
        self.due_recalls(self.clock.now_ms())
    }

    pub fn is_graduated(&self, problem_id: ProblemId) -> bool {
        self.scheduler.ledger().contains(problem_id)
    }

    // ========== 资料 ==========

    pub fn profile(&self) -> Option<Profile> {
        let user_id = self.current_user()?;
        self.collections.profiles.get(&user_id)
    }

    pub fn update_profile(&self, profile: Profile) -> Result<PendingWrite> {
        let user_id = self.current_user().ok_or(PracticeSyncError::NotAuthenticated)?;
        Ok(self.collections.profiles.set_value(user_id, Some(profile)))
    }

    // ========== 练习会话 ==========

    pub fn sessions(&self) -> &PracticeSessionManager {
        &self.sessions
    }

    // ========== 同步控制 ==========

    /// 立即对所有集合执行一轮完整对账
    pub async fn force_resync(&self) -> Result<()> {
        self.check_running()?;
        if !self.is_signed_in() {
            return Err(PracticeSyncError::NotAuthenticated);
        }
        self.watcher.force_resync().await;
        Ok(())
    }

    pub fn has_legacy_data(&self) -> bool {
        self.migrator.has_legacy_data()
    }

    /// 手动迁移旧数据（Offer 模式下由用户确认后调用）
    pub async fn migrate_legacy(&self) -> Result<MigrationReport> {
        self.check_running()?;
        if !self.is_signed_in() {
            return Err(PracticeSyncError::NotAuthenticated);
        }
        let report = self.migrator.migrate().await;
        self.scheduler.ledger().merge_from_cache();
        report
    }

    // ========== 事件 ==========

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn watcher(&self) -> &ChangeLogWatcher {
        &self.watcher
    }

    // ========== 生命周期 ==========

    /// 关闭 SDK：执行尚未到期的对账后停止后台任务
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭 PracticeSyncSDK...");
        self.watcher.flush().await;
        self.watcher.shutdown();
        self.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("⚠️ 后台任务退出异常: {}", e);
            }
        }
        self.cache.shared().kv().flush().await?;
        info!("PracticeSyncSDK 关闭完成");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
