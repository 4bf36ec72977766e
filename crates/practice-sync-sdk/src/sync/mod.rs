/// 同步模块
///
/// 职责：
/// - 乐观更新路径（按实体 ID 串行的写入链）
/// - 变更监听器（防抖 + 摘要去重的批量对账）
/// - 登录水合与旧数据迁移

pub mod entity;
pub mod hydration;
pub mod migration;
pub mod optimistic;
pub mod sync_key;
pub mod watcher;

use std::sync::Arc;

pub use entity::{decode_collection, merge_hydrated, plan_reconcile, ReconcilePlan, SyncEntity};
pub use hydration::{HydrationReport, Hydrator};
pub use migration::{LegacyMigrator, LegacySnapshot, MigrationReport};
pub use optimistic::{ConfirmHook, OptimisticCollection, PendingKeys, PendingWrite};
pub use sync_key::SyncKey;
pub use watcher::{reconcile_collection, ChangeLogWatcher, ReconcileReport};

use crate::events::EventManager;
use crate::remote::RemoteStore;
use crate::storage::cache::LocalCache;
use crate::storage::entities::{PracticeSession, Profile, Rating, RecallAssignment, StarredFlag};

/// 一个标签页持有的全部乐观集合
#[derive(Clone)]
pub struct CollectionSet {
    pub ratings: OptimisticCollection<Rating>,
    pub starred: OptimisticCollection<StarredFlag>,
    pub recalls: OptimisticCollection<RecallAssignment>,
    pub sessions: OptimisticCollection<PracticeSession>,
    pub profiles: OptimisticCollection<Profile>,
}

impl CollectionSet {
    pub fn new(cache: &LocalCache, remote: &RemoteStore, events: &Arc<EventManager>) -> Self {
        Self {
            ratings: OptimisticCollection::new(cache.clone(), remote.ratings.clone(), events.clone()),
            starred: OptimisticCollection::new(cache.clone(), remote.starred.clone(), events.clone()),
            recalls: OptimisticCollection::new(cache.clone(), remote.recalls.clone(), events.clone()),
            sessions: OptimisticCollection::new(cache.clone(), remote.sessions.clone(), events.clone()),
            profiles: OptimisticCollection::new(cache.clone(), remote.profiles.clone(), events.clone()),
        }
    }

    pub fn set_remote_enabled(&self, enabled: bool) {
        self.ratings.set_remote_enabled(enabled);
        self.starred.set_remote_enabled(enabled);
        self.recalls.set_remote_enabled(enabled);
        self.sessions.set_remote_enabled(enabled);
        self.profiles.set_remote_enabled(enabled);
    }

    pub fn load_from_cache(&self) {
        self.ratings.load_from_cache();
        self.starred.load_from_cache();
        self.recalls.load_from_cache();
        self.sessions.load_from_cache();
        self.profiles.load_from_cache();
    }

    /// 按缓存键重新加载单个集合；返回该键是否属于同步集合
    pub fn reload_key(&self, cache_key: &str) -> bool {
        match cache_key {
            k if k == Rating::CACHE_KEY => self.ratings.load_from_cache(),
            k if k == StarredFlag::CACHE_KEY => self.starred.load_from_cache(),
            k if k == RecallAssignment::CACHE_KEY => self.recalls.load_from_cache(),
            k if k == PracticeSession::CACHE_KEY => self.sessions.load_from_cache(),
            k if k == Profile::CACHE_KEY => self.profiles.load_from_cache(),
            _ => return false,
        }
        true
    }

    pub fn reset(&self) {
        self.ratings.reset();
        self.starred.reset();
        self.recalls.reset();
        self.sessions.reset();
        self.profiles.reset();
    }

    /// 注册到监听器，对账时跳过有未决写入的条目
    pub fn register_with(&self, watcher: &ChangeLogWatcher) {
        watcher.register_pending(SyncKey::Ratings, Arc::new(self.ratings.clone()));
        watcher.register_pending(SyncKey::Starred, Arc::new(self.starred.clone()));
        watcher.register_pending(SyncKey::Recalls, Arc::new(self.recalls.clone()));
        watcher.register_pending(SyncKey::Sessions, Arc::new(self.sessions.clone()));
    }
}
