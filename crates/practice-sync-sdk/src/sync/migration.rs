//! 旧数据迁移 - 把登录前留在匿名命名空间的数据推送到远端
//!
//! 每个缓存最多成功执行一次：全部推送成功才清除旧键并写入完成标记，部分失败时保留旧键，
//! 下次重新推送（远端 upsert 幂等）。迁移的条目以 Migration 来源合并进用户缓存，
//! 推送失败的条目因此还会被监听器再尝试一次。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{PracticeSyncError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::remote::{RemoteCollection, RemoteStore};
use crate::storage::cache::{keys, LocalCache, WriteSource};
use crate::storage::entities::{PracticeSession, ProblemId, Rating, RecallAssignment, StarredFlag};
use crate::storage::kv::Namespace;
use crate::sync::entity::{decode_collection, SyncEntity};
use crate::sync::optimistic::OptimisticCollection;
use crate::sync::CollectionSet;

/// 匿名命名空间中的旧数据
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacySnapshot {
    pub ratings: BTreeMap<ProblemId, Rating>,
    pub starred: BTreeMap<ProblemId, StarredFlag>,
    pub recalls: BTreeMap<ProblemId, RecallAssignment>,
    pub sessions: BTreeMap<String, PracticeSession>,
    pub graduated: BTreeSet<ProblemId>,
}

impl LegacySnapshot {
    pub fn entry_count(&self) -> usize {
        self.ratings.len() + self.starred.len() + self.recalls.len() + self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub entries: usize,
    pub pushed: usize,
    pub failed: usize,
}

pub struct LegacyMigrator {
    cache: LocalCache,
    remote: RemoteStore,
    collections: CollectionSet,
    events: Arc<EventManager>,
}

impl LegacyMigrator {
    pub fn new(cache: LocalCache, remote: RemoteStore, collections: CollectionSet, events: Arc<EventManager>) -> Self {
        Self {
            cache,
            remote,
            collections,
            events,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.cache.read_in::<bool>(&Namespace::Anonymous, keys::LEGACY_MIGRATION_DONE)
    }

    pub fn has_legacy_data(&self) -> bool {
        self.detect().is_some()
    }

    /// 读取旧数据；已完成迁移或没有条目时返回 None
    pub fn detect(&self) -> Option<LegacySnapshot> {
        if self.is_completed() {
            return None;
        }
        let mut sessions = self.read_legacy::<PracticeSession>();
        for session in sessions.values_mut() {
            if session.backfill_completion() {
                debug!("旧会话 {} 补记完成状态", session.id);
            }
        }
        let snapshot = LegacySnapshot {
            ratings: self.read_legacy::<Rating>(),
            starred: self.read_legacy::<StarredFlag>(),
            recalls: self.read_legacy::<RecallAssignment>(),
            sessions,
            graduated: self.cache.read_in(&Namespace::Anonymous, keys::GRADUATED),
        };
        if snapshot.is_empty() {
            None
        } else {
            Some(snapshot)
        }
    }

    /// 损坏的旧数据按空集合处理
    fn read_legacy<E: SyncEntity>(&self) -> BTreeMap<E::Key, E> {
        match self.cache.shared().kv().get_raw(&Namespace::Anonymous, E::CACHE_KEY) {
            Ok(Some(bytes)) => decode_collection::<E>(&bytes).unwrap_or_default(),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!("⚠️ 旧数据 {} 读取失败，按空处理: {}", E::NAME, e);
                BTreeMap::new()
            }
        }
    }

    /// 执行迁移；部分失败时返回 `PartialMigration`
    pub async fn migrate(&self) -> Result<MigrationReport> {
        if self.cache.namespace() == Namespace::Anonymous {
            return Err(PracticeSyncError::NotAuthenticated);
        }
        let Some(legacy) = self.detect() else {
            debug!("没有需要迁移的旧数据");
            return Ok(MigrationReport::default());
        };

        let entries = legacy.entry_count();
        info!("📦 开始迁移旧数据: {} 条", entries);

        let mut report = MigrationReport {
            entries,
            ..Default::default()
        };
        push_all(&*self.remote.ratings, &legacy.ratings, &mut report).await;
        push_all(&*self.remote.starred, &legacy.starred, &mut report).await;
        push_all(&*self.remote.recalls, &legacy.recalls, &mut report).await;
        push_all(&*self.remote.sessions, &legacy.sessions, &mut report).await;

        self.merge_into(&self.collections.ratings, &legacy.ratings);
        self.merge_into(&self.collections.starred, &legacy.starred);
        self.merge_into(&self.collections.recalls, &legacy.recalls);
        self.merge_into(&self.collections.sessions, &legacy.sessions);
        self.merge_graduated(&legacy.graduated);

        self.events.emit(SyncEvent::MigrationCompleted {
            pushed: report.pushed,
            failed: report.failed,
        });

        if report.failed > 0 {
            warn!("⚠️ 旧数据迁移部分失败: {}/{}，保留旧数据待重试", report.failed, entries);
            return Err(PracticeSyncError::PartialMigration(report.failed));
        }

        self.finish()?;
        info!("✅ 旧数据迁移完成: 推送 {} 条", report.pushed);
        Ok(report)
    }

    fn merge_into<E: SyncEntity>(&self, collection: &OptimisticCollection<E>, legacy: &BTreeMap<E::Key, E>) {
        if legacy.is_empty() {
            return;
        }
        let mut merged = collection.confirmed_snapshot();
        merged.extend(legacy.iter().map(|(key, entity)| (key.clone(), entity.clone())));
        collection.replace_confirmed(merged);
        if let Err(e) = collection.persist(WriteSource::Migration) {
            warn!("⚠️ {} 迁移结果写入缓存失败: {}", E::NAME, e);
        }
    }

    fn merge_graduated(&self, legacy: &BTreeSet<ProblemId>) {
        if legacy.is_empty() {
            return;
        }
        let mut graduated: BTreeSet<ProblemId> = self.cache.read(keys::GRADUATED);
        graduated.extend(legacy.iter().copied());
        if let Err(e) = self.cache.write(keys::GRADUATED, &graduated, WriteSource::Migration) {
            warn!("⚠️ 毕业集合迁移失败: {}", e);
        }
    }

    /// 清除旧键并写入完成标记
    fn finish(&self) -> Result<()> {
        let anonymous = Namespace::Anonymous;
        for key in [keys::RATINGS, keys::STARRED, keys::RECALLS, keys::SESSIONS] {
            self.cache.remove_in(&anonymous, key, WriteSource::Migration)?;
        }
        self.cache
            .write_in(&anonymous, keys::LEGACY_MIGRATION_DONE, &true, WriteSource::Migration)
    }
}

/// 逐条推送；starred = false 与会话墓碑不推送
async fn push_all<E: SyncEntity>(
    remote: &dyn RemoteCollection<E>,
    entries: &BTreeMap<E::Key, E>,
    report: &mut MigrationReport,
) {
    for (key, entity) in entries {
        if !E::should_push(entity, None) {
            continue;
        }
        match remote.upsert(key, entity).await {
            Ok(()) => report.pushed += 1,
            Err(e) => {
                warn!("⚠️ 迁移 {} {} 失败: {}", E::NAME, key, e);
                report.failed += 1;
            }
        }
    }
}
