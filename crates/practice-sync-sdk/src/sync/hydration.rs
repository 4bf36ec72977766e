//! 登录水合 - 每次登录会话执行一次的远端合并
//!
//! 流程：先从缓存载入（UI 立即可用），再并发拉取所有集合，按 `{...local, ...remote}` 合并，
//! 以 Hydration 来源写回缓存。合并结果与远端一致时直接更新监听器摘要；
//! 存在本地独有条目时改为安排一轮对账，由监听器推送。

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{EventManager, SyncEvent};
use crate::remote::{RemoteResult, RemoteStore};
use crate::storage::cache::WriteSource;
use crate::sync::entity::{merge_hydrated, plan_reconcile, SyncEntity};
use crate::sync::optimistic::OptimisticCollection;
use crate::sync::watcher::ChangeLogWatcher;
use crate::sync::{CollectionSet, SyncKey};

/// 一次水合的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrationReport {
    pub user_id: String,
    /// 拉取失败、保持仅本地的集合
    pub failed: Vec<String>,
    /// 合并后仍有本地独有条目、已安排对账的键
    pub scheduled: Vec<SyncKey>,
    /// 本次会话已水合过，未执行
    pub skipped: bool,
}

enum Outcome {
    Synced,
    NeedsPush,
    Failed,
}

pub struct Hydrator {
    collections: CollectionSet,
    remote: RemoteStore,
    watcher: ChangeLogWatcher,
    events: Arc<EventManager>,
    hydrated_for: Mutex<Option<String>>,
}

impl Hydrator {
    pub fn new(
        collections: CollectionSet,
        remote: RemoteStore,
        watcher: ChangeLogWatcher,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            collections,
            remote,
            watcher,
            events,
            hydrated_for: Mutex::new(None),
        }
    }

    /// 退出登录后允许下一次登录重新水合
    pub fn reset(&self) {
        *self.hydrated_for.lock() = None;
    }

    /// 为 `user_id` 执行水合（同一登录会话内只执行一次）
    pub async fn hydrate(&self, user_id: &str) -> Result<HydrationReport> {
        {
            let mut hydrated = self.hydrated_for.lock();
            if hydrated.as_deref() == Some(user_id) {
                debug!("用户 {} 已水合，跳过", user_id);
                return Ok(HydrationReport {
                    user_id: user_id.to_string(),
                    skipped: true,
                    ..Default::default()
                });
            }
            *hydrated = Some(user_id.to_string());
        }

        info!("💧 开始水合: {}", user_id);
        self.collections.load_from_cache();

        let (ratings, starred, recalls, sessions, profiles) = futures::join!(
            self.remote.ratings.get_all(),
            self.remote.starred.get_all(),
            self.remote.recalls.get_all(),
            self.remote.sessions.get_all(),
            self.remote.profiles.get_all(),
        );

        let mut report = HydrationReport {
            user_id: user_id.to_string(),
            ..Default::default()
        };
        let outcomes = [
            (SyncKey::Ratings.as_str(), Some(SyncKey::Ratings), self.merge(&self.collections.ratings, ratings)),
            (SyncKey::Starred.as_str(), Some(SyncKey::Starred), self.merge(&self.collections.starred, starred)),
            (SyncKey::Recalls.as_str(), Some(SyncKey::Recalls), self.merge(&self.collections.recalls, recalls)),
            (
                SyncKey::Sessions.as_str(),
                Some(SyncKey::Sessions),
                self.merge(&self.collections.sessions, sessions),
            ),
            ("profile", None, self.merge(&self.collections.profiles, profiles)),
        ];

        for (name, key, outcome) in outcomes {
            match (outcome, key) {
                (Outcome::Failed, _) => report.failed.push(name.to_string()),
                (Outcome::Synced, Some(key)) => self.mark_synced(key),
                (Outcome::NeedsPush, Some(key)) => {
                    self.watcher.schedule(key);
                    report.scheduled.push(key);
                }
                (Outcome::Synced, None) => {}
                (Outcome::NeedsPush, None) => self.push_profile(user_id),
            }
        }

        info!(
            "✅ 水合完成: {} (失败 {:?}, 待推送 {:?})",
            user_id, report.failed, report.scheduled
        );
        self.events.emit(SyncEvent::HydrationCompleted {
            user_id: user_id.to_string(),
            failed_collections: report.failed.clone(),
        });
        Ok(report)
    }

    fn merge<E: SyncEntity>(
        &self,
        collection: &OptimisticCollection<E>,
        fetched: RemoteResult<BTreeMap<E::Key, E>>,
    ) -> Outcome {
        let remote = match fetched {
            Ok(remote) => remote,
            Err(e) => {
                warn!("⚠️ 水合拉取 {} 失败，保持本地数据: {}", E::NAME, e);
                return Outcome::Failed;
            }
        };

        let local = collection.confirmed_snapshot();
        let merged = merge_hydrated::<E>(&local, remote.clone());
        let needs_push = !plan_reconcile::<E>(&merged, &remote).is_empty();
        debug!(
            "{} 合并: 本地 {} 条, 远端 {} 条, 合并后 {} 条",
            E::NAME,
            local.len(),
            remote.len(),
            merged.len()
        );

        collection.replace_confirmed(merged);
        if let Err(e) = collection.persist(WriteSource::Hydration) {
            warn!("⚠️ {} 水合结果写入缓存失败: {}", E::NAME, e);
            return Outcome::Failed;
        }
        if needs_push {
            Outcome::NeedsPush
        } else {
            Outcome::Synced
        }
    }

    fn mark_synced(&self, key: SyncKey) {
        match key {
            SyncKey::Ratings => self.watcher.mark_synced(key, &self.collections.ratings.snapshot()),
            SyncKey::Starred => self.watcher.mark_synced(key, &self.collections.starred.snapshot()),
            SyncKey::Recalls => self.watcher.mark_synced(key, &self.collections.recalls.snapshot()),
            SyncKey::Sessions => self.watcher.mark_synced(key, &self.collections.sessions.snapshot()),
        }
    }

    /// 资料不归监听器管理，本地独有时直接走乐观路径推送
    fn push_profile(&self, user_id: &str) {
        let key = user_id.to_string();
        if let Some(profile) = self.collections.profiles.get(&key) {
            drop(self.collections.profiles.set_value(key, Some(profile)));
        }
    }
}
