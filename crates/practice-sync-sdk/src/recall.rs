//! 复习调度 - 由评价变化驱动的间隔复习
//!
//! 状态：未评价 / 非复习评价 / challenging 复习 / incomprehensible 复习。
//! 转移只依赖「上一个已确认评价」与「新评价」，由乐观路径在评价写入确认后调用。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::events::{EventManager, SyncEvent};
use crate::storage::cache::{keys, LocalCache, WriteSource};
use crate::storage::entities::{ProblemId, Rating, RatingValue, RecallAssignment, RecallType};
use crate::sync::optimistic::{ConfirmHook, OptimisticCollection};
use crate::utils::Clock;

/// 一次评价变化对复习任务的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallAction {
    /// 无副作用
    Keep,
    /// 创建或覆盖复习任务（assigned_at = now）
    Assign(RecallType),
    /// 删除复习任务；`graduate` 为 true 时记入毕业集合
    Clear { graduate: bool },
}

/// 评价状态转移
pub fn transition(previous: Option<RatingValue>, next: Option<RatingValue>) -> RecallAction {
    let was_recall = previous.and_then(RatingValue::recall_type);
    let now_recall = next.and_then(RatingValue::recall_type);
    match (was_recall, now_recall) {
        (Some(before), Some(after)) if before == after => RecallAction::Keep,
        (_, Some(after)) => RecallAction::Assign(after),
        (Some(_), None) => RecallAction::Clear {
            graduate: next.map_or(false, RatingValue::is_graduating),
        },
        (None, None) => RecallAction::Keep,
    }
}

/// 毕业集合：只增不减，仅保存在本地
#[derive(Clone)]
pub struct GraduationLedger {
    cache: LocalCache,
    ids: Arc<RwLock<BTreeSet<ProblemId>>>,
}

impl GraduationLedger {
    pub fn new(cache: LocalCache) -> Self {
        Self {
            cache,
            ids: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    /// 切换命名空间后载入该用户的集合
    pub fn load(&self) {
        let stored: BTreeSet<ProblemId> = self.cache.read(keys::GRADUATED);
        *self.ids.write() = stored;
    }

    /// 合并缓存中的集合（其他标签页的写入），不会移除已有 ID
    pub fn merge_from_cache(&self) {
        let stored: BTreeSet<ProblemId> = self.cache.read(keys::GRADUATED);
        self.ids.write().extend(stored);
    }

    /// 记录毕业；返回是否为新加入
    pub fn add(&self, problem_id: ProblemId) -> bool {
        let mut ids = self.ids.write();
        let stored: BTreeSet<ProblemId> = self.cache.read(keys::GRADUATED);
        ids.extend(stored);
        let inserted = ids.insert(problem_id);
        if inserted {
            if let Err(e) = self.cache.write(keys::GRADUATED, &*ids, WriteSource::Optimistic) {
                warn!("⚠️ 毕业集合写入缓存失败: {}", e);
            }
        }
        inserted
    }

    pub fn contains(&self, problem_id: ProblemId) -> bool {
        self.ids.read().contains(&problem_id)
    }

    pub fn snapshot(&self) -> BTreeSet<ProblemId> {
        self.ids.read().clone()
    }
}

/// 复习调度器：挂在评价集合的确认钩子上
pub struct RecallScheduler {
    recalls: OptimisticCollection<RecallAssignment>,
    ledger: GraduationLedger,
    clock: Arc<dyn Clock>,
    events: Arc<EventManager>,
}

impl RecallScheduler {
    pub fn new(
        recalls: OptimisticCollection<RecallAssignment>,
        ledger: GraduationLedger,
        clock: Arc<dyn Clock>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            recalls,
            ledger,
            clock,
            events,
        }
    }

    pub fn ledger(&self) -> &GraduationLedger {
        &self.ledger
    }

    /// 应用一次评价变化
    pub async fn apply(&self, problem_id: ProblemId, previous: Option<RatingValue>, next: Option<RatingValue>) {
        match transition(previous, next) {
            RecallAction::Keep => {
                debug!("题目 {} 评价变化无复习副作用", problem_id);
            }
            RecallAction::Assign(recall_type) => {
                let assignment = RecallAssignment::new(problem_id, recall_type, self.clock.now_ms());
                let due_at = assignment.due_at();
                // 写入在后台完成，不等待远端确认
                drop(self.recalls.set_value(problem_id, Some(assignment)));
                info!("📅 题目 {} 安排 {:?} 复习", problem_id, recall_type);
                self.events.emit(SyncEvent::RecallScheduled {
                    problem_id,
                    recall_type,
                    due_at,
                });
            }
            RecallAction::Clear { graduate } => {
                drop(self.recalls.set_value(problem_id, None));
                if graduate && self.ledger.add(problem_id) {
                    info!("🎓 题目 {} 毕业", problem_id);
                }
                self.events.emit(SyncEvent::RecallCleared {
                    problem_id,
                    graduated: graduate,
                });
            }
        }
    }

    /// 已到期的复习任务，按到期时间排序
    pub fn due(&self, now_ms: i64) -> Vec<RecallAssignment> {
        let mut due: Vec<_> = self
            .recalls
            .snapshot()
            .into_values()
            .filter(|assignment| assignment.is_due(now_ms))
            .collect();
        due.sort_by_key(|assignment| (assignment.due_at(), assignment.problem_id));
        due
    }

    /// 当前时间下已到期的复习任务
    pub fn due_now(&self) -> Vec<RecallAssignment> {
        self.due(self.clock.now_ms())
    }
}

#[async_trait]
impl ConfirmHook<Rating> for RecallScheduler {
    async fn on_confirmed(&self, key: &ProblemId, previous: Option<&Rating>, current: Option<&Rating>) {
        self.apply(*key, previous.map(|r| r.value), current.map(|r| r.value))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::storage::entities::DAY_MS;
    use crate::storage::SharedCache;
    use crate::utils::ManualClock;
    use std::time::Duration;
    use tempfile::TempDir;
    use RatingValue::*;

    #[test]
    fn transition_table() {
        assert_eq!(transition(None, Some(Challenging)), RecallAction::Assign(RecallType::Challenging));
        assert_eq!(
            transition(Some(Challenging), Some(Incomprehensible)),
            RecallAction::Assign(RecallType::Incomprehensible)
        );
        assert_eq!(transition(Some(Challenging), Some(Challenging)), RecallAction::Keep);
        assert_eq!(transition(Some(Incomprehensible), Some(Yum)), RecallAction::Clear { graduate: true });
        assert_eq!(transition(Some(Challenging), Some(Desirable)), RecallAction::Clear { graduate: true });
        assert_eq!(transition(Some(Challenging), Some(Exhausting)), RecallAction::Clear { graduate: false });
        assert_eq!(transition(Some(Challenging), None), RecallAction::Clear { graduate: false });
        assert_eq!(transition(Some(Yum), None), RecallAction::Keep);
        assert_eq!(transition(Some(Exhausting), Some(Yum)), RecallAction::Keep);
        assert_eq!(transition(Some(Yum), Some(Challenging)), RecallAction::Assign(RecallType::Challenging));
    }

    async fn scheduler() -> (TempDir, RecallScheduler, Arc<ManualClock>, Arc<MemoryRemote<RecallAssignment>>) {
        let temp_dir = TempDir::new().unwrap();
        let shared = SharedCache::open(temp_dir.path(), 64).await.unwrap();
        let cache = shared.open_tab();
        let events = Arc::new(EventManager::new(64));
        let remote = Arc::new(MemoryRemote::<RecallAssignment>::new());
        let recalls = OptimisticCollection::new(cache.clone(), remote.clone(), events.clone());
        recalls.set_remote_enabled(true);
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = RecallScheduler::new(recalls, GraduationLedger::new(cache), clock.clone(), events);
        (temp_dir, scheduler, clock, remote)
    }

    #[tokio::test]
    async fn incomprehensible_then_yum_graduates() {
        let (_dir, scheduler, clock, remote) = scheduler().await;

        scheduler.apply(101, None, Some(Incomprehensible)).await;
        let assignment = scheduler.recalls.get(&101).unwrap();
        assert_eq!(assignment.recall_type, RecallType::Incomprehensible);
        assert_eq!(assignment.assigned_at, 0);
        assert_eq!(assignment.due_at() - assignment.assigned_at, 5 * DAY_MS);

        clock.advance(2 * DAY_MS);
        assert!(scheduler.due_now().is_empty());

        scheduler.apply(101, Some(Incomprehensible), Some(Yum)).await;
        assert!(scheduler.recalls.get(&101).is_none());
        assert!(scheduler.ledger().contains(101));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(remote.get(&101).is_none());
    }

    #[tokio::test]
    async fn switching_recall_type_restarts_due_date() {
        let (_dir, scheduler, clock, _remote) = scheduler().await;
        scheduler.apply(7, None, Some(Challenging)).await;
        clock.advance(DAY_MS);
        scheduler.apply(7, Some(Challenging), Some(Incomprehensible)).await;

        let assignment = scheduler.recalls.get(&7).unwrap();
        assert_eq!(assignment.assigned_at, DAY_MS);
        assert_eq!(assignment.due_at(), 6 * DAY_MS);

        clock.set(6 * DAY_MS);
        assert_eq!(scheduler.due_now().len(), 1);
    }

    #[tokio::test]
    async fn graduation_set_only_grows() {
        let (_dir, scheduler, _clock, _remote) = scheduler().await;
        scheduler.apply(1, Some(Challenging), Some(Desirable)).await;
        scheduler.apply(1, Some(Desirable), Some(Challenging)).await;
        scheduler.apply(1, Some(Challenging), Some(Exhausting)).await;
        scheduler.apply(1, Some(Exhausting), None).await;
        assert!(scheduler.ledger().contains(1));

        assert!(!scheduler.ledger().add(1));
        scheduler.ledger().load();
        assert_eq!(scheduler.ledger().snapshot(), BTreeSet::from([1]));
    }
}
