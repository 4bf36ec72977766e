//! 同步实体 - 每个集合的缓存键、解析规则与推送规则

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::storage::cache::keys;
use crate::storage::entities::{
    PracticeSession, ProblemId, Profile, Rating, RatingValue, RecallAssignment, StarredFlag,
};

/// 一个可同步的实体集合
pub trait SyncEntity:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// 集合内的自然键
    type Key: Ord + Eq + Hash + Clone + fmt::Debug + fmt::Display + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// 日志与事件中使用的集合名
    const NAME: &'static str;

    /// 本地缓存中的键
    const CACHE_KEY: &'static str;

    /// 从缓存中的单个条目解析实体（容忍旧格式）
    fn from_cache_value(key: &Self::Key, value: Value) -> Option<Self>;

    /// 对账时本地条目是否需要推送
    fn should_push(local: &Self, remote: Option<&Self>) -> bool {
        remote != Some(local)
    }

    /// 对账时远端条目是否需要删除
    fn should_delete_remote(local: Option<&Self>) -> bool {
        local.is_none()
    }

    /// 水合合并：远端覆盖本地
    fn merge_remote(_local: Option<&Self>, remote: Self) -> Self {
        remote
    }
}

fn with_field(mut value: Value, field: &str, injected: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.entry(field.to_string()).or_insert(injected);
    }
    value
}

impl SyncEntity for Rating {
    type Key = ProblemId;
    const NAME: &'static str = "ratings";
    const CACHE_KEY: &'static str = keys::RATINGS;

    fn from_cache_value(key: &ProblemId, value: Value) -> Option<Self> {
        // 旧格式：{ "42": "challenging" }
        if value.is_string() {
            return serde_json::from_value::<RatingValue>(value).ok().map(|v| Rating::new(*key, v));
        }
        let mut rating: Rating = serde_json::from_value(with_field(value, "problemId", (*key).into())).ok()?;
        rating.problem_id = *key;
        Some(rating)
    }
}

impl SyncEntity for StarredFlag {
    type Key = ProblemId;
    const NAME: &'static str = "starred";
    const CACHE_KEY: &'static str = keys::STARRED;

    fn from_cache_value(key: &ProblemId, value: Value) -> Option<Self> {
        if let Value::Bool(starred) = value {
            return Some(StarredFlag { problem_id: *key, starred });
        }
        let mut flag: StarredFlag = serde_json::from_value(with_field(value, "problemId", (*key).into())).ok()?;
        flag.problem_id = *key;
        Some(flag)
    }

    /// 远端只保存 starred = true
    fn should_push(local: &Self, remote: Option<&Self>) -> bool {
        local.starred && remote.is_none()
    }

    fn should_delete_remote(local: Option<&Self>) -> bool {
        !local.map_or(false, |flag| flag.starred)
    }
}

impl SyncEntity for RecallAssignment {
    type Key = ProblemId;
    const NAME: &'static str = "recalls";
    const CACHE_KEY: &'static str = keys::RECALLS;

    fn from_cache_value(key: &ProblemId, value: Value) -> Option<Self> {
        let mut recall: RecallAssignment =
            serde_json::from_value(with_field(value, "problemId", (*key).into())).ok()?;
        recall.problem_id = *key;
        Some(recall)
    }
}

impl SyncEntity for PracticeSession {
    type Key = String;
    const NAME: &'static str = "sessions";
    const CACHE_KEY: &'static str = keys::SESSIONS;

    fn from_cache_value(key: &String, value: Value) -> Option<Self> {
        let mut session: PracticeSession =
            serde_json::from_value(with_field(value, "id", key.clone().into())).ok()?;
        session.id = key.clone();
        Some(session)
    }

    /// 墓碑只在远端仍是存活副本时推送一次，之后不再推送
    fn should_push(local: &Self, remote: Option<&Self>) -> bool {
        if local.deleted {
            return remote.map_or(false, |r| !r.deleted);
        }
        remote != Some(local)
    }

    /// 会话从不硬删除
    fn should_delete_remote(_local: Option<&Self>) -> bool {
        false
    }

    /// 本地墓碑不会被远端存活副本复活
    fn merge_remote(local: Option<&Self>, remote: Self) -> Self {
        match local {
            Some(local) if local.deleted && !remote.deleted => local.clone(),
            _ => remote,
        }
    }
}

impl SyncEntity for Profile {
    /// 用户 ID
    type Key = String;
    const NAME: &'static str = "profile";
    const CACHE_KEY: &'static str = keys::PROFILE;

    fn from_cache_value(_key: &String, value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}

/// 解析缓存中的整个集合
///
/// null 条目视为缺失；单个条目损坏只丢弃该条目。整体不是对象时返回 None。
pub fn decode_collection<E: SyncEntity>(bytes: &[u8]) -> Option<BTreeMap<E::Key, E>> {
    let raw: BTreeMap<E::Key, Value> = match serde_json::from_slice(bytes) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("⚠️ 集合 {} 缓存无法解析: {}", E::NAME, e);
            return None;
        }
    };
    let mut entries = BTreeMap::new();
    for (key, value) in raw {
        if value.is_null() {
            continue;
        }
        match E::from_cache_value(&key, value) {
            Some(entity) => {
                entries.insert(key, entity);
            }
            None => warn!("⚠️ 丢弃无法解析的 {} 条目: {}", E::NAME, key),
        }
    }
    Some(entries)
}

/// 一次对账需要执行的远端写入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan<K> {
    pub upserts: Vec<K>,
    pub deletes: Vec<K>,
}

impl<K> ReconcilePlan<K> {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// 计算本地优先的对账计划：本地有而远端没有（或不同）的推送，远端有而本地没有的删除
pub fn plan_reconcile<E: SyncEntity>(
    local: &BTreeMap<E::Key, E>,
    remote: &BTreeMap<E::Key, E>,
) -> ReconcilePlan<E::Key> {
    let upserts = local
        .iter()
        .filter(|(key, entity)| E::should_push(entity, remote.get(*key)))
        .map(|(key, _)| key.clone())
        .collect();
    let deletes = remote
        .keys()
        .filter(|key| E::should_delete_remote(local.get(*key)))
        .cloned()
        .collect();
    ReconcilePlan { upserts, deletes }
}

/// 水合合并：`{...local, ...remote}`，本地独有的条目保留
pub fn merge_hydrated<E: SyncEntity>(
    local: &BTreeMap<E::Key, E>,
    remote: BTreeMap<E::Key, E>,
) -> BTreeMap<E::Key, E> {
    let mut merged = local.clone();
    for (key, entity) in remote {
        let value = E::merge_remote(local.get(&key), entity);
        merged.insert(key, value);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::RecallType;

    fn ratings(pairs: &[(u64, RatingValue)]) -> BTreeMap<u64, Rating> {
        pairs.iter().map(|(id, v)| (*id, Rating::new(*id, *v))).collect()
    }

    #[test]
    fn decode_tolerates_null_and_legacy_shapes() {
        let bytes = br#"{"42":null,"7":"yum","9":{"value":"challenging","notes":"dp"},"11":"???"}"#;
        let decoded = decode_collection::<Rating>(bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[&7].value, RatingValue::Yum);
        assert_eq!(decoded[&9].problem_id, 9);
        assert_eq!(decoded[&9].notes.as_deref(), Some("dp"));

        assert!(decode_collection::<Rating>(b"[1,2").is_none());
    }

    #[test]
    fn decode_starred_accepts_booleans() {
        let decoded = decode_collection::<StarredFlag>(br#"{"3":true,"4":false}"#).unwrap();
        assert!(decoded[&3].starred);
        assert!(!decoded[&4].starred);
    }

    #[test]
    fn plan_is_local_wins() {
        let local = ratings(&[(1, RatingValue::Yum), (2, RatingValue::Challenging)]);
        let remote = ratings(&[(2, RatingValue::Exhausting), (3, RatingValue::Desirable)]);
        let plan = plan_reconcile::<Rating>(&local, &remote);
        assert_eq!(plan.upserts, vec![1, 2]);
        assert_eq!(plan.deletes, vec![3]);

        assert!(plan_reconcile::<Rating>(&local, &local).is_empty());
    }

    #[test]
    fn starred_false_means_absent_remotely() {
        let mut local = BTreeMap::new();
        local.insert(1, StarredFlag { problem_id: 1, starred: false });
        local.insert(2, StarredFlag { problem_id: 2, starred: true });
        let mut remote = BTreeMap::new();
        remote.insert(1, StarredFlag { problem_id: 1, starred: true });
        remote.insert(2, StarredFlag { problem_id: 2, starred: true });

        let plan = plan_reconcile::<StarredFlag>(&local, &remote);
        assert!(plan.upserts.is_empty());
        assert_eq!(plan.deletes, vec![1]);
    }

    #[test]
    fn sessions_are_never_hard_deleted() {
        let mut tombstone = PracticeSession::new("s1", "Chat 1", 0);
        tombstone.deleted = true;
        let live = PracticeSession::new("s1", "Chat 1", 0);
        let orphan = PracticeSession::new("s2", "Chat 2", 0);

        let local: BTreeMap<_, _> = [("s1".to_string(), tombstone.clone())].into();
        let remote: BTreeMap<_, _> =
            [("s1".to_string(), live.clone()), ("s2".to_string(), orphan)].into();
        let plan = plan_reconcile::<PracticeSession>(&local, &remote);
        assert_eq!(plan.upserts, vec!["s1".to_string()]);
        assert!(plan.deletes.is_empty());

        // 远端已是墓碑：不再推送
        let remote: BTreeMap<_, _> = [("s1".to_string(), tombstone.clone())].into();
        let mut edited = tombstone.clone();
        edited.title = "renamed".into();
        let local: BTreeMap<_, _> = [("s1".to_string(), edited)].into();
        assert!(plan_reconcile::<PracticeSession>(&local, &remote).is_empty());

        // 水合不复活本地墓碑
        let local: BTreeMap<_, _> = [("s1".to_string(), tombstone)].into();
        let merged = merge_hydrated::<PracticeSession>(&local, [("s1".to_string(), live)].into());
        assert!(merged["s1"].deleted);
    }

    #[test]
    fn hydration_merge_keeps_local_only_entries() {
        let local = ratings(&[(1, RatingValue::Yum), (2, RatingValue::Challenging)]);
        let remote = ratings(&[(2, RatingValue::Desirable), (3, RatingValue::Exhausting)]);
        let merged = merge_hydrated::<Rating>(&local, remote);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[&1].value, RatingValue::Yum);
        assert_eq!(merged[&2].value, RatingValue::Desirable);

        let recalls: BTreeMap<u64, RecallAssignment> =
            [(5, RecallAssignment::new(5, RecallType::Challenging, 10))].into();
        let merged = merge_hydrated::<RecallAssignment>(&recalls, BTreeMap::new());
        assert_eq!(merged, recalls);
    }
}
