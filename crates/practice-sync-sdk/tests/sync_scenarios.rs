//! 端到端同步场景：多个 SDK 实例共享缓存，远端使用内存实现

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use practice_sync_sdk::storage::keys;
use practice_sync_sdk::{
    MemoryBackend, MigrationMode, Namespace, PracticeSession, PracticeSyncError, PracticeSyncSDK, RatingValue,
    SharedCache, SyncConfig, SyncEvent, SyncKey, WriteSource,
};
use practice_sync_sdk::{Clock, ManualClock, RecallType};
use serde_json::{json, Value};
use tempfile::TempDir;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

struct Harness {
    _dir: TempDir,
    shared: Arc<SharedCache>,
    backend: MemoryBackend,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let shared = SharedCache::open(dir.path(), 256).await.unwrap();
        Self {
            _dir: dir,
            shared,
            backend: MemoryBackend::new(),
            clock: Arc::new(ManualClock::new(1_700_000_000_000)),
        }
    }

    async fn tab(&self, debounce_ms: u64, mode: MigrationMode) -> Arc<PracticeSyncSDK> {
        let config = SyncConfig::builder()
            .data_dir(self._dir.path())
            .debounce_ms(debounce_ms)
            .migration_mode(mode)
            .build();
        PracticeSyncSDK::initialize_with_clock(config, self.shared.clone(), self.backend.store(), self.clock.clone())
            .await
            .unwrap()
    }

    async fn signed_in_tab(&self, debounce_ms: u64) -> Arc<PracticeSyncSDK> {
        let sdk = self.tab(debounce_ms, MigrationMode::Auto).await;
        sdk.set_user(Some("u1".to_string())).await.unwrap();
        sdk
    }
}

fn drain(receiver: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn failed_write_rolls_back_memory_and_cache() {
    let h = Harness::new().await;
    let sdk = h.signed_in_tab(30).await;
    assert!(sdk.set_rating(42, Some(RatingValue::Yum)).await);

    let mut events = sdk.subscribe();
    h.backend.ratings.fail_next(1);
    let write = sdk.set_rating(42, Some(RatingValue::Exhausting));
    // 远端返回之前已可见
    assert_eq!(sdk.rating(42).unwrap().value, RatingValue::Exhausting);
    assert!(!write.await);

    assert_eq!(sdk.rating(42).unwrap().value, RatingValue::Yum);
    let cached: BTreeMap<String, Value> = sdk.cache().read(keys::RATINGS);
    assert_eq!(cached["42"]["value"], json!("yum"));
    assert_eq!(h.backend.ratings.get(&42).unwrap().value, RatingValue::Yum);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::WriteRolledBack { .. })));
}

#[tokio::test]
async fn same_problem_writes_apply_in_issue_order() {
    let h = Harness::new().await;
    let sdk = h.signed_in_tab(30).await;

    h.backend.ratings.push_latency(Duration::from_millis(150));
    let first = sdk.set_rating(7, Some(RatingValue::Challenging));
    let second = sdk.set_rating(7, Some(RatingValue::Desirable));
    assert_eq!(sdk.rating(7).unwrap().value, RatingValue::Desirable);

    let (first, second) = tokio::join!(first, second);
    assert!(first && second);
    assert_eq!(h.backend.ratings.get(&7).unwrap().value, RatingValue::Desirable);

    // 确认链按顺序驱动复习：challenging 分配，desirable 毕业
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sdk.recall(7).is_none());
    assert!(sdk.is_graduated(7));
}

#[tokio::test]
async fn external_burst_is_coalesced_into_one_pass() {
    let h = Harness::new().await;
    let sdk = h.signed_in_tab(500).await;
    h.backend.ratings.seed(42, practice_sync_sdk::Rating::new(42, RatingValue::Challenging));
    let fetches_before = h.backend.ratings.get_all_count();

    sdk.cache()
        .write(keys::RATINGS, &json!({ "42": "challenging" }), WriteSource::External)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    sdk.cache()
        .write(keys::RATINGS, &json!({ "42": null }), WriteSource::External)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(900)).await;

    assert_eq!(h.backend.ratings.get_all_count() - fetches_before, 1);
    assert_eq!(sdk.watcher().pass_count(SyncKey::Ratings), 1);
    assert!(h.backend.ratings.get(&42).is_none());
    assert!(sdk.rating(42).is_none());
}

#[tokio::test]
async fn hydration_keeps_local_only_entries() {
    let h = Harness::new().await;
    let writer = h.shared.open_tab();
    writer.set_namespace(Namespace::User("u1".to_string()));
    writer
        .write(keys::RATINGS, &json!({ "1": "yum", "2": "challenging" }), WriteSource::Optimistic)
        .unwrap();
    h.backend.ratings.seed(2, practice_sync_sdk::Rating::new(2, RatingValue::Exhausting));
    h.backend.ratings.seed(3, practice_sync_sdk::Rating::new(3, RatingValue::Desirable));

    let sdk = h.signed_in_tab(30).await;
    let ratings = sdk.ratings();
    assert_eq!(ratings.len(), 3);
    assert_eq!(ratings[&1].value, RatingValue::Yum);
    assert_eq!(ratings[&2].value, RatingValue::Exhausting);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.backend.ratings.snapshot().len(), 3);
}

#[tokio::test]
async fn incomprehensible_then_yum_graduates_problem() {
    let h = Harness::new().await;
    let sdk = h.signed_in_tab(30).await;
    let start = h.clock.now_ms();

    assert!(sdk.set_rating(101, Some(RatingValue::Incomprehensible)).await);
    let recall = sdk.recall(101).unwrap();
    assert_eq!(recall.recall_type, RecallType::Incomprehensible);
    assert_eq!(recall.due_at(), start + 5 * DAY_MS);

    h.clock.advance(2 * DAY_MS);
    assert!(sdk.due_recalls_now().is_empty());
    assert!(sdk.set_rating(101, Some(RatingValue::Yum)).await);

    assert!(sdk.recall(101).is_none());
    assert!(sdk.is_graduated(101));
    assert!(sdk.is_solved(101));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.backend.recalls.get(&101).is_none());
}

#[tokio::test]
async fn offered_migration_runs_once() {
    let h = Harness::new().await;
    let sdk = h.tab(30, MigrationMode::Offer).await;
    assert!(sdk.set_rating(1, Some(RatingValue::Yum)).await);
    assert!(sdk.set_starred(2, true).await);
    assert!(h.backend.ratings.ops().is_empty());

    let mut events = sdk.subscribe();
    sdk.set_user(Some("u1".to_string())).await.unwrap();
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, SyncEvent::LegacyDataDetected { entries: 2, .. })));
    assert!(sdk.has_legacy_data());

    let report = sdk.migrate_legacy().await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(h.backend.ratings.get(&1).unwrap().value, RatingValue::Yum);
    assert!(sdk.is_starred(2));

    let writes = h.backend.ratings.write_count() + h.backend.starred.write_count();
    let again = sdk.migrate_legacy().await.unwrap();
    assert_eq!(again.pushed, 0);
    assert_eq!(h.backend.ratings.write_count() + h.backend.starred.write_count(), writes);
}

#[tokio::test]
async fn partial_migration_keeps_legacy_data() {
    let h = Harness::new().await;
    let sdk = h.tab(30, MigrationMode::Offer).await;
    sdk.set_rating(1, Some(RatingValue::Yum)).await;
    sdk.set_rating(2, Some(RatingValue::Desirable)).await;
    sdk.set_user(Some("u1".to_string())).await.unwrap();

    h.backend.ratings.fail_next(1);
    let result = sdk.migrate_legacy().await;
    assert!(matches!(result, Err(PracticeSyncError::PartialMigration(1))));
    assert!(sdk.has_legacy_data());
    assert!(sdk.cache().contains_in(&Namespace::Anonymous, keys::RATINGS));

    let report = sdk.migrate_legacy().await.unwrap();
    assert_eq!(report.failed, 0);
    assert!(!sdk.has_legacy_data());
    assert_eq!(h.backend.ratings.snapshot().len(), 2);
}

#[tokio::test]
async fn other_tab_writes_are_reloaded() {
    let h = Harness::new().await;
    let tab_a = h.signed_in_tab(30).await;
    let tab_b = h.signed_in_tab(30).await;
    let mut events_b = tab_b.subscribe();

    assert!(tab_a.set_rating(7, Some(RatingValue::Challenging)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(tab_b.rating(7).unwrap().value, RatingValue::Challenging);
    assert_eq!(tab_b.recall(7).unwrap().recall_type, RecallType::Challenging);
    assert!(drain(&mut events_b)
        .iter()
        .any(|e| matches!(e, SyncEvent::DataChanged { remote_tab: true, .. })));

    // 乐观写入已推送，监听器不会为此再访问远端
    assert_eq!(tab_b.watcher().pass_count(SyncKey::Ratings), 0);
}

#[tokio::test]
async fn local_session_tombstone_is_not_resurrected() {
    let h = Harness::new().await;
    let mut live = PracticeSession::new("s1", "Chat 1", 0);
    live.status = practice_sync_sdk::SessionStatus::Running;
    h.backend.sessions.seed("s1".to_string(), live.clone());

    let mut tombstone = live;
    tombstone.deleted = true;
    let writer = h.shared.open_tab();
    writer.set_namespace(Namespace::User("u1".to_string()));
    writer
        .write(keys::SESSIONS, &BTreeMap::from([("s1".to_string(), tombstone)]), WriteSource::Optimistic)
        .unwrap();

    let sdk = h.signed_in_tab(30).await;
    assert!(sdk.sessions().get("s1").unwrap().deleted);
    assert!(sdk.sessions().list_active().is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.backend.sessions.get(&"s1".to_string()).unwrap().deleted);
}

#[tokio::test]
async fn force_resync_requires_sign_in() {
    let h = Harness::new().await;
    let sdk = h.tab(30, MigrationMode::Auto).await;
    assert!(matches!(sdk.force_resync().await, Err(PracticeSyncError::NotAuthenticated)));

    sdk.set_user(Some("u1".to_string())).await.unwrap();
    sdk.cache()
        .write(keys::STARRED, &json!({ "3": true }), WriteSource::Optimistic)
        .unwrap();
    sdk.force_resync().await.unwrap();
    assert!(h.backend.starred.get(&3).unwrap().starred);
}

#[tokio::test]
async fn failed_hydration_then_resync_keeps_remote_rows() {
    let h = Harness::new().await;
    h.backend.ratings.seed(1, practice_sync_sdk::Rating::new(1, RatingValue::Yum));
    h.backend.ratings.seed(2, practice_sync_sdk::Rating::new(2, RatingValue::Challenging));

    h.backend.set_offline(true);
    let sdk = h.signed_in_tab(30).await;
    h.backend.set_offline(false);

    sdk.force_resync().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.backend.ratings.snapshot().len(), 2);
    assert_eq!(h.backend.ratings.write_count(), 0);
}

#[tokio::test]
async fn queued_write_does_not_reach_next_user() {
    let h = Harness::new().await;
    let sdk = h.signed_in_tab(30).await;

    h.backend.ratings.push_latency(Duration::from_millis(150));
    let first = sdk.set_rating(7, Some(RatingValue::Challenging));
    let second = sdk.set_rating(7, Some(RatingValue::Desirable));
    tokio::time::sleep(Duration::from_millis(20)).await;

    sdk.set_user(Some("u2".to_string())).await.unwrap();
    let (_, second) = tokio::join!(first, second);
    assert!(!second);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let upserts = h
        .backend
        .ratings
        .ops()
        .into_iter()
        .filter(|op| matches!(op, practice_sync_sdk::remote::RemoteOp::Upsert(7)))
        .count();
    assert_eq!(upserts, 1);
    assert_eq!(h.backend.ratings.get(&7).unwrap().value, RatingValue::Challenging);
    assert!(sdk.rating(7).is_none());
}
