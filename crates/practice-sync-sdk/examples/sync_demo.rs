//! 同步演示
//!
//! 两个「标签页」共享同一个本地缓存，远端使用内存实现：
//! 未登录时的记录在登录后自动迁移，一个标签页的写入会出现在另一个标签页。

use std::time::Duration;

use practice_sync_sdk::{
    ChatMessage, MemoryBackend, PracticeSyncSDK, RatingValue, SharedCache, SyncConfig, SyncEvent,
};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🚀 本地优先同步演示\n");
    println!("====================================\n");

    let data_dir = std::env::temp_dir().join("practice_sync_demo");
    let config = SyncConfig::builder().data_dir(&data_dir).debounce_ms(300).build();
    let shared = SharedCache::open(&config.data_dir, config.cache_bus_capacity).await?;
    let backend = MemoryBackend::new();

    let tab_a = PracticeSyncSDK::initialize(config.clone(), shared.clone(), backend.store()).await?;
    let tab_b = PracticeSyncSDK::initialize(config, shared, backend.store()).await?;

    // 打印 B 标签页收到的事件
    let mut events = tab_b.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SyncEvent::DataChanged { cache_key, remote_tab, .. } = &event {
                println!("📣 [tab B] {} 变更 (来自其他标签页: {})", cache_key, remote_tab);
            }
        }
    });

    println!("📝 未登录时评价题目 1001（仅写本地）");
    tab_a.set_rating(1001, Some(RatingValue::Challenging)).await;

    println!("🔑 两个标签页登录同一用户");
    tab_a.set_user(Some("demo-user".to_string())).await?;
    tab_b.set_user(Some("demo-user".to_string())).await?;
    println!("   远端评价: {:?}", backend.ratings.snapshot().keys().collect::<Vec<_>>());

    println!("📝 [tab A] 题目 2002 评为 incomprehensible");
    let confirmed = tab_a.set_rating(2002, Some(RatingValue::Incomprehensible)).await;
    println!("   远端确认: {}", confirmed);
    sleep(Duration::from_millis(200)).await;
    if let Some(recall) = tab_b.recall(2002) {
        println!("   [tab B] 复习到期时间: {}", recall.due_at());
    }

    println!("🔌 远端离线，写入回滚");
    backend.set_offline(true);
    let confirmed = tab_a.set_rating(2002, Some(RatingValue::Yum)).await;
    println!("   远端确认: {}，当前评价: {:?}", confirmed, tab_a.rating(2002).map(|r| r.value));
    backend.set_offline(false);

    println!("🏃 新建练习会话");
    let sessions = tab_a.sessions();
    let (session_id, _) = sessions.create_session(None);
    sessions
        .append_message(&session_id, ChatMessage::user("dynamic programming warmup"))
        .await;
    sessions.set_suggestions(&session_id, vec![2002, 3003], None).await;
    sessions.tick(&session_id, 42_000).await;
    sessions.toggle_solved(&session_id, 2002, true).await;
    sessions.toggle_solved(&session_id, 3003, true).await;
    if let Some(session) = sessions.get(&session_id) {
        println!(
            "   {}: {:?}, best_time={:?}",
            session.title, session.status, session.best_time
        );
    }

    sleep(Duration::from_millis(500)).await;
    tab_a.shutdown().await?;
    tab_b.shutdown().await?;
    println!("\n✅ 演示结束");
    Ok(())
}
