//! Practice Sync SDK - 本地优先的刷题记录同步引擎
//!
//! 本 SDK 提供：
//! - ⚡ 乐观更新：写入立即可见，远端失败时回滚（按实体 ID 串行）
//! - 🔄 变更监听：防抖 + 摘要去重的批量对账，本地优先
//! - 💧 登录水合与旧数据迁移
//! - 📅 间隔复习调度与毕业集合
//! - 🏃 练习会话（马拉松）管理
//! - 🗂️ 多标签页共享缓存与跨标签页重新加载
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use practice_sync_sdk::{MemoryBackend, PracticeSyncSDK, RatingValue, SharedCache, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder().data_dir("/tmp/practice-sync").build();
//!     let shared = SharedCache::open(&config.data_dir, config.cache_bus_capacity).await?;
//!     let backend = MemoryBackend::new();
//!
//!     let sdk = PracticeSyncSDK::initialize(config, shared, backend.store()).await?;
//!     sdk.set_user(Some("user-1".to_string())).await?;
//!
//!     // 立即可见，远端确认后返回 true
//!     let confirmed = sdk.set_rating(42, Some(RatingValue::Challenging)).await;
//!     println!("confirmed = {}, due = {:?}", confirmed, sdk.recall(42).map(|r| r.due_at()));
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod recall;
pub mod remote;
pub mod sdk;
pub mod sessions;
pub mod storage;
pub mod sync;
pub mod utils;

// 重新导出核心类型，方便使用
pub use config::{MigrationMode, SignOutPolicy, SyncConfig, SyncConfigBuilder};
pub use error::{PracticeSyncError, Result};
pub use events::{EventFilter, EventManager, SyncEvent};
pub use recall::{transition, GraduationLedger, RecallAction, RecallScheduler};
pub use remote::{
    MemoryBackend, MemoryRemote, RemoteCollection, RemoteError, RemoteStore, RestClient, RestConfig,
};
pub use sdk::PracticeSyncSDK;
pub use sessions::PracticeSessionManager;
pub use storage::{
    ChatMessage, LocalCache, Namespace, PracticeSession, ProblemId, Profile, Rating, RatingValue,
    RecallAssignment, RecallType, SessionStatus, SharedCache, StarredFlag, WriteSource,
};
pub use sync::{ChangeLogWatcher, MigrationReport, PendingWrite, SyncEntity, SyncKey};
pub use utils::{Clock, ManualClock, SystemClock};
