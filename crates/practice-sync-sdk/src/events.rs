//! 事件系统模块 - 同步引擎对 UI 层的通知
//!
//! 数据变更（含跨标签页）、乐观写入确认/回滚、对账与登录引导进度、复习调度，
//! 统一通过 `EventManager` 广播。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::storage::entities::{ProblemId, RecallType};

/// SDK 事件类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 缓存中的集合已变更，UI 需重新读取
    DataChanged {
        cache_key: String,
        /// 是否来自其他标签页
        remote_tab: bool,
    },
    /// 乐观写入已被远端确认
    WriteConfirmed { collection: String, key: String },
    /// 乐观写入失败，内存状态已回滚
    WriteRolledBack {
        collection: String,
        key: String,
        error: String,
    },
    SyncStarted { sync_key: String },
    SyncCompleted {
        sync_key: String,
        upserted: usize,
        deleted: usize,
    },
    /// 对账失败（等待下一次写入或手动重同步）
    SyncFailed { sync_key: String, error: String },
    HydrationCompleted {
        user_id: String,
        /// 拉取失败、保持本地数据的集合
        failed_collections: Vec<String>,
    },
    /// 检测到旧版本地数据，等待用户确认迁移
    LegacyDataDetected { entries: usize },
    MigrationCompleted { pushed: usize, failed: usize },
    RecallScheduled {
        problem_id: ProblemId,
        recall_type: RecallType,
        due_at: i64,
    },
    RecallCleared { problem_id: ProblemId, graduated: bool },
    AuthChanged { user_id: Option<String> },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::DataChanged { .. } => "data_changed",
            SyncEvent::WriteConfirmed { .. } => "write_confirmed",
            SyncEvent::WriteRolledBack { .. } => "write_rolled_back",
            SyncEvent::SyncStarted { .. } => "sync_started",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::SyncFailed { .. } => "sync_failed",
            SyncEvent::HydrationCompleted { .. } => "hydration_completed",
            SyncEvent::LegacyDataDetected { .. } => "legacy_data_detected",
            SyncEvent::MigrationCompleted { .. } => "migration_completed",
            SyncEvent::RecallScheduled { .. } => "recall_scheduled",
            SyncEvent::RecallCleared { .. } => "recall_cleared",
            SyncEvent::AuthChanged { .. } => "auth_changed",
        }
    }

    /// 事件相关的集合名
    pub fn collection(&self) -> Option<&str> {
        match self {
            SyncEvent::WriteConfirmed { collection, .. } | SyncEvent::WriteRolledBack { collection, .. } => {
                Some(collection)
            }
            SyncEvent::SyncStarted { sync_key }
            | SyncEvent::SyncCompleted { sync_key, .. }
            | SyncEvent::SyncFailed { sync_key, .. } => Some(sync_key),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub collections: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.collections = Some(collections);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref collections) = self.collections {
            match event.collection() {
                Some(collection) => collections.iter().any(|c| c == collection),
                None => false, // 事件没有集合但过滤器要求有
            }
        } else {
            true
        }
    }
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());
        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 只接收匹配 `filter` 的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver {
            receiver: self.sender.subscribe(),
            filter,
        }
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
