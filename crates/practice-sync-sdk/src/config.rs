//! SDK 配置

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PracticeSyncError, Result};
use crate::remote::RestConfig;

/// 登出时如何处理该用户的本地缓存
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignOutPolicy {
    /// 清空该用户命名空间下的同步集合（匿名数据不受影响）
    #[default]
    ClearLocal,
    /// 保留本地缓存，下次同一用户登录时直接展示
    KeepLocal,
}

/// 检测到旧版本地数据时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// 登录后自动迁移
    #[default]
    Auto,
    /// 只发出 LegacyDataDetected 事件，等待 UI 调用 migrate_legacy
    Offer,
}

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 变更监听器的防抖窗口（毫秒）
    pub debounce_ms: u64,
    /// SDK 事件通道容量
    pub event_capacity: usize,
    /// 缓存变更总线容量
    pub cache_bus_capacity: usize,
    pub sign_out_policy: SignOutPolicy,
    pub migration_mode: MigrationMode,
    /// REST 远端（None 时由调用方自行提供 RemoteStore）
    pub rest: Option<RestConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            debounce_ms: 500,
            event_capacity: 1000,
            cache_bus_capacity: 256,
            sign_out_policy: SignOutPolicy::default(),
            migration_mode: MigrationMode::default(),
            rest: None,
        }
    }
}

/// 获取默认数据目录 ~/.practice-sync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".practice-sync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".practice-sync")
    } else {
        PathBuf::from("./practice_sync_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 {
            return Err(PracticeSyncError::Config("debounce_ms 必须大于 0".to_string()));
        }
        if self.event_capacity == 0 || self.cache_bus_capacity == 0 {
            return Err(PracticeSyncError::Config("通道容量必须大于 0".to_string()));
        }
        if let Some(rest) = &self.rest {
            if rest.base_url.is_empty() {
                return Err(PracticeSyncError::Config("REST base_url 不能为空".to_string()));
            }
        }
        Ok(())
    }
}

/// 配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.config.debounce_ms = ms;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn cache_bus_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_bus_capacity = capacity;
        self
    }

    pub fn sign_out_policy(mut self, policy: SignOutPolicy) -> Self {
        self.config.sign_out_policy = policy;
        self
    }

    pub fn migration_mode(mut self, mode: MigrationMode) -> Self {
        self.config.migration_mode = mode;
        self
    }

    pub fn rest(mut self, rest: RestConfig) -> Self {
        self.config.rest = Some(rest);
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}
