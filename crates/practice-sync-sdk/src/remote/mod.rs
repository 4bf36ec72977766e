//! 远端访问层 - 每个实体一个窄的异步 CRUD 接口
//!
//! 所有操作在服务端按当前登录用户隔离；`upsert` 在实体的自然键上幂等。
//! 调用失败以 `RemoteError` 返回，由调用点捕获，不向上抛出 panic。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::storage::entities::{PracticeSession, Profile, Rating, RecallAssignment, StarredFlag};
use crate::sync::SyncEntity;

pub mod http;
pub mod memory;

pub use http::{RestClient, RestConfig, RestRow};
pub use memory::{MemoryBackend, MemoryRemote, RemoteOp};

/// 远端调用错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("网络错误: {0}")]
    Network(String),

    #[error("未认证或会话已失效")]
    Unauthorized,

    #[error("服务端拒绝请求 ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("响应解析失败: {0}")]
    Decode(String),

    #[error("远端不可用: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// 是否值得由调用方重试
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Unavailable(_) => true,
            RemoteError::Rejected { status, .. } => *status >= 500 && *status < 600,
            RemoteError::Unauthorized | RemoteError::Decode(_) => false,
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// 单个实体集合的远端接口
#[async_trait]
pub trait RemoteCollection<E: SyncEntity>: Send + Sync {
    /// 拉取当前用户的全部条目
    async fn get_all(&self) -> RemoteResult<BTreeMap<E::Key, E>>;

    /// 按自然键写入（幂等）
    async fn upsert(&self, key: &E::Key, entity: &E) -> RemoteResult<()>;

    /// 按自然键删除（条目不存在时视为成功）
    async fn delete(&self, key: &E::Key) -> RemoteResult<()>;
}

/// 五个同步集合的远端句柄
#[derive(Clone)]
pub struct RemoteStore {
    pub ratings: Arc<dyn RemoteCollection<Rating>>,
    pub starred: Arc<dyn RemoteCollection<StarredFlag>>,
    pub recalls: Arc<dyn RemoteCollection<RecallAssignment>>,
    pub sessions: Arc<dyn RemoteCollection<PracticeSession>>,
    pub profiles: Arc<dyn RemoteCollection<Profile>>,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore").finish_non_exhaustive()
    }
}
