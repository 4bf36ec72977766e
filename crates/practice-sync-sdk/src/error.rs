use std::fmt;

use crate::remote::RemoteError;

#[derive(Debug)]
pub enum PracticeSyncError {
    JsonError(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    /// 当前没有登录用户（同步能力不可用）
    NotAuthenticated,
    /// 远端存储调用失败
    Remote(RemoteError),
    Config(String),
    ShuttingDown(String),
    /// 旧版本地数据迁移部分失败（失败条数）
    PartialMigration(usize),
}

impl fmt::Display for PracticeSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PracticeSyncError::JsonError(e) => write!(f, "JSON error: {}", e),
            PracticeSyncError::KvStore(e) => write!(f, "KV store error: {}", e),
            PracticeSyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            PracticeSyncError::IO(e) => write!(f, "IO error: {}", e),
            PracticeSyncError::NotAuthenticated => write!(f, "Not authenticated"),
            PracticeSyncError::Remote(e) => write!(f, "Remote error: {}", e),
            PracticeSyncError::Config(e) => write!(f, "Config error: {}", e),
            PracticeSyncError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            PracticeSyncError::PartialMigration(n) => {
                write!(f, "Legacy migration incomplete: {} entries failed", n)
            }
        }
    }
}

impl std::error::Error for PracticeSyncError {}

impl From<serde_json::Error> for PracticeSyncError {
    fn from(error: serde_json::Error) -> Self {
        PracticeSyncError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for PracticeSyncError {
    fn from(error: std::io::Error) -> Self {
        PracticeSyncError::IO(error.to_string())
    }
}

impl From<sled::Error> for PracticeSyncError {
    fn from(error: sled::Error) -> Self {
        PracticeSyncError::KvStore(error.to_string())
    }
}

impl From<RemoteError> for PracticeSyncError {
    fn from(error: RemoteError) -> Self {
        PracticeSyncError::Remote(error)
    }
}

pub type Result<T> = std::result::Result<T, PracticeSyncError>;
