use std::fmt;
use std::str::FromStr;

use crate::storage::cache::keys;

/// 变更监听器负责的逻辑键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncKey {
    Ratings,
    Starred,
    Recalls,
    Sessions,
}

impl SyncKey {
    pub const ALL: [SyncKey; 4] = [
        SyncKey::Ratings,
        SyncKey::Starred,
        SyncKey::Recalls,
        SyncKey::Sessions,
    ];

    /// 对应的缓存键
    pub fn cache_key(self) -> &'static str {
        match self {
            SyncKey::Ratings => keys::RATINGS,
            SyncKey::Starred => keys::STARRED,
            SyncKey::Recalls => keys::RECALLS,
            SyncKey::Sessions => keys::SESSIONS,
        }
    }

    pub fn from_cache_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.cache_key() == key)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncKey::Ratings => "ratings",
            SyncKey::Starred => "starred",
            SyncKey::Recalls => "recalls",
            SyncKey::Sessions => "sessions",
        }
    }
}

impl FromStr for SyncKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|k| k.as_str() == s).ok_or(())
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
