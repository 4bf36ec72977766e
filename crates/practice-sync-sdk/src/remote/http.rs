//! REST 远端 - PostgREST 风格的 HTTP 集合绑定
//!
//! 每个集合对应一张表，行以 `user_id` 隔离；写入使用 `on_conflict` + `merge-duplicates` 实现幂等 upsert。

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{RemoteCollection, RemoteError, RemoteResult, RemoteStore};
use crate::error::{PracticeSyncError, Result};
use crate::storage::entities::{
    ChatMessage, PracticeSession, ProblemId, Profile, Rating, RatingValue, RecallAssignment,
    RecallType, SessionStatus, StarredFlag,
};
use crate::sync::SyncEntity;

/// REST 远端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// 服务地址，例如 `https://xyz.example.co`
    pub base_url: String,
    /// 匿名 API key（随每个请求发送）
    pub api_key: String,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// 已认证的会话
#[derive(Debug, Clone)]
struct RestSession {
    user_id: String,
    access_token: String,
}

/// 行映射：实体 ⇄ 表行
pub trait RestRow: SyncEntity {
    const TABLE: &'static str;
    /// 行所属用户的列
    const OWNER_COLUMN: &'static str = "user_id";
    /// 自然键列
    const KEY_COLUMN: &'static str;
    /// upsert 冲突目标
    const CONFLICT: &'static str;
    const SELECT: &'static str = "*";

    fn to_row(&self, key: &Self::Key, user_id: &str) -> Value;

    /// 无法解析的行返回 None（跳过该行）
    fn from_row(row: &Value) -> Option<(Self::Key, Self)>;
}

fn millis_to_rfc3339(ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.to_rfc3339())
}

fn rfc3339_to_millis(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis()),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// 取出并反序列化一列；缺失、为 null 或类型不符时返回 None
fn field<T: DeserializeOwned>(row: &Value, column: &str) -> Option<T> {
    row.get(column)
        .filter(|v| !v.is_null())
        .and_then(|v| T::deserialize(v).ok())
}

fn problem_id_of(row: &Value) -> Option<ProblemId> {
    field(row, "problem_id")
}

impl RestRow for Rating {
    const TABLE: &'static str = "problem_ratings";
    const KEY_COLUMN: &'static str = "problem_id";
    const CONFLICT: &'static str = "user_id,problem_id";
    const SELECT: &'static str = "problem_id,rating,notes";

    fn to_row(&self, key: &ProblemId, user_id: &str) -> Value {
        json!({
            "user_id": user_id,
            "problem_id": key,
            "rating": self.value,
            "notes": self.notes,
        })
    }

    fn from_row(row: &Value) -> Option<(ProblemId, Self)> {
        let id = problem_id_of(row)?;
        let value: RatingValue = field(row, "rating")?;
        let notes = field(row, "notes");
        Some((id, Rating { problem_id: id, value, notes }))
    }
}

impl RestRow for StarredFlag {
    const TABLE: &'static str = "starred_problems";
    const KEY_COLUMN: &'static str = "problem_id";
    const CONFLICT: &'static str = "user_id,problem_id";
    const SELECT: &'static str = "problem_id";

    fn to_row(&self, key: &ProblemId, user_id: &str) -> Value {
        json!({ "user_id": user_id, "problem_id": key })
    }

    fn from_row(row: &Value) -> Option<(ProblemId, Self)> {
        let id = problem_id_of(row)?;
        Some((id, StarredFlag { problem_id: id, starred: true }))
    }
}

impl RestRow for RecallAssignment {
    const TABLE: &'static str = "problem_recalls";
    const KEY_COLUMN: &'static str = "problem_id";
    const CONFLICT: &'static str = "user_id,problem_id";
    const SELECT: &'static str = "problem_id,recall_type,assigned_at";

    fn to_row(&self, key: &ProblemId, user_id: &str) -> Value {
        json!({
            "user_id": user_id,
            "problem_id": key,
            "recall_type": self.recall_type,
            "assigned_at": millis_to_rfc3339(self.assigned_at),
        })
    }

    fn from_row(row: &Value) -> Option<(ProblemId, Self)> {
        let id = problem_id_of(row)?;
        let recall_type: RecallType = field(row, "recall_type")?;
        let assigned_at = rfc3339_to_millis(row.get("assigned_at")?)?;
        Some((id, RecallAssignment::new(id, recall_type, assigned_at)))
    }
}

impl RestRow for PracticeSession {
    const TABLE: &'static str = "marathon_sessions";
    const KEY_COLUMN: &'static str = "id";
    const CONFLICT: &'static str = "id";

    fn to_row(&self, key: &String, user_id: &str) -> Value {
        json!({
            "id": key,
            "user_id": user_id,
            "title": self.title,
            "created_at": millis_to_rfc3339(self.created_at),
            "status": self.status,
            "messages": self.messages,
            "suggestions": self.suggested_ids,
            "solved_map": self.solved_map,
            "elapsed_ms": self.elapsed_ms,
            "preference": self.preference,
            "completed_at": self.completed_at.and_then(millis_to_rfc3339),
            "best_time": self.best_time,
            "ever_completed": self.ever_completed,
            "attempt_number": self.attempt_number,
            "deleted": self.deleted,
        })
    }

    fn from_row(row: &Value) -> Option<(String, Self)> {
        let id: String = field(row, "id")?;
        let created_at = row.get("created_at").and_then(rfc3339_to_millis).unwrap_or_default();
        let mut session = PracticeSession::new(id.clone(), "", created_at);
        session.title = field(row, "title").unwrap_or_default();
        session.status = field(row, "status").unwrap_or(SessionStatus::Planning);
        session.messages = field::<Vec<ChatMessage>>(row, "messages").unwrap_or_default();
        session.suggested_ids = field(row, "suggestions").unwrap_or_default();
        session.solved_map = field(row, "solved_map").unwrap_or_default();
        session.elapsed_ms = field(row, "elapsed_ms").unwrap_or(0);
        session.preference = field(row, "preference");
        session.completed_at = row.get("completed_at").and_then(rfc3339_to_millis);
        session.best_time = field(row, "best_time");
        session.ever_completed = field(row, "ever_completed").unwrap_or(false);
        session.attempt_number = field::<u32>(row, "attempt_number").unwrap_or(1).max(1);
        session.deleted = field(row, "deleted").unwrap_or(false);
        Some((id, session))
    }
}

impl RestRow for Profile {
    const TABLE: &'static str = "profiles";
    const OWNER_COLUMN: &'static str = "id";
    const KEY_COLUMN: &'static str = "id";
    const CONFLICT: &'static str = "id";
    const SELECT: &'static str = "id,full_name,email,avatar_url";

    fn to_row(&self, key: &String, _user_id: &str) -> Value {
        json!({
            "id": key,
            "full_name": self.name,
            "email": self.email,
            "avatar_url": self.avatar_uri,
        })
    }

    fn from_row(row: &Value) -> Option<(String, Self)> {
        let profile = Profile {
            name: field(row, "full_name").unwrap_or_default(),
            email: field(row, "email").unwrap_or_default(),
            avatar_uri: field(row, "avatar_url"),
        };
        Some((field(row, "id")?, profile))
    }
}

/// 共享 HTTP 客户端与认证状态
pub struct RestClient {
    client: Client,
    config: RestConfig,
    session: RwLock<Option<RestSession>>,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Result<Arc<Self>> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| PracticeSyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ REST 客户端已创建 (base_url: {})", config.base_url);
        Ok(Arc::new(Self {
            client,
            config,
            session: RwLock::new(None),
        }))
    }

    /// 登录后设置凭证；之后所有请求以该用户身份发出
    pub fn set_session(&self, user_id: impl Into<String>, access_token: impl Into<String>) {
        *self.session.write() = Some(RestSession {
            user_id: user_id.into(),
            access_token: access_token.into(),
        });
    }

    pub fn clear_session(&self) {
        *self.session.write() = None;
    }

    /// 以本客户端构造五个集合
    pub fn remote_store(self: &Arc<Self>) -> RemoteStore {
        RemoteStore {
            ratings: Arc::new(HttpRemoteCollection::<Rating>::new(self.clone())),
            starred: Arc::new(HttpRemoteCollection::<StarredFlag>::new(self.clone())),
            recalls: Arc::new(HttpRemoteCollection::<RecallAssignment>::new(self.clone())),
            sessions: Arc::new(HttpRemoteCollection::<PracticeSession>::new(self.clone())),
            profiles: Arc::new(HttpRemoteCollection::<Profile>::new(self.clone())),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base_url.trim_end_matches('/'), table)
    }

    fn current_session(&self) -> RemoteResult<RestSession> {
        self.session.read().clone().ok_or(RemoteError::Unauthorized)
    }

    fn authorized(&self, builder: RequestBuilder, session: &RestSession) -> RequestBuilder {
        builder
            .header("apikey", &self.config.api_key)
            .bearer_auth(&session.access_token)
    }
}

/// 单张表上的集合实现
pub struct HttpRemoteCollection<E: RestRow> {
    client: Arc<RestClient>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: RestRow> HttpRemoteCollection<E> {
    pub fn new(client: Arc<RestClient>) -> Self {
        Self {
            client,
            _entity: PhantomData,
        }
    }

    fn select_request(&self, session: &RestSession) -> RequestBuilder {
        let owner_filter = format!("eq.{}", session.user_id);
        let builder = self
            .client
            .client
            .get(self.client.table_url(E::TABLE))
            .query(&[("select", E::SELECT), (E::OWNER_COLUMN, owner_filter.as_str())]);
        self.client.authorized(builder, session)
    }

    fn upsert_request(&self, session: &RestSession, key: &E::Key, entity: &E) -> RequestBuilder {
        let builder = self
            .client
            .client
            .post(self.client.table_url(E::TABLE))
            .query(&[("on_conflict", E::CONFLICT)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[entity.to_row(key, &session.user_id)]);
        self.client.authorized(builder, session)
    }

    fn delete_request(&self, session: &RestSession, key: &E::Key) -> RequestBuilder {
        let owner_filter = format!("eq.{}", session.user_id);
        let key_filter = format!("eq.{}", key);
        let mut params = vec![(E::OWNER_COLUMN, owner_filter)];
        if E::KEY_COLUMN != E::OWNER_COLUMN {
            params.push((E::KEY_COLUMN, key_filter));
        }
        let builder = self
            .client
            .client
            .delete(self.client.table_url(E::TABLE))
            .query(&params);
        self.client.authorized(builder, session)
    }
}

async fn send(builder: RequestBuilder) -> RemoteResult<Response> {
    let response = builder
        .send()
        .await
        .map_err(|e| RemoteError::Network(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(RemoteError::Unauthorized);
    }
    let message = response.text().await.unwrap_or_default();
    Err(RemoteError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl<E: RestRow> RemoteCollection<E> for HttpRemoteCollection<E> {
    async fn get_all(&self) -> RemoteResult<BTreeMap<E::Key, E>> {
        let session = self.client.current_session()?;
        let response = send(self.select_request(&session)).await?;
        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;

        let mut entries = BTreeMap::new();
        for row in &rows {
            match E::from_row(row) {
                Some((key, entity)) => {
                    entries.insert(key, entity);
                }
                None => warn!("⚠️ 跳过无法解析的 {} 行: {}", E::TABLE, row),
            }
        }
        debug!("📥 {} 拉取 {} 行", E::TABLE, entries.len());
        Ok(entries)
    }

    async fn upsert(&self, key: &E::Key, entity: &E) -> RemoteResult<()> {
        let session = self.client.current_session()?;
        send(self.upsert_request(&session, key, entity)).await?;
        debug!("📤 {} upsert {}", E::TABLE, key);
        Ok(())
    }

    async fn delete(&self, key: &E::Key) -> RemoteResult<()> {
        let session = self.client.current_session()?;
        send(self.delete_request(&session, key)).await?;
        debug!("🗑️ {} delete {}", E::TABLE, key);
        Ok(())
    }
}
