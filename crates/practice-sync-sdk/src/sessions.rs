//! 练习会话管理 - 马拉松会话的创建、推进、重试与软删除
//!
//! 所有修改都走乐观路径；已软删除的会话拒绝后续修改。

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::storage::cache::{keys, LocalCache, WriteSource};
use crate::storage::entities::{ChatMessage, PracticeSession, ProblemId, SessionStatus, Speaker};
use crate::sync::optimistic::{OptimisticCollection, PendingWrite};
use crate::utils::Clock;

/// 新会话的欢迎语
pub const GREETING: &str = "Hi! What kind of problems do you want to marathon today? \
You can mention topics, difficulty limits, or constraints.";

/// 快捷按钮文本，不用于生成标题
const PRESET_PROMPTS: [&str; 3] = ["include 🍋", "include 🥦", "surprise me 🌶️"];

const TITLE_MAX_CHARS: usize = 30;

fn rejected() -> PendingWrite {
    Box::pin(futures::future::ready(false))
}

/// 取第一条非快捷按钮的用户消息作为标题
pub fn generate_title(messages: &[ChatMessage]) -> Option<String> {
    let message = messages
        .iter()
        .find(|m| m.speaker == Speaker::User && !PRESET_PROMPTS.contains(&m.text.as_str()))?;
    let mut title: String = message.text.chars().take(TITLE_MAX_CHARS).collect();
    if message.text.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    Some(title)
}

pub struct PracticeSessionManager {
    sessions: OptimisticCollection<PracticeSession>,
    cache: LocalCache,
    clock: Arc<dyn Clock>,
    current: RwLock<Option<String>>,
}

impl PracticeSessionManager {
    pub fn new(sessions: OptimisticCollection<PracticeSession>, cache: LocalCache, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions,
            cache,
            clock,
            current: RwLock::new(None),
        }
    }

    pub fn collection(&self) -> &OptimisticCollection<PracticeSession> {
        &self.sessions
    }

    /// 从缓存载入当前会话指针（指向已删除或不存在的会话时忽略）
    pub fn load_current(&self) {
        let stored: Option<String> = self.cache.read(keys::CURRENT_SESSION);
        let valid = stored.filter(|id| self.get(id).map_or(false, |s| !s.deleted));
        *self.current.write() = valid;
    }

    pub fn reset(&self) {
        *self.current.write() = None;
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.current.read().clone()
    }

    pub fn current_session(&self) -> Option<PracticeSession> {
        self.current_session_id().and_then(|id| self.get(&id))
    }

    /// 切换当前会话
    pub fn switch_to(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) if !session.deleted => {
                self.set_current(Some(id.to_string()));
                true
            }
            _ => false,
        }
    }

    fn set_current(&self, id: Option<String>) {
        if let Err(e) = self.cache.write(keys::CURRENT_SESSION, &id, WriteSource::Optimistic) {
            warn!("⚠️ 当前会话指针写入失败: {}", e);
        }
        *self.current.write() = id;
    }

    pub fn get(&self, id: &str) -> Option<PracticeSession> {
        self.sessions.get(&id.to_string())
    }

    /// 未删除的会话，最新创建的在前
    pub fn list_active(&self) -> Vec<PracticeSession> {
        let mut sessions: Vec<_> = self
            .sessions
            .snapshot()
            .into_values()
            .filter(|session| !session.deleted)
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// 新建会话并设为当前会话；`title` 为空时按 `Chat N` 命名
    pub fn create_session(&self, title: Option<&str>) -> (String, PendingWrite) {
        let id = uuid::Uuid::new_v4().to_string();
        let title = match title {
            Some(title) => title.to_string(),
            None => {
                let live = self.sessions.snapshot().values().filter(|s| !s.deleted).count();
                format!("Chat {}", live + 1)
            }
        };
        let mut session = PracticeSession::new(id.clone(), title, self.clock.now_ms());
        session.messages.push(ChatMessage::bot(GREETING));

        info!("🆕 新建练习会话: {} ({})", session.title, id);
        let write = self.sessions.set_value(id.clone(), Some(session));
        self.set_current(Some(id.clone()));
        (id, write)
    }

    /// 读-改-写一个会话；会话不存在或已删除时返回 false
    pub fn update<F>(&self, id: &str, mutate: F) -> PendingWrite
    where
        F: FnOnce(&mut PracticeSession),
    {
        let Some(mut session) = self.get(id) else {
            debug!("会话 {} 不存在，忽略修改", id);
            return rejected();
        };
        if session.deleted {
            debug!("会话 {} 已删除，忽略修改", id);
            return rejected();
        }
        mutate(&mut session);
        self.sessions.set_value(id.to_string(), Some(session))
    }

    /// 追加消息；第一条有效的用户消息会替换默认标题
    pub fn append_message(&self, id: &str, message: ChatMessage) -> PendingWrite {
        self.update(id, |session| {
            session.messages.push(message);
            if session.title.starts_with("Chat ") {
                if let Some(title) = generate_title(&session.messages) {
                    session.title = title;
                }
            }
        })
    }

    /// 设置推荐题目，会话进入 running
    pub fn set_suggestions(&self, id: &str, problem_ids: Vec<ProblemId>, preference: Option<String>) -> PendingWrite {
        self.update(id, |session| {
            session.suggested_ids = problem_ids;
            session.solved_map.clear();
            session.elapsed_ms = 0;
            if preference.is_some() {
                session.preference = preference;
            }
            session.status = SessionStatus::Running;
        })
    }

    pub fn start(&self, id: &str) -> PendingWrite {
        self.update(id, |session| session.status = SessionStatus::Running)
    }

    /// 计时推进（仅 running 状态）
    pub fn tick(&self, id: &str, elapsed_ms: u64) -> PendingWrite {
        match self.get(id) {
            Some(session) if session.status == SessionStatus::Running => {
                self.update(id, |session| session.elapsed_ms = elapsed_ms)
            }
            _ => rejected(),
        }
    }

    /// 标记题目解决状态；running 中全部解决时自动记录完成
    pub fn toggle_solved(&self, id: &str, problem_id: ProblemId, solved: bool) -> PendingWrite {
        let now = self.clock.now_ms();
        self.update(id, |session| {
            session.solved_map.insert(problem_id, solved);
            if session.status == SessionStatus::Running && session.is_all_solved() {
                let elapsed = session.elapsed_ms;
                let is_new_best = session.record_completion(elapsed, now);
                info!("🏁 会话 {} 完成 ({}ms, new_best={})", session.id, elapsed, is_new_best);
            }
        })
    }

    /// 记录一次完成；返回是否刷新最佳成绩
    pub fn complete_attempt(&self, id: &str, elapsed_ms: u64) -> (bool, PendingWrite) {
        let now = self.clock.now_ms();
        let mut is_new_best = false;
        let write = self.update(id, |session| {
            is_new_best = session.record_completion(elapsed_ms, now);
        });
        (is_new_best, write)
    }

    /// 重新挑战：清空解题状态与计时，保留最佳成绩
    pub fn retry(&self, id: &str) -> PendingWrite {
        self.update(id, PracticeSession::start_retry)
    }

    /// 软删除；删除当前会话时切换到最新的剩余会话，没有剩余时新建一个
    pub fn soft_delete(&self, id: &str) -> PendingWrite {
        let write = self.update(id, |session| session.deleted = true);

        if self.current_session_id().as_deref() == Some(id) {
            match self.list_active().first() {
                Some(next) => self.set_current(Some(next.id.clone())),
                None => {
                    let (_, created) = self.create_session(None);
                    drop(created);
                }
            }
        }
        write
    }
}
