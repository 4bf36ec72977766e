//! 数据实体定义 - 对应本地缓存中的集合结构
//!
//! 这里定义了所有同步实体对应的 Rust 结构体，用于：
//! - 类型安全的数据传输
//! - 统一的数据表示（本地缓存使用 camelCase JSON）
//! - 派生字段（solved、due_at、best_time 规则）

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 题目 ID
pub type ProblemId = u64;

/// 一天的毫秒数
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// 题目评价
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatingValue {
    Yum,
    Desirable,
    Challenging,
    Incomprehensible,
    Exhausting,
}

impl RatingValue {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yum => "yum",
            Self::Desirable => "desirable",
            Self::Challenging => "challenging",
            Self::Incomprehensible => "incomprehensible",
            Self::Exhausting => "exhausting",
        }
    }

    /// 该评价对应的复习类型（仅 challenging / incomprehensible 进入复习）
    pub fn recall_type(self) -> Option<RecallType> {
        match self {
            Self::Challenging => Some(RecallType::Challenging),
            Self::Incomprehensible => Some(RecallType::Incomprehensible),
            _ => None,
        }
    }

    /// 从复习状态直接转到该评价时是否算「毕业」
    pub fn is_graduating(self) -> bool {
        matches!(self, Self::Yum | Self::Desirable)
    }

    /// exhausting 不算已解决
    pub fn counts_as_solved(self) -> bool {
        self != Self::Exhausting
    }
}

impl fmt::Display for RatingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 评价实体 - 「未评价」用删除条目表示，永远不存 null
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub problem_id: ProblemId,
    pub value: RatingValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Rating {
    pub fn new(problem_id: ProblemId, value: RatingValue) -> Self {
        Self {
            problem_id,
            value,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// solved = 有评价且不是 exhausting
pub fn is_solved(rating: Option<&Rating>) -> bool {
    rating.map_or(false, |r| r.value.counts_as_solved())
}

/// 收藏标记 - 远端只存在 starred = true 的条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StarredFlag {
    pub problem_id: ProblemId,
    pub starred: bool,
}

/// 复习类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecallType {
    Challenging,
    Incomprehensible,
}

impl RecallType {
    /// 复习间隔（毫秒）：challenging 3 天，incomprehensible 5 天
    pub fn delay_ms(self) -> i64 {
        match self {
            Self::Challenging => 3 * DAY_MS,
            Self::Incomprehensible => 5 * DAY_MS,
        }
    }
}

/// 复习任务 - 每道题最多一个
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallAssignment {
    pub problem_id: ProblemId,
    #[serde(rename = "type")]
    pub recall_type: RecallType,
    /// 分配时间（毫秒时间戳）
    pub assigned_at: i64,
}

impl RecallAssignment {
    pub fn new(problem_id: ProblemId, recall_type: RecallType, assigned_at: i64) -> Self {
        Self {
            problem_id,
            recall_type,
            assigned_at,
        }
    }

    pub fn due_at(&self) -> i64 {
        self.assigned_at + self.recall_type.delay_ms()
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.due_at() <= now_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Planning,
    Running,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "role")]
    pub speaker: Speaker,
    pub text: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Bot,
            text: text.into(),
        }
    }
}

/// 练习会话（marathon session）
///
/// `deleted = true` 是墓碑：列表中隐藏、不再推送，但字段保留，避免多标签页之间「复活」。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PracticeSession {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: i64,
    pub status: SessionStatus,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, rename = "suggestions")]
    pub suggested_ids: Vec<ProblemId>,
    #[serde(default)]
    pub solved_map: BTreeMap<ProblemId, bool>,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_time: Option<u64>,
    #[serde(default)]
    pub ever_completed: bool,
    #[serde(default = "default_attempt_number")]
    pub attempt_number: u32,
    #[serde(default)]
    pub deleted: bool,
}

fn default_attempt_number() -> u32 {
    1
}

impl PracticeSession {
    pub fn new(id: impl Into<String>, title: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            created_at,
            status: SessionStatus::Planning,
            messages: Vec::new(),
            suggested_ids: Vec::new(),
            solved_map: BTreeMap::new(),
            elapsed_ms: 0,
            preference: None,
            completed_at: None,
            best_time: None,
            ever_completed: false,
            attempt_number: 1,
            deleted: false,
        }
    }

    /// 所有推荐题目都已解决（推荐列表为空时不算完成）
    pub fn is_all_solved(&self) -> bool {
        !self.suggested_ids.is_empty()
            && self
                .suggested_ids
                .iter()
                .all(|id| self.solved_map.get(id).copied().unwrap_or(false))
    }

    /// 记录一次完成，返回是否刷新了最佳成绩
    ///
    /// best_time 一旦设置只会变小。
    pub fn record_completion(&mut self, elapsed_ms: u64, completed_at: i64) -> bool {
        let is_new_best = self.best_time.map_or(true, |best| elapsed_ms < best);
        if is_new_best {
            self.best_time = Some(elapsed_ms);
        }
        self.status = SessionStatus::Completed;
        self.completed_at = Some(completed_at);
        self.elapsed_ms = elapsed_ms;
        self.ever_completed = true;
        is_new_best
    }

    /// 开始新一轮尝试：清空解题状态与计时，保留 best_time / ever_completed
    pub fn start_retry(&mut self) {
        self.solved_map.clear();
        self.elapsed_ms = 0;
        self.status = SessionStatus::Running;
        self.attempt_number = self.attempt_number.max(1) + 1;
    }

    /// 旧数据补齐：已全部解决但没有 ever_completed 标记的会话
    pub fn backfill_completion(&mut self) -> bool {
        if self.ever_completed || !self.is_all_solved() {
            return false;
        }
        self.ever_completed = true;
        if self.best_time.is_none() {
            self.best_time = Some(self.elapsed_ms);
        }
        true
    }
}

/// 用户资料 - 无复习语义，最后写入者胜出
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_uri: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solved_is_derived_from_rating() {
        assert!(!is_solved(None));
        assert!(is_solved(Some(&Rating::new(1, RatingValue::Yum))));
        assert!(is_solved(Some(&Rating::new(1, RatingValue::Challenging))));
        assert!(!is_solved(Some(&Rating::new(1, RatingValue::Exhausting))));
    }

    #[test]
    fn recall_due_date_law() {
        let assigned_at = 1_700_000_000_000;
        let c = RecallAssignment::new(7, RecallType::Challenging, assigned_at);
        let i = RecallAssignment::new(7, RecallType::Incomprehensible, assigned_at);
        assert_eq!(c.due_at() - c.assigned_at, 3 * DAY_MS);
        assert_eq!(i.due_at() - i.assigned_at, 5 * DAY_MS);
        assert!(!c.is_due(assigned_at + 3 * DAY_MS - 1));
        assert!(c.is_due(assigned_at + 3 * DAY_MS));
    }

    #[test]
    fn best_time_only_decreases() {
        let mut session = PracticeSession::new("s1", "Chat 1", 0);
        session.best_time = Some(45_000);

        assert!(!session.record_completion(52_000, 10));
        assert_eq!(session.best_time, Some(45_000));
        assert_eq!(session.elapsed_ms, 52_000);

        assert!(session.record_completion(30_000, 20));
        assert_eq!(session.best_time, Some(30_000));
        assert!(session.ever_completed);
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn retry_keeps_best_time_and_bumps_attempt() {
        let mut session = PracticeSession::new("s1", "Chat 1", 0);
        session.suggested_ids = vec![1, 2];
        session.solved_map.insert(1, true);
        session.solved_map.insert(2, true);
        session.record_completion(60_000, 5);

        session.start_retry();
        assert_eq!(session.attempt_number, 2);
        assert!(session.solved_map.is_empty());
        assert_eq!(session.elapsed_ms, 0);
        assert_eq!(session.best_time, Some(60_000));
        assert!(session.ever_completed);
    }

    #[test]
    fn session_json_uses_cache_layout() {
        let raw = r#"{
            "id": "abc",
            "title": "Chat 2",
            "status": "running",
            "messages": [{"role": "bot", "text": "hi"}],
            "suggestions": [3, 4],
            "solvedMap": {"3": true},
            "elapsedMs": 1200
        }"#;
        let session: PracticeSession = serde_json::from_str(raw).unwrap();
        assert_eq!(session.suggested_ids, vec![3, 4]);
        assert_eq!(session.solved_map.get(&3), Some(&true));
        assert_eq!(session.attempt_number, 1);
        assert!(!session.deleted);
        assert_eq!(session.messages[0].speaker, Speaker::Bot);
    }

    #[test]
    fn backfill_marks_completed_legacy_sessions() {
        let mut session = PracticeSession::new("s1", "Chat 1", 0);
        session.suggested_ids = vec![9];
        session.solved_map.insert(9, true);
        session.elapsed_ms = 42_000;

        assert!(session.backfill_completion());
        assert!(session.ever_completed);
        assert_eq!(session.best_time, Some(42_000));
        assert!(!session.backfill_completion());
    }
}
