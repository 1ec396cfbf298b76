//! 信件、变更日志与同步结果的数据模型

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// 统一的时间戳格式：RFC 3339 UTC，毫秒精度，`Z` 结尾
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 解析存储中的时间戳（兼容任意时区偏移）
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// 当前时间（已按存储精度截断）
pub fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}

// ============================================================================
// 信件
// ============================================================================

/// 信件处理状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LetterStatus {
    /// 新收到
    #[default]
    New,
    /// 处理中
    InProgress,
    /// 待澄清
    Clarification,
    /// 答复已就绪
    Ready,
    /// 已完成
    Done,
}

impl LetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::InProgress => "IN_PROGRESS",
            Self::Clarification => "CLARIFICATION",
            Self::Ready => "READY",
            Self::Done => "DONE",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "NEW" => Self::New,
            "IN_PROGRESS" => Self::InProgress,
            "CLARIFICATION" => Self::Clarification,
            "READY" => Self::Ready,
            "DONE" => Self::Done,
            _ => Self::New,
        }
    }
}

/// 被跟踪的信件实体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Letter {
    pub id: String,
    /// 信件编号
    pub number: String,
    /// 来文单位
    pub org: String,
    /// 来文日期
    pub date: DateTime<Utc>,
    /// 答复期限
    pub deadline_date: Option<DateTime<Utc>>,
    pub status: LetterStatus,
    /// 负责人
    pub owner_id: Option<String>,
    pub letter_type: Option<String>,
    pub priority: i32,
    pub content: Option<String>,
    pub answer: Option<String>,
    pub jira_link: Option<String>,
    pub tags: Vec<String>,
    /// 远程表格中的行号缓存（追加后回写）
    pub sheet_row: Option<i64>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// 软删除时间戳
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Letter {
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// 创建信件参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLetterParams {
    /// 指定 ID（导入场景）；为空时自动生成
    #[serde(default)]
    pub id: Option<String>,
    pub number: String,
    pub org: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub deadline_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: LetterStatus,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub letter_type: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub jira_link: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// 部分更新
///
/// 外层 `None` 表示不修改；可空字段的 `Some(None)` 表示清空。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LetterChanges {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline_date: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub status: Option<LetterStatus>,
    #[serde(default)]
    pub owner_id: Option<Option<String>>,
    #[serde(default)]
    pub letter_type: Option<Option<String>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub content: Option<Option<String>>,
    #[serde(default)]
    pub answer: Option<Option<String>>,
    #[serde(default)]
    pub jira_link: Option<Option<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub deleted_at: Option<Option<DateTime<Utc>>>,
}

impl LetterChanges {
    /// 把修改应用到信件副本上
    pub fn apply_to(&self, letter: &mut Letter) {
        if let Some(v) = &self.number {
            letter.number = v.clone();
        }
        if let Some(v) = &self.org {
            letter.org = v.clone();
        }
        if let Some(v) = self.date {
            letter.date = v;
        }
        if let Some(v) = self.deadline_date {
            letter.deadline_date = v;
        }
        if let Some(v) = self.status {
            letter.status = v;
        }
        if let Some(v) = &self.owner_id {
            letter.owner_id = v.clone();
        }
        if let Some(v) = &self.letter_type {
            letter.letter_type = v.clone();
        }
        if let Some(v) = self.priority {
            letter.priority = v;
        }
        if let Some(v) = &self.content {
            letter.content = v.clone();
        }
        if let Some(v) = &self.answer {
            letter.answer = v.clone();
        }
        if let Some(v) = &self.jira_link {
            letter.jira_link = v.clone();
        }
        if let Some(v) = &self.tags {
            letter.tags = v.clone();
        }
        if let Some(v) = self.deleted_at {
            letter.deleted_at = v;
        }
    }
}

// ============================================================================
// 变更日志
// ============================================================================

/// 变更动作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "CREATE" => Self::Create,
            "DELETE" => Self::Delete,
            _ => Self::Update,
        }
    }
}

/// 变更日志的同步状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// 等待同步
    #[default]
    Pending,
    /// 已同步
    Synced,
    /// 同步失败（重试次数未达上限时会再次进入批次）
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Synced => "SYNCED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "SYNCED" => Self::Synced,
            "FAILED" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// 变更日志记录（追加写入，只更新同步状态字段）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogRecord {
    pub id: String,
    pub letter_id: String,
    pub action: ChangeAction,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub actor_id: Option<String>,
    pub sync_status: SyncState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub synced_at: Option<String>,
}

/// 变更日志状态汇总（运维面板）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSummary {
    /// 等待同步
    pub pending: u64,
    /// 失败但仍可重试
    pub failed: u64,
    /// 失败且已达重试上限
    pub exhausted: u64,
    pub synced: u64,
    pub total: u64,
    /// 最近一次成功同步的时间
    pub last_synced_at: Option<String>,
}

/// 单次同步批次结果
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunResult {
    /// 本批次取出的变更日志条数
    pub processed: usize,
    /// 标记为 SYNCED 的条数
    pub synced: usize,
    /// 标记为 FAILED 的条数
    pub failed: usize,
    pub errors: Vec<String>,
}

impl SyncRunResult {
    pub fn is_noop(&self) -> bool {
        self.processed == 0 && self.errors.is_empty()
    }
}
