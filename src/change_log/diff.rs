//! 跟踪字段的快照与比较
//!
//! 变更检测只比较规范化后的字符串：
//! - 时间统一为毫秒精度的 UTC RFC 3339
//! - 列表 / 对象为紧凑 JSON
//! - 枚举为线上名称
//!
//! 语义相同但格式不同的值（首尾空白等）按字符串逐字比较，视为变更。

use crate::models::{format_timestamp, Letter};

/// 参与外部同步的字段白名单（顺序即变更日志写入顺序）
pub const TRACKED_FIELDS: &[&str] = &[
    "number",
    "org",
    "date",
    "deadline_date",
    "status",
    "owner_id",
    "letter_type",
    "priority",
    "content",
    "answer",
    "jira_link",
    "tags",
    "deleted_at",
];

/// 软删除标记字段
pub const DELETED_AT_FIELD: &str = "deleted_at";

/// 单个字段的差异
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    pub field: &'static str,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// 一次写入对应的变更类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteChange {
    /// 软删除：`deleted_at` 从空变为有值，只记录一条 DELETE
    SoftDelete { deleted_at: String },
    /// 普通字段修改（可能为空）
    Fields(Vec<FieldDiff>),
}

/// 跟踪字段的规范化快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSnapshot {
    values: Vec<(&'static str, Option<String>)>,
}

impl TrackedSnapshot {
    pub fn of(letter: &Letter) -> Self {
        let values = TRACKED_FIELDS
            .iter()
            .map(|field| (*field, canonical_value(letter, field)))
            .collect();
        Self { values }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| *name == field)
            .and_then(|(_, value)| value.as_deref())
    }

    /// 紧凑 JSON 形式（CREATE 记录的 new_value）
    pub fn to_json(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(name, value)| {
                let v = value
                    .as_ref()
                    .map(|s| serde_json::Value::String(s.clone()))
                    .unwrap_or(serde_json::Value::Null);
                (name.to_string(), v)
            })
            .collect();
        serde_json::Value::Object(map).to_string()
    }
}

fn canonical_value(letter: &Letter, field: &str) -> Option<String> {
    match field {
        "number" => Some(letter.number.clone()),
        "org" => Some(letter.org.clone()),
        "date" => Some(format_timestamp(&letter.date)),
        "deadline_date" => letter.deadline_date.as_ref().map(format_timestamp),
        "status" => Some(letter.status.as_str().to_string()),
        "owner_id" => letter.owner_id.clone(),
        "letter_type" => letter.letter_type.clone(),
        "priority" => Some(letter.priority.to_string()),
        "content" => letter.content.clone(),
        "answer" => letter.answer.clone(),
        "jira_link" => letter.jira_link.clone(),
        "tags" => Some(serde_json::Value::from(letter.tags.clone()).to_string()),
        "deleted_at" => letter.deleted_at.as_ref().map(format_timestamp),
        _ => None,
    }
}

/// 逐字段比较两个快照
pub fn diff_snapshots(before: &TrackedSnapshot, after: &TrackedSnapshot) -> Vec<FieldDiff> {
    before
        .values
        .iter()
        .zip(after.values.iter())
        .filter(|((_, old), (_, new))| old != new)
        .map(|((field, old), (_, new))| FieldDiff {
            field: *field,
            old_value: old.clone(),
            new_value: new.clone(),
        })
        .collect()
}

/// 判定一次写入的变更类型
pub fn classify_write(before: &Letter, after: &Letter) -> WriteChange {
    if before.deleted_at.is_none() {
        if let Some(deleted_at) = after.deleted_at.as_ref() {
            return WriteChange::SoftDelete {
                deleted_at: format_timestamp(deleted_at),
            };
        }
    }
    WriteChange::Fields(diff_snapshots(
        &TrackedSnapshot::of(before),
        &TrackedSnapshot::of(after),
    ))
}
