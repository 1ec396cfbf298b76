//! # Change Log 模块
//!
//! 信件变更日志：每次写入跟踪字段时追加记录，供表格同步批次消费。
//!
//! ## 设计原则
//!
//! 1. **只追加**：记录创建后只更新同步状态字段，从不删除
//! 2. **字段级**：一次写入中每个变化的字段对应一条 UPDATE
//! 3. **尽力而为**：写日志失败不影响主写入，只记 warn
//! 4. **触发器而非回放**：同步时只看信件当前状态，日志只用来找出需要同步的信件
//!
//! ## 状态机
//!
//! `PENDING → SYNCED`、`PENDING → FAILED(retry+1)`、`FAILED → FAILED|SYNCED`，
//! `retry_count` 达到上限后不再进入批次（保留用于审计）。

pub mod diff;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::database::with_savepoint;
use crate::error::LetterResult;
use crate::models::{now_timestamp, ChangeAction, ChangeLogRecord, Letter, SyncState, SyncStatusSummary};

pub use diff::{classify_write, diff_snapshots, FieldDiff, TrackedSnapshot, WriteChange, TRACKED_FIELDS};

/// `last_error` 最大保留字符数
const MAX_ERROR_CHARS: usize = 1000;

/// 待写入的变更日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChange {
    pub letter_id: String,
    pub action: ChangeAction,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub actor_id: Option<String>,
}

/// 变更日志仓库
pub struct ChangeLogRepo;

impl ChangeLogRepo {
    const SELECT_COLUMNS: &'static str = "id, letter_id, action, field_name, old_value, new_value, \
         actor_id, sync_status, retry_count, last_error, created_at, synced_at";

    /// 批量追加（同一保存点内，全部成功或全部回滚）
    pub fn append_all(conn: &Connection, changes: &[NewChange]) -> LetterResult<Vec<String>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        with_savepoint(conn, "append_changes", || {
            let mut stmt = conn.prepare_cached(
                r#"
                INSERT INTO letter_changes (
                    id, letter_id, action, field_name, old_value, new_value,
                    actor_id, sync_status, retry_count, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', 0, ?8)
                "#,
            )?;
            let now = now_timestamp();
            let mut ids = Vec::with_capacity(changes.len());
            for change in changes {
                let id = uuid::Uuid::new_v4().to_string();
                stmt.execute(params![
                    id,
                    change.letter_id,
                    change.action.as_str(),
                    change.field_name,
                    change.old_value,
                    change.new_value,
                    change.actor_id,
                    now,
                ])?;
                ids.push(id);
            }
            Ok(ids)
        })
    }

    /// 取出一批待同步记录
    ///
    /// `PENDING` 或 `FAILED` 且 `retry_count < max_retries`，按创建时间从旧到新。
    pub fn fetch_pending_batch(
        conn: &Connection,
        limit: usize,
        max_retries: u32,
    ) -> LetterResult<Vec<ChangeLogRecord>> {
        let sql = format!(
            "SELECT {} FROM letter_changes
             WHERE sync_status IN ('PENDING', 'FAILED') AND retry_count < ?1
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2",
            Self::SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![max_retries, limit as i64], Self::row_to_record)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// 标记为已同步
    pub fn mark_synced(conn: &Connection, ids: &[String]) -> LetterResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        with_savepoint(conn, "mark_synced", || {
            let mut stmt = conn.prepare_cached(
                "UPDATE letter_changes
                 SET sync_status = 'SYNCED', synced_at = ?2, last_error = NULL
                 WHERE id = ?1",
            )?;
            let now = now_timestamp();
            let mut updated = 0;
            for id in ids {
                updated += stmt.execute(params![id, now])?;
            }
            Ok(updated)
        })
    }

    /// 标记为失败：重试次数 +1 并记录错误信息
    pub fn mark_failed(conn: &Connection, ids: &[String], error: &str) -> LetterResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let error: String = error.chars().take(MAX_ERROR_CHARS).collect();
        with_savepoint(conn, "mark_failed", || {
            let mut stmt = conn.prepare_cached(
                "UPDATE letter_changes
                 SET sync_status = 'FAILED', retry_count = retry_count + 1, last_error = ?2
                 WHERE id = ?1",
            )?;
            let mut updated = 0;
            for id in ids {
                updated += stmt.execute(params![id, error])?;
            }
            Ok(updated)
        })
    }

    /// 状态汇总
    pub fn summary(conn: &Connection, max_retries: u32) -> LetterResult<SyncStatusSummary> {
        let summary = conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN sync_status = 'PENDING' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'FAILED' AND retry_count < ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'FAILED' AND retry_count >= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'SYNCED' THEN 1 ELSE 0 END), 0),
                COUNT(*),
                MAX(synced_at)
            FROM letter_changes
            "#,
            params![max_retries],
            |row| {
                Ok(SyncStatusSummary {
                    pending: row.get::<_, i64>(0)? as u64,
                    failed: row.get::<_, i64>(1)? as u64,
                    exhausted: row.get::<_, i64>(2)? as u64,
                    synced: row.get::<_, i64>(3)? as u64,
                    total: row.get::<_, i64>(4)? as u64,
                    last_synced_at: row.get(5)?,
                })
            },
        )?;
        Ok(summary)
    }

    /// 某封信件的变更历史（从旧到新）
    pub fn list_for_letter(conn: &Connection, letter_id: &str) -> LetterResult<Vec<ChangeLogRecord>> {
        let sql = format!(
            "SELECT {} FROM letter_changes WHERE letter_id = ?1 ORDER BY created_at ASC, rowid ASC",
            Self::SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![letter_id], Self::row_to_record)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn find_by_id(conn: &Connection, id: &str) -> LetterResult<Option<ChangeLogRecord>> {
        let sql = format!(
            "SELECT {} FROM letter_changes WHERE id = ?1",
            Self::SELECT_COLUMNS
        );
        let record = conn
            .query_row(&sql, params![id], Self::row_to_record)
            .optional()?;
        Ok(record)
    }

    /// 运维手动干预：把已达重试上限的记录重新放回批次
    ///
    /// 同步器从不自动调用。
    pub fn requeue_exhausted(conn: &Connection, max_retries: u32) -> LetterResult<usize> {
        let updated = conn.execute(
            "UPDATE letter_changes SET retry_count = 0
             WHERE sync_status = 'FAILED' AND retry_count >= ?1",
            params![max_retries],
        )?;
        if updated > 0 {
            debug!("[ChangeLog] Requeued {} exhausted record(s)", updated);
        }
        Ok(updated)
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<ChangeLogRecord> {
        let action: String = row.get(2)?;
        let status: String = row.get(7)?;
        Ok(ChangeLogRecord {
            id: row.get(0)?,
            letter_id: row.get(1)?,
            action: ChangeAction::from_str(&action),
            field_name: row.get(3)?,
            old_value: row.get(4)?,
            new_value: row.get(5)?,
            actor_id: row.get(6)?,
            sync_status: SyncState::from_str(&status),
            retry_count: row.get::<_, i64>(8)?.max(0) as u32,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
            synced_at: row.get(11)?,
        })
    }
}

/// 变更日志写入器
///
/// 所有入口都是"发出即忘"：失败只记 warn，不向调用方传播。
/// 返回值是写入条数，仅用于诊断与测试。
pub struct ChangeLogWriter;

impl ChangeLogWriter {
    /// 创建：一条 CREATE，new_value 为跟踪字段快照
    pub fn record_create(conn: &Connection, letter: &Letter, actor_id: Option<&str>) -> usize {
        let change = NewChange {
            letter_id: letter.id.clone(),
            action: ChangeAction::Create,
            field_name: None,
            old_value: None,
            new_value: Some(TrackedSnapshot::of(letter).to_json()),
            actor_id: actor_id.map(str::to_string),
        };
        Self::write(conn, &letter.id, &[change])
    }

    /// 更新：软删除时一条 DELETE，否则每个变化字段一条 UPDATE
    pub fn record_update(
        conn: &Connection,
        before: &Letter,
        after: &Letter,
        actor_id: Option<&str>,
    ) -> usize {
        let actor = actor_id.map(str::to_string);
        let changes: Vec<NewChange> = match classify_write(before, after) {
            WriteChange::SoftDelete { deleted_at } => vec![NewChange {
                letter_id: after.id.clone(),
                action: ChangeAction::Delete,
                field_name: None,
                old_value: None,
                new_value: Some(deleted_at),
                actor_id: actor,
            }],
            WriteChange::Fields(diffs) => diffs
                .into_iter()
                .map(|d| NewChange {
                    letter_id: after.id.clone(),
                    action: ChangeAction::Update,
                    field_name: Some(d.field.to_string()),
                    old_value: d.old_value,
                    new_value: d.new_value,
                    actor_id: actor.clone(),
                })
                .collect(),
        };
        Self::write(conn, &after.id, &changes)
    }

    /// 硬删除：一条 DELETE，以删除前取得的 ID 为键
    pub fn record_hard_delete(conn: &Connection, letter_id: &str, actor_id: Option<&str>) -> usize {
        let change = NewChange {
            letter_id: letter_id.to_string(),
            action: ChangeAction::Delete,
            field_name: None,
            old_value: None,
            new_value: None,
            actor_id: actor_id.map(str::to_string),
        };
        Self::write(conn, letter_id, &[change])
    }

    fn write(conn: &Connection, letter_id: &str, changes: &[NewChange]) -> usize {
        if changes.is_empty() {
            return 0;
        }
        match ChangeLogRepo::append_all(conn, changes) {
            Ok(ids) => {
                debug!(
                    "[ChangeLog] Recorded {} change(s) for letter {}",
                    ids.len(),
                    letter_id
                );
                ids.len()
            }
            Err(e) => {
                warn!(
                    "[ChangeLog] Failed to record changes for letter {} (ignored): {}",
                    letter_id, e
                );
                0
            }
        }
    }
}
