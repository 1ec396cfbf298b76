//! 信件表 CRUD 操作
//!
//! 所有改动跟踪字段的写入路径都在这里显式调用 `ChangeLogWriter`：
//! 主写入先完成，变更日志随后尽力写入，失败不回滚主写入。
//!
//! ## 核心方法
//! - `create_letter`: 创建信件（一条 CREATE）
//! - `update_letter`: 部分更新（每个变化字段一条 UPDATE；软删除为一条 DELETE）
//! - `soft_delete_letter` / `hard_delete_letter`: 删除（一条 DELETE）
//! - `set_sheet_row`: 同步簿记（行号缓存与同步时间），不产生变更日志

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::change_log::ChangeLogWriter;
use crate::database::{with_savepoint, LetterDatabase};
use crate::error::{LetterError, LetterResult};
use crate::models::{
    format_timestamp, parse_timestamp, CreateLetterParams, Letter, LetterChanges, LetterStatus,
};

const SELECT_COLUMNS: &str = "id, number, org, date, deadline_date, status, owner_id, letter_type, \
     priority, content, answer, jira_link, tags, sheet_row, last_synced_at, deleted_at, \
     created_at, updated_at";

/// 信件表 Repo
pub struct LetterRepo;

impl LetterRepo {
    // ========================================================================
    // 创建
    // ========================================================================

    /// 创建信件
    pub fn create_letter(
        db: &LetterDatabase,
        params: CreateLetterParams,
        actor_id: Option<&str>,
    ) -> LetterResult<Letter> {
        let conn = db.get_conn()?;
        Self::create_letter_with_conn(&conn, params, actor_id)
    }

    /// 创建信件（使用现有连接）
    pub fn create_letter_with_conn(
        conn: &Connection,
        params: CreateLetterParams,
        actor_id: Option<&str>,
    ) -> LetterResult<Letter> {
        let now = Utc::now();
        let letter = Letter {
            // 表格身份列按去空白后的文本匹配，存储前同样规范化
            id: params
                .id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(Letter::generate_id),
            number: params.number,
            org: params.org,
            date: params.date,
            deadline_date: params.deadline_date,
            status: params.status,
            owner_id: params.owner_id,
            letter_type: params.letter_type,
            priority: params.priority,
            content: params.content,
            answer: params.answer,
            jira_link: params.jira_link,
            tags: params.tags,
            sheet_row: None,
            last_synced_at: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        Self::validate(&letter)?;

        let tags_json = serde_json::to_string(&letter.tags)?;
        conn.execute(
            r#"
            INSERT INTO letters (
                id, number, org, date, deadline_date, status, owner_id, letter_type,
                priority, content, answer, jira_link, tags, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                letter.id,
                letter.number,
                letter.org,
                format_timestamp(&letter.date),
                letter.deadline_date.as_ref().map(format_timestamp),
                letter.status.as_str(),
                letter.owner_id,
                letter.letter_type,
                letter.priority,
                letter.content,
                letter.answer,
                letter.jira_link,
                tags_json,
                format_timestamp(&letter.created_at),
                format_timestamp(&letter.updated_at),
            ],
        )?;

        info!("[LetterRepo] Created letter: {} ({})", letter.id, letter.number);
        ChangeLogWriter::record_create(conn, &letter, actor_id);
        Ok(letter)
    }

    // ========================================================================
    // 更新
    // ========================================================================

    /// 部分更新信件
    ///
    /// 写入后按前后快照差异记录变更日志。
    pub fn update_letter(
        db: &LetterDatabase,
        id: &str,
        changes: LetterChanges,
        actor_id: Option<&str>,
    ) -> LetterResult<Letter> {
        let conn = db.get_conn()?;
        Self::update_letter_with_conn(&conn, id, changes, actor_id)
    }

    pub fn update_letter_with_conn(
        conn: &Connection,
        id: &str,
        changes: LetterChanges,
        actor_id: Option<&str>,
    ) -> LetterResult<Letter> {
        // 前值读取与写入处于同一保存点
        with_savepoint(conn, "update_letter", || {
            let before = Self::get_letter_with_conn(conn, id)?
                .ok_or_else(|| LetterError::letter_not_found(id))?;

            let mut after = before.clone();
            changes.apply_to(&mut after);
            Self::validate(&after)?;
            after.updated_at = Utc::now();

            let tags_json = serde_json::to_string(&after.tags)?;
            conn.execute(
                r#"
                UPDATE letters SET
                    number = ?2, org = ?3, date = ?4, deadline_date = ?5, status = ?6,
                    owner_id = ?7, letter_type = ?8, priority = ?9, content = ?10,
                    answer = ?11, jira_link = ?12, tags = ?13, deleted_at = ?14, updated_at = ?15
                WHERE id = ?1
                "#,
                params![
                    after.id,
                    after.number,
                    after.org,
                    format_timestamp(&after.date),
                    after.deadline_date.as_ref().map(format_timestamp),
                    after.status.as_str(),
                    after.owner_id,
                    after.letter_type,
                    after.priority,
                    after.content,
                    after.answer,
                    after.jira_link,
                    tags_json,
                    after.deleted_at.as_ref().map(format_timestamp),
                    format_timestamp(&after.updated_at),
                ],
            )?;

            debug!("[LetterRepo] Updated letter: {}", after.id);
            ChangeLogWriter::record_update(conn, &before, &after, actor_id);
            Ok(after)
        })
    }

    // ========================================================================
    // 删除
    // ========================================================================

    /// 软删除；已删除的信件原样返回，不再产生记录
    pub fn soft_delete_letter(
        db: &LetterDatabase,
        id: &str,
        actor_id: Option<&str>,
    ) -> LetterResult<Letter> {
        let conn = db.get_conn()?;
        with_savepoint(&conn, "soft_delete_letter", || {
            let current = Self::get_letter_with_conn(&conn, id)?
                .ok_or_else(|| LetterError::letter_not_found(id))?;
            if current.is_deleted() {
                return Ok(current);
            }

            let changes = LetterChanges {
                deleted_at: Some(Some(Utc::now())),
                ..Default::default()
            };
            let letter = Self::update_letter_with_conn(&conn, id, changes, actor_id)?;
            info!("[LetterRepo] Soft-deleted letter: {}", id);
            Ok(letter)
        })
    }

    /// 硬删除
    ///
    /// # Returns
    /// * `Ok(true)` - 已删除
    /// * `Ok(false)` - 信件不存在
    pub fn hard_delete_letter(
        db: &LetterDatabase,
        id: &str,
        actor_id: Option<&str>,
    ) -> LetterResult<bool> {
        let conn = db.get_conn()?;
        let letter_id: Option<String> = conn
            .query_row("SELECT id FROM letters WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(letter_id) = letter_id else {
            return Ok(false);
        };

        conn.execute("DELETE FROM letters WHERE id = ?1", params![letter_id])?;
        info!("[LetterRepo] Hard-deleted letter: {}", letter_id);
        ChangeLogWriter::record_hard_delete(&conn, &letter_id, actor_id);
        Ok(true)
    }

    // ========================================================================
    // 查询
    // ========================================================================

    pub fn get_letter(db: &LetterDatabase, id: &str) -> LetterResult<Option<Letter>> {
        let conn = db.get_conn()?;
        Self::get_letter_with_conn(&conn, id)
    }

    pub fn get_letter_with_conn(conn: &Connection, id: &str) -> LetterResult<Option<Letter>> {
        let sql = format!("SELECT {} FROM letters WHERE id = ?1", SELECT_COLUMNS);
        let letter = conn
            .query_row(&sql, params![id], Self::row_to_letter)
            .optional()?;
        Ok(letter)
    }

    /// 列出信件（按来文日期倒序）
    pub fn list_letters(db: &LetterDatabase, include_deleted: bool) -> LetterResult<Vec<Letter>> {
        let conn = db.get_conn()?;
        let filter = if include_deleted {
            ""
        } else {
            "WHERE deleted_at IS NULL"
        };
        let sql = format!(
            "SELECT {} FROM letters {} ORDER BY date DESC, created_at DESC",
            SELECT_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_letter)?;
        let letters = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(letters)
    }

    // ========================================================================
    // 同步簿记（不产生变更日志）
    // ========================================================================

    /// 回写表格行号与同步时间
    pub fn set_sheet_row(
        conn: &Connection,
        id: &str,
        sheet_row: i64,
        synced_at: &DateTime<Utc>,
    ) -> LetterResult<()> {
        conn.execute(
            "UPDATE letters SET sheet_row = ?2, last_synced_at = ?3 WHERE id = ?1",
            params![id, sheet_row, format_timestamp(synced_at)],
        )?;
        Ok(())
    }

    // ========================================================================
    // 私有辅助
    // ========================================================================

    fn validate(letter: &Letter) -> LetterResult<()> {
        if letter.number.trim().is_empty() {
            return Err(LetterError::InvalidArgument {
                param: "number".to_string(),
                reason: "letter number must not be empty".to_string(),
            });
        }
        if letter.org.trim().is_empty() {
            return Err(LetterError::InvalidArgument {
                param: "org".to_string(),
                reason: "organization must not be empty".to_string(),
            });
        }
        Ok(())
    }

    fn row_to_letter(row: &Row) -> rusqlite::Result<Letter> {
        let status: String = row.get(5)?;
        let tags_raw: String = row.get(12)?;
        let tags: Vec<String> = serde_json::from_str(&tags_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(e))
        })?;

        Ok(Letter {
            id: row.get(0)?,
            number: row.get(1)?,
            org: row.get(2)?,
            date: required_ts(row, 3)?,
            deadline_date: optional_ts(row, 4)?,
            status: LetterStatus::from_str(&status),
            owner_id: row.get(6)?,
            letter_type: row.get(7)?,
            priority: row.get(8)?,
            content: row.get(9)?,
            answer: row.get(10)?,
            jira_link: row.get(11)?,
            tags,
            sheet_row: row.get(13)?,
            last_synced_at: optional_ts(row, 14)?,
            deleted_at: optional_ts(row, 15)?,
            created_at: required_ts(row, 16)?,
            updated_at: required_ts(row, 17)?,
        })
    }
}

fn required_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp: {}", raw).into(),
        )
    })
}

fn optional_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => parse_timestamp(&raw).map(Some).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                format!("invalid timestamp: {}", raw).into(),
            )
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::ChangeLogRepo;
    use crate::models::{ChangeAction, SyncState};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup_test_db() -> (TempDir, LetterDatabase) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = LetterDatabase::new(temp_dir.path()).expect("Failed to create database");
        (temp_dir, db)
    }

    fn params_for(number: &str) -> CreateLetterParams {
        CreateLetterParams {
            number: number.to_string(),
            org: "Городская администрация".to_string(),
            date: Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_letter_records_create() {
        let (_temp_dir, db) = setup_test_db();
        let letter = LetterRepo::create_letter(&db, params_for("15/3"), Some("u9"))
            .expect("Create letter should succeed");

        let loaded = LetterRepo::get_letter(&db, &letter.id).unwrap().unwrap();
        assert_eq!(loaded.number, "15/3");
        assert_eq!(loaded.status, LetterStatus::New);

        let conn = db.get_conn().unwrap();
        let history = ChangeLogRepo::list_for_letter(&conn, &letter.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, ChangeAction::Create);
        assert_eq!(history[0].actor_id.as_deref(), Some("u9"));
        assert_eq!(history[0].sync_status, SyncState::Pending);
    }

    #[test]
    fn test_create_rejects_empty_number() {
        let (_temp_dir, db) = setup_test_db();
        let err = LetterRepo::create_letter(&db, params_for("  "), None).unwrap_err();
        assert!(matches!(err, LetterError::InvalidArgument { ref param, .. } if param == "number"));
    }

    #[test]
    fn test_update_unknown_letter() {
        let (_temp_dir, db) = setup_test_db();
        let err = LetterRepo::update_letter(&db, "missing", LetterChanges::default(), None)
            .unwrap_err();
        assert!(matches!(err, LetterError::NotFound { .. }));
    }

    #[test]
    fn test_update_without_changes_records_nothing() {
        let (_temp_dir, db) = setup_test_db();
        let letter = LetterRepo::create_letter(&db, params_for("1"), None).unwrap();
        LetterRepo::update_letter(
            &db,
            &letter.id,
            LetterChanges {
                number: Some("1".into()),
                ..Default::default()
            },
            None,
        )
        .unwrap();

        let conn = db.get_conn().unwrap();
        assert_eq!(ChangeLogRepo::list_for_letter(&conn, &letter.id).unwrap().len(), 1);
    }

    #[test]
    fn test_update_old_value_follows_concurrent_writer() {
        let (_temp_dir, db) = setup_test_db();
        let letter = LetterRepo::create_letter(&db, params_for("6"), None).unwrap();
        let id = letter.id.clone();

        let writer = db.get_conn().unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();
        LetterRepo::update_letter_with_conn(
            &writer,
            &id,
            LetterChanges {
                priority: Some(1),
                ..Default::default()
            },
            None,
        )
        .unwrap();

        std::thread::scope(|s| {
            let other = s.spawn(|| {
                LetterRepo::update_letter(
                    &db,
                    &id,
                    LetterChanges {
                        priority: Some(2),
                        ..Default::default()
                    },
                    None,
                )
            });
            std::thread::sleep(std::time::Duration::from_millis(100));
            writer.execute_batch("COMMIT").unwrap();
            // 另一写入者要么在提交后基于新值写入，要么整体失败
            let _ = other.join().unwrap();
        });

        let conn = db.get_conn().unwrap();
        let priority_updates: Vec<_> = ChangeLogRepo::list_for_letter(&conn, &id)
            .unwrap()
            .into_iter()
            .filter(|r| r.field_name.as_deref() == Some("priority"))
            .collect();
        assert!(!priority_updates.is_empty());
        for pair in priority_updates.windows(2) {
            assert_eq!(pair[1].old_value, pair[0].new_value);
        }

        let stored = LetterRepo::get_letter(&db, &id).unwrap().unwrap();
        let last = priority_updates.last().unwrap();
        assert_eq!(last.new_value.as_deref(), Some(stored.priority.to_string().as_str()));
    }

    #[test]
    fn test_sheet_row_bookkeeping_records_nothing() {
        let (_temp_dir, db) = setup_test_db();
        let letter = LetterRepo::create_letter(&db, params_for("2"), None).unwrap();
        let conn = db.get_conn().unwrap();
        LetterRepo::set_sheet_row(&conn, &letter.id, 12, &Utc::now()).unwrap();

        let loaded = LetterRepo::get_letter(&db, &letter.id).unwrap().unwrap();
        assert_eq!(loaded.sheet_row, Some(12));
        assert!(loaded.last_synced_at.is_some());
        assert_eq!(ChangeLogRepo::list_for_letter(&conn, &letter.id).unwrap().len(), 1);
    }

    #[test]
    fn test_hard_delete() {
        let (_temp_dir, db) = setup_test_db();
        let letter = LetterRepo::create_letter(&db, params_for("3"), None).unwrap();

        assert!(LetterRepo::hard_delete_letter(&db, &letter.id, None).unwrap());
        assert!(!LetterRepo::hard_delete_letter(&db, &letter.id, None).unwrap());
        assert!(LetterRepo::get_letter(&db, &letter.id).unwrap().is_none());

        let conn = db.get_conn().unwrap();
        let history = ChangeLogRepo::list_for_letter(&conn, &letter.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].action, ChangeAction::Delete);
    }

    #[test]
    fn test_list_excludes_soft_deleted() {
        let (_temp_dir, db) = setup_test_db();
        let keep = LetterRepo::create_letter(&db, params_for("4"), None).unwrap();
        let gone = LetterRepo::create_letter(&db, params_for("5"), None).unwrap();
        LetterRepo::soft_delete_letter(&db, &gone.id, None).unwrap();

        let active = LetterRepo::list_letters(&db, false).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep.id);
        assert_eq!(LetterRepo::list_letters(&db, true).unwrap().len(), 2);
    }
}
