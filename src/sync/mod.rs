//! 变更日志 → 远程表格同步
//!
//! 单次批次流程：
//! 1. 取出最多 N 条待同步记录（PENDING / 未达上限的 FAILED，旧的优先）
//! 2. 按信件分组，同一信件的多条记录合并为一次整行写入（以当前状态为准）
//! 3. 读取一次远程身份列，建立 ID → 行号索引
//! 4. 逐封信件重新加载并渲染，决定原地更新或追加
//! 5. 所有更新合并为一次批量写入，所有新行合并为一次追加
//! 6. 回写新行号与同步时间，标记记录为 SYNCED
//!
//! 单封信件的错误只影响该信件的记录；远程读写失败结束整个批次，
//! 未处理的记录保持原状态，不消耗重试次数。

pub mod scheduler;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::change_log::ChangeLogRepo;
use crate::config::{AppConfig, DEFAULT_MAX_RETRIES};
use crate::database::LetterDatabase;
use crate::error::{LetterResult, SyncError};
use crate::letter_repo::LetterRepo;
use crate::models::{ChangeLogRecord, SyncRunResult, SyncStatusSummary};
use crate::sheets::{
    create_store, render_letter_row, RowIndex, RowUpdate, SheetStore, DATA_START_ROW, ID_COLUMN,
};

pub use scheduler::SyncScheduler;

/// 同步参数
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// 默认批次大小（定时任务使用）
    pub batch_size: usize,
    /// 单条记录重试上限
    pub max_retries: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// 同一信件的一组待同步记录
#[derive(Debug, Clone)]
struct LetterGroup {
    letter_id: String,
    record_ids: Vec<String>,
}

/// 已渲染、等待写入的一行
#[derive(Debug)]
struct PendingWrite {
    group: LetterGroup,
    values: Vec<String>,
    /// `Some` 为原地更新，`None` 为追加
    row: Option<i64>,
}

/// 变更日志到远程表格的同步器
pub struct SheetReconciler {
    db: Arc<LetterDatabase>,
    store: Option<Arc<dyn SheetStore>>,
    options: SyncOptions,
    config_error: Option<String>,
}

impl SheetReconciler {
    pub fn new(
        db: Arc<LetterDatabase>,
        store: Option<Arc<dyn SheetStore>>,
        options: SyncOptions,
    ) -> Self {
        Self {
            db,
            store,
            options,
            config_error: None,
        }
    }

    /// 按应用配置构建；凭据缺失时仍返回实例，每次批次报告配置错误
    pub fn from_config(db: Arc<LetterDatabase>, config: &AppConfig) -> Self {
        let options = SyncOptions {
            batch_size: config.sync.batch_size,
            max_retries: config.sync.max_retries,
        };
        match create_store(&config.sheets) {
            Ok(store) => {
                info!(
                    "[SheetSync] using {} store for sheet '{}'",
                    store.provider_name(),
                    config.sheets.sheet_name
                );
                Self::new(db, Some(store), options)
            }
            Err(e) => {
                warn!("[SheetSync] remote store unavailable: {}", e);
                let mut reconciler = Self::new(db, None, options);
                reconciler.config_error = Some(e.to_string());
                reconciler
            }
        }
    }

    /// 启动时探测远程表格是否可达
    pub async fn check_connection(&self) -> Result<(), SyncError> {
        let store = self.store()?;
        store.check_connection().await?;
        debug!("[SheetSync] {} store reachable", store.provider_name());
        Ok(())
    }

    /// 当前同步状态汇总
    pub fn status(&self) -> LetterResult<SyncStatusSummary> {
        let conn = self.db.get_conn()?;
        ChangeLogRepo::summary(&conn, self.options.max_retries)
    }

    /// 运维操作：让已达重试上限的记录重新进入批次
    pub fn requeue_exhausted(&self) -> LetterResult<usize> {
        let conn = self.db.get_conn()?;
        let count = ChangeLogRepo::requeue_exhausted(&conn, self.options.max_retries)?;
        if count > 0 {
            info!("[SheetSync] requeued {} exhausted change records", count);
        }
        Ok(count)
    }

    /// 执行一次同步批次
    ///
    /// 不返回错误：所有错误折叠进 `SyncRunResult::errors`。
    pub async fn run_batch(&self, limit: usize) -> SyncRunResult {
        let mut result = SyncRunResult::default();
        if let Err(e) = self.reconcile(limit, &mut result).await {
            match e {
                SyncError::Configuration(_) => warn!("[SheetSync] skipped: {}", e),
                _ => warn!("[SheetSync] pass aborted: {}", e),
            }
            result.errors.push(e.to_string());
        }

        if result.is_noop() {
            debug!("[SheetSync] nothing to sync");
        } else {
            info!(
                "[SheetSync] processed={} synced={} failed={} errors={}",
                result.processed,
                result.synced,
                result.failed,
                result.errors.len()
            );
        }
        result
    }

    fn store(&self) -> Result<&Arc<dyn SheetStore>, SyncError> {
        self.store.as_ref().ok_or_else(|| {
            SyncError::Configuration(
                self.config_error
                    .clone()
                    .unwrap_or_else(|| "remote sheet store is not configured".to_string()),
            )
        })
    }

    async fn reconcile(&self, limit: usize, result: &mut SyncRunResult) -> Result<(), SyncError> {
        let store = self.store()?;
        if limit == 0 {
            return Ok(());
        }

        let records = {
            let conn = self.db.get_conn()?;
            ChangeLogRepo::fetch_pending_batch(&conn, limit, self.options.max_retries)?
        };
        result.processed = records.len();
        if records.is_empty() {
            return Ok(());
        }

        let groups = group_by_letter(&records);
        debug!(
            "[SheetSync] {} records across {} letters",
            records.len(),
            groups.len()
        );

        let cells = store.read_column(ID_COLUMN, DATA_START_ROW).await?;
        let mut index = RowIndex::from_column(&cells, DATA_START_ROW);

        let writes = self.plan_writes(groups, &mut index, result)?;
        let (updates, appends): (Vec<PendingWrite>, Vec<PendingWrite>) =
            writes.into_iter().partition(|w| w.row.is_some());

        if !updates.is_empty() {
            let requests: Vec<RowUpdate> = updates
                .iter()
                .filter_map(|w| {
                    w.row.map(|row| RowUpdate {
                        row,
                        values: w.values.clone(),
                    })
                })
                .collect();
            store.batch_update(&requests).await?;

            let now = Utc::now();
            for write in &updates {
                if let Some(row) = write.row {
                    self.finish_write(&write.group, row, &now, result)?;
                }
            }
        }

        if !appends.is_empty() {
            let rows: Vec<Vec<String>> = appends.iter().map(|w| w.values.clone()).collect();
            let outcome = store.append_rows(&rows).await?;
            if outcome.start_row < DATA_START_ROW {
                return Err(SyncError::Batch(format!(
                    "append landed at row {} above the data area",
                    outcome.start_row
                )));
            }

            let now = Utc::now();
            for (offset, write) in appends.iter().enumerate() {
                let row = outcome.start_row + offset as i64;
                self.finish_write(&write.group, row, &now, result)?;
            }

            if outcome.start_row != DATA_START_ROW {
                if let Err(e) = store
                    .copy_row_format(DATA_START_ROW, outcome.start_row, appends.len())
                    .await
                {
                    warn!(
                        "[SheetSync] failed to copy row format to rows {}..{}: {}",
                        outcome.start_row,
                        outcome.start_row + appends.len() as i64 - 1,
                        e
                    );
                }
            }
        }

        Ok(())
    }

    /// 逐封信件加载并渲染，决定更新或追加
    ///
    /// 已不存在的信件直接标记为已同步；加载失败只影响该信件。
    fn plan_writes(
        &self,
        groups: Vec<LetterGroup>,
        index: &mut RowIndex,
        result: &mut SyncRunResult,
    ) -> Result<Vec<PendingWrite>, SyncError> {
        let conn = self.db.get_conn()?;
        let mut writes = Vec::with_capacity(groups.len());

        for group in groups {
            let letter = match LetterRepo::get_letter_with_conn(&conn, &group.letter_id) {
                Ok(Some(letter)) => letter,
                Ok(None) => {
                    debug!(
                        "[SheetSync] letter {} no longer exists, marking {} records synced",
                        group.letter_id,
                        group.record_ids.len()
                    );
                    ChangeLogRepo::mark_synced(&conn, &group.record_ids)?;
                    result.synced += group.record_ids.len();
                    continue;
                }
                Err(e) => {
                    let err = SyncError::Letter {
                        letter_id: group.letter_id.clone(),
                        message: e.to_string(),
                    };
                    Self::fail_group(&conn, &group, &err, result)?;
                    continue;
                }
            };

            let values = render_letter_row(&letter);
            let row = match index.row_of(&letter.id) {
                Some(row) => Some(row),
                None => letter
                    .sheet_row
                    .filter(|cached| index.cached_row_usable(&letter.id, *cached)),
            };
            if let Some(row) = row {
                // 占位，防止另一封信件的过期缓存指向同一行
                index.insert(&letter.id, row);
            } else if let Some(stale) = letter.sheet_row {
                debug!(
                    "[SheetSync] cached row {} for letter {} is taken, appending",
                    stale, letter.id
                );
            }

            writes.push(PendingWrite { group, values, row });
        }

        Ok(writes)
    }

    /// 写入成功后回写行号并标记记录
    fn finish_write(
        &self,
        group: &LetterGroup,
        row: i64,
        synced_at: &DateTime<Utc>,
        result: &mut SyncRunResult,
    ) -> Result<(), SyncError> {
        let conn = self.db.get_conn()?;
        let bookkeeping = LetterRepo::set_sheet_row(&conn, &group.letter_id, row, synced_at)
            .and_then(|_| ChangeLogRepo::mark_synced(&conn, &group.record_ids));

        match bookkeeping {
            Ok(_) => {
                result.synced += group.record_ids.len();
                Ok(())
            }
            Err(e) => {
                let err = SyncError::Letter {
                    letter_id: group.letter_id.clone(),
                    message: e.to_string(),
                };
                Self::fail_group(&conn, group, &err, result)
            }
        }
    }

    fn fail_group(
        conn: &Connection,
        group: &LetterGroup,
        err: &SyncError,
        result: &mut SyncRunResult,
    ) -> Result<(), SyncError> {
        warn!("[SheetSync] {}", err);
        let message = err.to_string();
        ChangeLogRepo::mark_failed(conn, &group.record_ids, &message)?;
        result.failed += group.record_ids.len();
        result.errors.push(message);
        Ok(())
    }
}

/// 按信件分组，保持首次出现的顺序
fn group_by_letter(records: &[ChangeLogRecord]) -> Vec<LetterGroup> {
    let mut groups: Vec<LetterGroup> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for record in records {
        match positions.get(record.letter_id.as_str()) {
            Some(&pos) => groups[pos].record_ids.push(record.id.clone()),
            None => {
                positions.insert(record.letter_id.as_str(), groups.len());
                groups.push(LetterGroup {
                    letter_id: record.letter_id.clone(),
                    record_ids: vec![record.id.clone()],
                });
            }
        }
    }
    groups
}
