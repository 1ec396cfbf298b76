//! 进程内表格实现
//!
//! 行为与 Google 实现保持一致：第 1 行为表头，追加写到最后一个非空行之后。
//! 可按操作类型注入故障，并记录调用次数，供同步流程测试断言。

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::layout::{column_index, COLUMNS};
use super::{AppendOutcome, RowUpdate, SheetStore};
use crate::error::{SheetError, SheetResult};

/// 进程内表格
pub struct MemorySheetStore {
    /// `rows[i]` 对应第 `i + 1` 行
    rows: Mutex<Vec<Vec<String>>>,
    formatted: Mutex<Vec<(i64, i64, usize)>>,
    fail_reads: AtomicBool,
    fail_updates: AtomicBool,
    fail_appends: AtomicBool,
    fail_formats: AtomicBool,
    read_calls: AtomicUsize,
    update_calls: AtomicUsize,
    append_calls: AtomicUsize,
}

impl Default for MemorySheetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySheetStore {
    /// 只有表头的空表
    pub fn new() -> Self {
        let header = COLUMNS.iter().map(|c| c.to_string()).collect();
        Self::with_rows(vec![header])
    }

    /// 以给定内容初始化（包含表头行）
    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        Self {
            rows: Mutex::new(rows),
            formatted: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            fail_appends: AtomicBool::new(false),
            fail_formats: AtomicBool::new(false),
            read_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            append_calls: AtomicUsize::new(0),
        }
    }

    fn lock_rows(&self) -> SheetResult<MutexGuard<'_, Vec<Vec<String>>>> {
        self.rows
            .lock()
            .map_err(|e| SheetError::Other(format!("sheet lock poisoned: {e}")))
    }

    // ========================================================================
    // 故障注入
    // ========================================================================

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_formats(&self, fail: bool) {
        self.fail_formats.store(fail, Ordering::SeqCst);
    }

    // ========================================================================
    // 观察
    // ========================================================================

    /// 全表快照（含表头）
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// 第 `row` 行（从 1 开始）
    pub fn row(&self, row: i64) -> Option<Vec<String>> {
        if row < 1 {
            return None;
        }
        self.rows
            .lock()
            .ok()
            .and_then(|r| r.get((row - 1) as usize).cloned())
    }

    /// 已执行的格式复制：(源行, 起始行, 行数)
    pub fn formatted_ranges(&self) -> Vec<(i64, i64, usize)> {
        self.formatted.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }
}

fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

#[async_trait]
impl SheetStore for MemorySheetStore {
    fn provider_name(&self) -> &'static str {
        "memory"
    }

    async fn read_column(&self, column: &str, start_row: i64) -> SheetResult<Vec<String>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SheetError::Other("injected read failure".to_string()));
        }
        let col = column_index(column)
            .ok_or_else(|| SheetError::Other(format!("invalid column '{column}'")))?;
        let skip = (start_row.max(1) - 1) as usize;

        let rows = self.lock_rows()?;
        let mut cells: Vec<String> = rows
            .iter()
            .skip(skip)
            .map(|r| r.get(col).cloned().unwrap_or_default())
            .collect();
        // 与远端一致：不返回末尾空单元格
        while cells.last().map_or(false, |c| c.is_empty()) {
            cells.pop();
        }
        Ok(cells)
    }

    async fn batch_update(&self, updates: &[RowUpdate]) -> SheetResult<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(SheetError::Other("injected update failure".to_string()));
        }
        let mut rows = self.lock_rows()?;
        for update in updates {
            if update.row < 1 {
                return Err(SheetError::Other(format!("invalid row {}", update.row)));
            }
            let idx = (update.row - 1) as usize;
            if rows.len() <= idx {
                rows.resize(idx + 1, Vec::new());
            }
            rows[idx] = update.values.clone();
        }
        Ok(())
    }

    async fn append_rows(&self, new_rows: &[Vec<String>]) -> SheetResult<AppendOutcome> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(SheetError::Other("injected append failure".to_string()));
        }
        if new_rows.is_empty() {
            return Err(SheetError::Other("append called with no rows".to_string()));
        }
        let mut rows = self.lock_rows()?;
        while rows.last().map_or(false, |r| is_blank_row(r)) {
            rows.pop();
        }
        let start_row = rows.len() as i64 + 1;
        rows.extend(new_rows.iter().cloned());
        Ok(AppendOutcome {
            start_row,
            row_count: new_rows.len(),
        })
    }

    async fn copy_row_format(
        &self,
        source_row: i64,
        start_row: i64,
        count: usize,
    ) -> SheetResult<()> {
        if self.fail_formats.load(Ordering::SeqCst) {
            return Err(SheetError::Other("injected format failure".to_string()));
        }
        self.formatted
            .lock()
            .map_err(|e| SheetError::Other(format!("format lock poisoned: {e}")))?
            .push((source_row, start_row, count));
        Ok(())
    }
}
