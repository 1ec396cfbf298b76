//! 表格布局：列定义、信件到行的渲染、A1 区间工具

use std::collections::HashMap;

use crate::models::{format_timestamp, Letter};

/// 表头所在行
pub const HEADER_ROW: i64 = 1;

/// 数据起始行（同时作为新行的格式模板行）
pub const DATA_START_ROW: i64 = 2;

/// 身份列（信件 ID）
pub const ID_COLUMN: &str = "A";

/// 固定列顺序
pub const COLUMNS: &[&str] = &[
    "ID",
    "Number",
    "Organization",
    "Date",
    "Deadline",
    "Status",
    "Owner",
    "Type",
    "Priority",
    "Content",
    "Answer",
    "Jira",
    "Tags",
    "Updated",
];

/// 软删除信件在状态列中的显示
pub const DELETED_STATUS: &str = "DELETED";

/// 单元格最大字符数（Google Sheets 限制为 50000）
const MAX_CELL_CHARS: usize = 50_000;

/// 列序号（从 0 开始）转列字母：0 → A，25 → Z，26 → AA
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// 列字母转列序号（从 0 开始）
pub fn column_index(letter: &str) -> Option<usize> {
    if letter.is_empty() {
        return None;
    }
    let mut n = 0usize;
    for c in letter.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        n = n * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(n - 1)
}

/// 最后一列字母
pub fn last_column() -> String {
    column_letter(COLUMNS.len() - 1)
}

/// 工作表名称转 A1 前缀，必要时加引号
pub fn quote_sheet_name(sheet: &str) -> String {
    if !sheet.is_empty() && sheet.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        sheet.to_string()
    } else {
        format!("'{}'", sheet.replace('\'', "''"))
    }
}

/// 单行完整区间，如 `Letters!A5:N5`
pub fn row_range(sheet: &str, row: i64) -> String {
    format!(
        "{}!A{}:{}{}",
        quote_sheet_name(sheet),
        row,
        last_column(),
        row
    )
}

/// 整表列区间，如 `Letters!A:N`（追加使用）
pub fn table_range(sheet: &str) -> String {
    format!("{}!A:{}", quote_sheet_name(sheet), last_column())
}

/// 单列从 `start_row` 开始的区间，如 `Letters!A2:A`
pub fn column_range(sheet: &str, column: &str, start_row: i64) -> String {
    format!(
        "{}!{}{}:{}",
        quote_sheet_name(sheet),
        column,
        start_row,
        column
    )
}

/// 从 A1 区间解析起始行：`Letters!A5:N7` → 5
pub fn parse_start_row(range: &str) -> Option<i64> {
    let cells = range.rsplit('!').next()?;
    let first = cells.split(':').next()?;
    let digits: String = first
        .chars()
        .skip_while(|c| c.is_ascii_alphabetic() || *c == '$')
        .filter(|c| *c != '$')
        .collect();
    digits.parse::<i64>().ok().filter(|row| *row > 0)
}

fn truncate_cell(value: &str) -> String {
    if value.chars().count() > MAX_CELL_CHARS {
        value.chars().take(MAX_CELL_CHARS).collect()
    } else {
        value.to_string()
    }
}

/// 把信件渲染为固定宽度的一行（与 `COLUMNS` 一一对应）
pub fn render_letter_row(letter: &Letter) -> Vec<String> {
    let status = if letter.is_deleted() {
        DELETED_STATUS.to_string()
    } else {
        letter.status.as_str().to_string()
    };

    vec![
        letter.id.clone(),
        letter.number.clone(),
        letter.org.clone(),
        letter.date.format("%Y-%m-%d").to_string(),
        letter
            .deadline_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        status,
        letter.owner_id.clone().unwrap_or_default(),
        letter.letter_type.clone().unwrap_or_default(),
        letter.priority.to_string(),
        truncate_cell(letter.content.as_deref().unwrap_or_default()),
        truncate_cell(letter.answer.as_deref().unwrap_or_default()),
        letter.jira_link.clone().unwrap_or_default(),
        letter.tags.join(", "),
        format_timestamp(&letter.updated_at),
    ]
}

/// 远程身份列索引：ID ↔ 行号
///
/// 每个批次重建一次。重复 ID 以最靠上的行为准。
#[derive(Debug, Clone, Default)]
pub struct RowIndex {
    by_id: HashMap<String, i64>,
    by_row: HashMap<i64, String>,
}

impl RowIndex {
    /// `cells[i]` 对应第 `start_row + i` 行
    pub fn from_column(cells: &[String], start_row: i64) -> Self {
        let mut index = Self::default();
        for (offset, cell) in cells.iter().enumerate() {
            let id = cell.trim();
            if id.is_empty() {
                continue;
            }
            let row = start_row + offset as i64;
            index.by_row.insert(row, id.to_string());
            index.by_id.entry(id.to_string()).or_insert(row);
        }
        index
    }

    pub fn row_of(&self, id: &str) -> Option<i64> {
        self.by_id.get(id).copied()
    }

    pub fn id_at(&self, row: i64) -> Option<&str> {
        self.by_row.get(&row).map(String::as_str)
    }

    /// 缓存行号是否仍可用：该行为空或仍是同一封信件
    pub fn cached_row_usable(&self, id: &str, row: i64) -> bool {
        row >= DATA_START_ROW && self.id_at(row).map_or(true, |existing| existing == id)
    }

    pub fn insert(&mut self, id: &str, row: i64) {
        self.by_row.insert(row, id.to_string());
        self.by_id.entry(id.to_string()).or_insert(row);
    }
}
