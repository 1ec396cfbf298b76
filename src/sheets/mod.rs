//! 远程表格模块
//!
//! 提供统一的表格访问层，同步器只依赖 `SheetStore` trait。
//!
//! ## 支持的后端
//! - **Google**: Google Sheets v4 REST（reqwest）
//! - **Memory**: 进程内表格，用于演练和测试
//!
//! ## 使用示例
//! ```rust,ignore
//! use letter_sync_lib::sheets::create_store;
//!
//! let store = create_store(&config.sheets)?;
//! let ids = store.read_column(ID_COLUMN, DATA_START_ROW).await?;
//! ```

pub mod google;
pub mod layout;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{SheetProvider, SheetsConfig};
use crate::error::{SheetError, SheetResult};

pub use google::GoogleSheetsStore;
pub use layout::{render_letter_row, RowIndex, DATA_START_ROW, HEADER_ROW, ID_COLUMN};
pub use memory::MemorySheetStore;

/// 单行原地更新
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpdate {
    /// 行号（从 1 开始）
    pub row: i64,
    pub values: Vec<String>,
}

/// 追加结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendOutcome {
    /// 追加块的起始行号
    pub start_row: i64,
    pub row_count: usize,
}

/// 统一的表格访问 trait
#[async_trait]
pub trait SheetStore: Send + Sync {
    /// 后端名称（用于日志）
    fn provider_name(&self) -> &'static str;

    /// 读取某一列从 `start_row` 开始的所有单元格
    ///
    /// 返回值第 `i` 项对应第 `start_row + i` 行，空单元格为空字符串。
    async fn read_column(&self, column: &str, start_row: i64) -> SheetResult<Vec<String>>;

    /// 一次请求写入多个整行区间
    async fn batch_update(&self, updates: &[RowUpdate]) -> SheetResult<()>;

    /// 在表格末尾追加若干行
    async fn append_rows(&self, rows: &[Vec<String>]) -> SheetResult<AppendOutcome>;

    /// 把 `source_row` 的格式/校验复制到 `[start_row, start_row + count)`
    async fn copy_row_format(&self, source_row: i64, start_row: i64, count: usize)
        -> SheetResult<()>;

    /// 检查连接是否可用
    async fn check_connection(&self) -> SheetResult<()> {
        self.read_column(ID_COLUMN, HEADER_ROW).await.map(|_| ())
    }
}

/// 根据配置创建表格实例
///
/// 凭据缺失时返回 `SheetError::Config`。
pub fn create_store(config: &SheetsConfig) -> SheetResult<Arc<dyn SheetStore>> {
    let missing = config.missing_credentials();
    if !missing.is_empty() {
        return Err(SheetError::Config(format!(
            "missing {}",
            missing.join(", ")
        )));
    }

    match config.provider {
        SheetProvider::Google => Ok(Arc::new(GoogleSheetsStore::new(config)?)),
        SheetProvider::Memory => Ok(Arc::new(MemorySheetStore::new())),
    }
}
