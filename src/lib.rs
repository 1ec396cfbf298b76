//! letter-sync 库入口
//!
//! 信件变更日志与远程表格同步：
//! - `letter_repo` 写入信件并在同一路径上记录字段级变更
//! - `change_log` 追加式变更日志及其同步状态机
//! - `sheets` 远程表格访问（Google Sheets / 内存）
//! - `sync` 批次同步器与定时调度器

pub mod change_log;
pub mod config;
pub mod database;
pub mod error;
pub mod letter_repo;
pub mod logging;
pub mod models;
pub mod sheets;
pub mod sync;

pub use config::AppConfig;
pub use database::LetterDatabase;
pub use error::{LetterError, LetterResult, SheetError, SheetResult, SyncError};
pub use letter_repo::LetterRepo;
pub use models::{
    ChangeAction, ChangeLogRecord, CreateLetterParams, Letter, LetterChanges, LetterStatus,
    SyncRunResult, SyncState, SyncStatusSummary,
};
pub use sync::{SheetReconciler, SyncOptions, SyncScheduler};
