//! 错误类型定义
//!
//! 按层划分错误类型：
//! - `LetterError`：数据库与信件仓库
//! - `SheetError`：远程表格访问
//! - `SyncError`：单次同步批次内部的错误分类

/// 信件仓库结果类型别名
pub type LetterResult<T> = Result<T, LetterError>;

/// 表格访问结果类型别名
pub type SheetResult<T> = Result<T, SheetError>;

/// 信件仓库 / 数据库错误
#[derive(Debug, thiserror::Error)]
pub enum LetterError {
    /// 数据库错误
    #[error("Database error: {0}")]
    Database(String),

    /// 连接池错误
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// 迁移错误
    #[error("Migration error: {0}")]
    Migration(String),

    /// 资源未找到
    #[error("{resource_type} not found: {id}")]
    NotFound { resource_type: String, id: String },

    /// 无效参数
    #[error("Invalid argument '{param}': {reason}")]
    InvalidArgument { param: String, reason: String },

    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(String),
}

impl LetterError {
    pub fn letter_not_found(id: impl Into<String>) -> Self {
        LetterError::NotFound {
            resource_type: "Letter".to_string(),
            id: id.into(),
        }
    }
}

impl From<rusqlite::Error> for LetterError {
    fn from(err: rusqlite::Error) -> Self {
        LetterError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for LetterError {
    fn from(err: r2d2::Error) -> Self {
        LetterError::Pool(err.to_string())
    }
}

impl From<serde_json::Error> for LetterError {
    fn from(err: serde_json::Error) -> Self {
        LetterError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for LetterError {
    fn from(err: std::io::Error) -> Self {
        LetterError::Io(err.to_string())
    }
}

/// 远程表格错误
#[derive(Debug, thiserror::Error)]
pub enum SheetError {
    /// 配置缺失或无效（不可重试）
    #[error("config error: {0}")]
    Config(String),

    /// 网络层错误
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// 远端返回非 2xx
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },

    /// 响应格式无法解析
    #[error("malformed response: {0}")]
    Malformed(String),

    /// 其他错误（内存实现注入的故障等）
    #[error("{0}")]
    Other(String),
}

impl SheetError {
    /// 网络错误、429 与 5xx 可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            SheetError::Http(_) => true,
            SheetError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// 同步批次内部错误
///
/// 批次内的错误最终都会被折叠进 `SyncRunResult::errors`。
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// 缺少远程凭据等配置
    #[error("configuration: {0}")]
    Configuration(String),

    /// 仅影响单封信件的错误
    #[error("letter {letter_id}: {message}")]
    Letter { letter_id: String, message: String },

    /// 影响整个批次的错误（远端故障、数据库不可用）
    #[error("batch: {0}")]
    Batch(String),
}

impl From<LetterError> for SyncError {
    fn from(err: LetterError) -> Self {
        SyncError::Batch(err.to_string())
    }
}

impl From<SheetError> for SyncError {
    fn from(err: SheetError) -> Self {
        match err {
            SheetError::Config(msg) => SyncError::Configuration(msg),
            other => SyncError::Batch(other.to_string()),
        }
    }
}
