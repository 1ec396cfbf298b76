//! 应用配置
//!
//! 配置来源按优先级从低到高：
//! 1. 内置默认值（serde default）
//! 2. `config/letter_sync.toml`（可选）
//! 3. 环境变量 `LETTER_SYNC__<SECTION>__<KEY>`，如 `LETTER_SYNC__SYNC__BATCH_SIZE=20`
//!
//! 远程表格凭据另外支持 `GOOGLE_SHEETS_ID` / `GOOGLE_SHEETS_ACCESS_TOKEN` 直接回退。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 默认配置文件（不含扩展名，由 config crate 自动识别格式）
pub const DEFAULT_CONFIG_FILE: &str = "config/letter_sync";

/// 环境变量前缀
pub const ENV_PREFIX: &str = "LETTER_SYNC";

/// 单条变更日志的最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 5;

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_sheet_name() -> String {
    "Letters".to_string()
}
fn default_api_base() -> String {
    "https://sheets.googleapis.com/v4".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_http_retries() -> u32 {
    2
}

/// 顶层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 数据库目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 日志级别（`RUST_LOG` 优先）
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub sheets: SheetsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            sync: SyncConfig::default(),
            sheets: SheetsConfig::default(),
        }
    }
}

/// 同步调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 是否启动定时同步
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 定时间隔（秒）
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// 单批最多处理的变更日志条数
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 重试上限，达到后记录永久排除在批次之外
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// 远程表格后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SheetProvider {
    /// Google Sheets v4 REST
    #[default]
    Google,
    /// 进程内表格（演练 / 测试）
    Memory,
}

impl std::fmt::Display for SheetProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SheetProvider::Google => write!(f, "google"),
            SheetProvider::Memory => write!(f, "memory"),
        }
    }
}

/// 远程表格配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetsConfig {
    #[serde(default)]
    pub provider: SheetProvider,
    /// 表格文档 ID
    #[serde(default)]
    pub spreadsheet_id: Option<String>,
    /// 工作表名称
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
    /// 工作表数字 ID（格式复制请求需要）
    #[serde(default)]
    pub sheet_gid: i64,
    /// OAuth 访问令牌
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 只读请求的额外重试次数
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            provider: SheetProvider::default(),
            spreadsheet_id: None,
            sheet_name: default_sheet_name(),
            sheet_gid: 0,
            access_token: None,
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
            http_retries: default_http_retries(),
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or_default().is_empty()
}

impl SheetsConfig {
    /// 列出缺失的必需凭据；为空表示配置完整
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.provider == SheetProvider::Memory {
            return missing;
        }
        if is_blank(&self.spreadsheet_id) {
            missing.push("sheets.spreadsheet_id");
        }
        if is_blank(&self.access_token) {
            missing.push("sheets.access_token");
        }
        if self.sheet_name.trim().is_empty() {
            missing.push("sheets.sheet_name");
        }
        missing
    }

    fn apply_env_fallbacks(&mut self) {
        if is_blank(&self.spreadsheet_id) {
            self.spreadsheet_id = std::env::var("GOOGLE_SHEETS_ID").ok();
        }
        if is_blank(&self.access_token) {
            self.access_token = std::env::var("GOOGLE_SHEETS_ACCESS_TOKEN").ok();
        }
    }
}

impl AppConfig {
    /// 从 `.env`、默认配置文件和环境变量加载
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// 从指定配置文件（可不存在）和环境变量加载
    pub fn load_from(file: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(file).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
        cfg.sheets.apply_env_fallbacks();
        cfg.validate()?;
        Ok(cfg)
    }

    /// 仅从 TOML 文本解析（不读环境变量）
    pub fn from_toml_str(content: &str) -> Result<Self, config::ConfigError> {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 校验数值范围；凭据缺失不在此报错，由同步器在运行时报告
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.sync.interval_secs == 0 {
            return Err(config::ConfigError::Message(
                "sync.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.sync.batch_size == 0 {
            return Err(config::ConfigError::Message(
                "sync.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.sync.max_retries == 0 {
            return Err(config::ConfigError::Message(
                "sync.max_retries must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
