//! 信件数据库管理模块
//!
//! 提供独立 SQLite 数据库的初始化与连接池管理。
//!
//! ## 设计原则
//! - **单一数据库**：信件与变更日志位于同一个 `letters.db`，变更日志写入可复用同一连接
//! - **连接池管理**：使用 r2d2 管理连接池
//! - **迁移**：Refinery 嵌入式迁移，文件位于 `migrations/`

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::{LetterError, LetterResult};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// 数据库文件名
const DATABASE_FILENAME: &str = "letters.db";

/// SQLite 连接池类型
pub type LetterPool = Pool<SqliteConnectionManager>;

/// SQLite 池化连接类型
pub type LetterPooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// 信件数据库管理器
pub struct LetterDatabase {
    pool: LetterPool,
    db_path: PathBuf,
}

impl LetterDatabase {
    /// 在 `data_dir` 下创建（或打开）数据库并执行迁移
    ///
    /// # Errors
    /// * 目录创建失败
    /// * 连接池构建失败
    /// * 迁移执行失败
    pub fn new(data_dir: &Path) -> LetterResult<Self> {
        info!(
            "[Database] Initializing letter database in: {}",
            data_dir.display()
        );

        if let Err(e) = fs::create_dir_all(data_dir) {
            error!("[Database] Failed to create data directory: {}", e);
            return Err(LetterError::Io(format!(
                "Failed to create data directory: {}",
                e
            )));
        }

        let db_path = data_dir.join(DATABASE_FILENAME);
        let pool = Self::build_pool(&db_path)?;
        let db = Self { pool, db_path };
        db.run_migrations()?;

        info!(
            "[Database] Letter database initialized: {}",
            db.db_path.display()
        );
        Ok(db)
    }

    /// 构建连接池
    fn build_pool(db_path: &Path) -> LetterResult<LetterPool> {
        debug!(
            "[Database] Building connection pool for: {}",
            db_path.display()
        );

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000i64)?;
            Ok(())
        });

        Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(Duration::from_secs(5))
            .idle_timeout(Some(Duration::from_secs(600)))
            .build(manager)
            .map_err(|e| LetterError::Pool(format!("Failed to create connection pool: {}", e)))
    }

    fn run_migrations(&self) -> LetterResult<()> {
        let mut conn = self.get_conn()?;
        let report = embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| LetterError::Migration(e.to_string()))?;

        let applied = report.applied_migrations();
        if !applied.is_empty() {
            info!(
                "[Database] Applied {} migration(s), latest: {}",
                applied.len(),
                applied
                    .last()
                    .map(|m| m.name().to_string())
                    .unwrap_or_default()
            );
        }
        Ok(())
    }

    /// 获取数据库连接
    pub fn get_conn(&self) -> LetterResult<LetterPooledConnection> {
        self.pool
            .get()
            .map_err(|e| LetterError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// 获取数据库文件路径
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

/// 在 SAVEPOINT 中执行 `f`
///
/// SAVEPOINT 可以嵌套在外层事务内；`f` 失败时回滚到保存点并释放。
pub fn with_savepoint<T>(
    conn: &rusqlite::Connection,
    name: &str,
    f: impl FnOnce() -> LetterResult<T>,
) -> LetterResult<T> {
    conn.execute_batch(&format!("SAVEPOINT {}", name))
        .map_err(|e| {
            error!("[Database] Failed to create savepoint {}: {}", name, e);
            LetterError::Database(format!("Failed to create savepoint: {}", e))
        })?;

    match f() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {}", name))
                .map_err(|e| {
                    error!("[Database] Failed to release savepoint {}: {}", name, e);
                    LetterError::Database(format!("Failed to release savepoint: {}", e))
                })?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch(&format!("ROLLBACK TO {}", name));
            let _ = conn.execute_batch(&format!("RELEASE {}", name));
            Err(e)
        }
    }
}
