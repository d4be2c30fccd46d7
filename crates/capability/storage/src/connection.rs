//! 数据库连接管理
//!
//! - connect_pool_lazy：惰性 Postgres 连接池（最大连接数 8），历史库不可达不阻塞启动
//! - connect_sqlite：打开本地 SQLite 文件（WAL，不存在则创建）

use crate::error::StorageError;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// 惰性 Postgres 连接池：首次使用时才建链，库不可达不影响启动。
pub fn connect_pool_lazy(database_url: &str) -> Result<PgPool, StorageError> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect_lazy(database_url)?;
    Ok(pool)
}

/// 打开 SQLite 文件，必要时创建父目录。
///
/// 单写者场景，连接池只保留 1 个连接。
pub async fn connect_sqlite(path: &str) -> Result<SqlitePool, StorageError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// 内存 SQLite（测试使用）。连接关闭即丢数据，因此禁止回收。
pub async fn connect_sqlite_memory() -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}
