//! SQLite 兜底日志实现
//!
//! 单表追加：`seq` 自增主键即全局写入顺序，回放按 `seq` 升序取最旧条目。
//! `retry_count` 达到上限的条目在回放时跳过，但不删除。

use crate::error::StorageError;
use crate::models::{FallbackEntry, FallbackStats};
use crate::traits::FallbackLog;
use domain::{PhysicalSample, now_epoch_ms};
use sqlx::{Row, SqlitePool};

const CREATE_TABLE: &str = "create table if not exists fallback_records (\
     seq integer primary key autoincrement, \
     device_id text not null, \
     payload text not null, \
     created_at_ms integer not null, \
     retry_count integer not null default 0)";

const HAS_RETRY_COLUMN: &str =
    "select count(*) from pragma_table_info('fallback_records') where name = 'retry_count'";

const ADD_RETRY_COLUMN: &str =
    "alter table fallback_records add column retry_count integer not null default 0";

const CREATE_INDEX: &str =
    "create index if not exists idx_fallback_device on fallback_records (device_id, seq)";

pub struct SqliteFallbackLog {
    pub pool: SqlitePool,
}

impl SqliteFallbackLog {
    /// 使用现有连接池并建表。
    pub async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        let log = Self { pool };
        log.ensure_schema().await?;
        Ok(log)
    }

    /// 打开（或创建）本地文件。
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let pool = crate::connection::connect_sqlite(path).await?;
        Self::new(pool).await
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        // 旧版本建的表没有重试计数列
        let has_retry: i64 = sqlx::query_scalar(HAS_RETRY_COLUMN)
            .fetch_one(&self.pool)
            .await?;
        if has_retry == 0 {
            sqlx::query(ADD_RETRY_COLUMN).execute(&self.pool).await?;
        }
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl FallbackLog for SqliteFallbackLog {
    async fn append(&self, samples: &[PhysicalSample]) -> Result<usize, StorageError> {
        if samples.is_empty() {
            return Ok(0);
        }
        let created_at_ms = now_epoch_ms();
        let mut tx = self.pool.begin().await?;
        for sample in samples {
            let payload = serde_json::to_string(sample)?;
            sqlx::query(
                "insert into fallback_records (device_id, payload, created_at_ms) \
                 values (?, ?, ?)",
            )
            .bind(&sample.device_id)
            .bind(payload)
            .bind(created_at_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(samples.len())
    }

    async fn oldest(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<FallbackEntry>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "select seq, payload, created_at_ms, retry_count from fallback_records \
             where retry_count < ? order by seq asc limit ?",
        )
        .bind(i64::from(max_retries))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                let retry_count: i64 = row.try_get("retry_count")?;
                Ok(FallbackEntry {
                    seq: row.try_get("seq")?,
                    sample: serde_json::from_str(&payload)?,
                    created_at_ms: row.try_get("created_at_ms")?,
                    retry_count: u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX),
                })
            })
            .collect()
    }

    async fn remove(&self, seqs: &[i64]) -> Result<usize, StorageError> {
        if seqs.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for seq in seqs {
            let result = sqlx::query("delete from fallback_records where seq = ?")
                .bind(seq)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn mark_retry(&self, seqs: &[i64]) -> Result<usize, StorageError> {
        if seqs.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut marked = 0u64;
        for seq in seqs {
            let result = sqlx::query(
                "update fallback_records set retry_count = retry_count + 1 where seq = ?",
            )
            .bind(seq)
            .execute(&mut *tx)
            .await?;
            marked += result.rows_affected();
        }
        tx.commit().await?;
        Ok(marked as usize)
    }

    async fn depth(&self) -> Result<usize, StorageError> {
        let count: i64 = sqlx::query_scalar("select count(*) from fallback_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn stats(&self, max_retries: u32) -> Result<FallbackStats, StorageError> {
        let row = sqlx::query(
            "select count(*) as pending, \
             coalesce(sum(case when retry_count >= ? then 1 else 0 end), 0) as exhausted, \
             min(created_at_ms) as oldest from fallback_records",
        )
        .bind(i64::from(max_retries))
        .fetch_one(&self.pool)
        .await?;
        let pending: i64 = row.try_get("pending")?;
        let exhausted: i64 = row.try_get("exhausted")?;
        let oldest: Option<i64> = row.try_get("oldest")?;
        Ok(FallbackStats {
            pending: pending.max(0) as usize,
            exhausted: exhausted.max(0) as usize,
            oldest_created_at_ms: oldest,
        })
    }
}
