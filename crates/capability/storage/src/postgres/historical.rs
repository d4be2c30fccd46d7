//! Postgres 历史库写入实现

use crate::error::StorageError;
use crate::models::MeasurementPoint;
use crate::traits::HistoricalStore;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};

const CREATE_TABLE: &str = "create table if not exists sensor_reading (\
     device_id text not null, \
     device_type text not null, \
     module_kind text not null, \
     module_id text not null, \
     ts timestamptz not null, \
     fields jsonb not null, \
     valid boolean not null default true)";

const CREATE_INDEX: &str = "create index if not exists idx_sensor_reading_device_ts \
     on sensor_reading (device_id, module_id, ts desc)";

pub struct PgHistoricalStore {
    pub pool: PgPool,
    schema_ready: AtomicBool,
}

impl PgHistoricalStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: AtomicBool::new(false),
        }
    }

    /// 惰性建链；建表推迟到首次写入。
    pub fn connect_lazy(database_url: &str) -> Result<Self, StorageError> {
        let pool = crate::connection::connect_pool_lazy(database_url)?;
        Ok(Self::new(pool))
    }

    /// 建表（幂等）。
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait::async_trait]
impl HistoricalStore for PgHistoricalStore {
    async fn write_batch(&self, points: &[MeasurementPoint]) -> Result<usize, StorageError> {
        if points.is_empty() {
            return Ok(0);
        }
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        for point in points {
            let fields = serde_json::to_string(&point.fields)?;
            sqlx::query(
                "insert into sensor_reading \
                 (device_id, device_type, module_kind, module_id, ts, fields, valid) \
                 values ($1, $2, $3, $4, to_timestamp($5 / 1000.0), $6::text::jsonb, $7)",
            )
            .bind(&point.device_id)
            .bind(&point.device_type)
            .bind(&point.module_kind)
            .bind(&point.module_id)
            .bind(point.ts_ms as f64)
            .bind(fields)
            .bind(point.valid)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(points.len())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("select 1").execute(&self.pool).await?;
        Ok(())
    }
}
