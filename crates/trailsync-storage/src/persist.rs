//! Batched, transactional mirror of the canonical registry into Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{error, info, warn};
use trailsync_core::{CanonicalRecord, CanonicalRegistry, IdentityKey};

pub const TRAILER_STATUS_TABLE: &str = "public.trailer_status";
pub const DEFAULT_PERSIST_BATCH_SIZE: usize = 200;
pub const UPSERT_BINDS_PER_ROW: usize = 12;
/// Postgres accepts at most 65535 bind parameters per statement.
pub const MAX_PERSIST_BATCH_SIZE: usize = u16::MAX as usize / UPSERT_BINDS_PER_ROW;

const UPSERT_COLUMNS: &str = "trailer_number, latitude, longitude, full_address, address_street, \
     address_city, address_state, address_country, address_postal, idle_duration, serial_data, time_utc";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persistence batch {batch} ({rows} rows) failed: {source}")]
    BatchFailed {
        batch: usize,
        rows: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("required table {table} is missing")]
    MissingTable { table: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// One `trailer_status` row; `None` binds as SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailerStatusRow {
    pub trailer_number: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub full_address: Option<String>,
    pub address_street: Option<String>,
    pub address_city: Option<String>,
    pub address_state: Option<String>,
    pub address_country: Option<String>,
    pub address_postal: Option<String>,
    pub idle_duration: Option<String>,
    pub serial_data: Option<String>,
    pub time_utc: Option<DateTime<Utc>>,
}

impl TrailerStatusRow {
    pub fn from_record(key: &IdentityKey, record: &CanonicalRecord) -> Self {
        Self {
            trailer_number: key.as_str().to_string(),
            latitude: record.latitude,
            longitude: record.longitude,
            full_address: record.full_address.clone(),
            address_street: record.address_street.clone(),
            address_city: record.address_city.clone(),
            address_state: record.address_state.clone(),
            address_country: record.address_country.clone(),
            address_postal: record.address_postal.clone(),
            idle_duration: record.idle_duration.clone(),
            serial_data: record.serial_data.clone(),
            time_utc: record.observed_at,
        }
    }

    pub fn from_registry(registry: &CanonicalRegistry) -> Vec<Self> {
        registry
            .iter()
            .map(|(key, record)| Self::from_record(key, record))
            .collect()
    }
}

/// Multi-row `INSERT .. ON CONFLICT DO UPDATE` for one batch.
pub fn build_upsert(rows: &[TrailerStatusRow]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {TRAILER_STATUS_TABLE} ({UPSERT_COLUMNS}) "));
    qb.push_values(rows.iter(), |mut b, row| {
        b.push_bind(row.trailer_number.clone())
            .push_bind(row.latitude)
            .push_bind(row.longitude)
            .push_bind(row.full_address.clone())
            .push_bind(row.address_street.clone())
            .push_bind(row.address_city.clone())
            .push_bind(row.address_state.clone())
            .push_bind(row.address_country.clone())
            .push_bind(row.address_postal.clone())
            .push_bind(row.idle_duration.clone())
            .push_bind(row.serial_data.clone())
            .push_bind(row.time_utc);
    });
    qb.push(
        r#"
        ON CONFLICT (trailer_number) DO UPDATE
        SET
          latitude        = EXCLUDED.latitude,
          longitude       = EXCLUDED.longitude,
          full_address    = EXCLUDED.full_address,
          address_street  = EXCLUDED.address_street,
          address_city    = EXCLUDED.address_city,
          address_state   = EXCLUDED.address_state,
          address_country = EXCLUDED.address_country,
          address_postal  = EXCLUDED.address_postal,
          idle_duration   = EXCLUDED.idle_duration,
          serial_data     = EXCLUDED.serial_data,
          time_utc        = EXCLUDED.time_utc,
          updated_at      = NOW()
        "#,
    );
    qb
}

/// Writes one batch atomically: either every row lands or none do.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write_batch(&self, rows: &[TrailerStatusRow]) -> Result<(), sqlx::Error>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub batches: usize,
    pub rows: usize,
}

/// Upsert `rows` in order, `batch_size` at a time, stopping at the first failed batch.
/// Batches committed before the failure stay committed.
pub async fn bulk_upsert<W: BatchWriter + ?Sized>(
    writer: &W,
    rows: &[TrailerStatusRow],
    batch_size: usize,
) -> Result<PersistSummary, PersistError> {
    let mut summary = PersistSummary::default();
    if rows.is_empty() {
        info!("bulk upsert: nothing to save");
        return Ok(summary);
    }

    for (batch, chunk) in rows.chunks(batch_size.max(1)).enumerate() {
        writer
            .write_batch(chunk)
            .await
            .map_err(|source| PersistError::BatchFailed {
                batch,
                rows: chunk.len(),
                source,
            })?;
        summary.batches += 1;
        summary.rows += chunk.len();
        info!(batch, rows = chunk.len(), "upserted trailer_status batch");
    }

    Ok(summary)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    Present,
    Created,
}

#[derive(Debug, Clone)]
pub struct PgTrailerStatusStore {
    pool: PgPool,
}

impl PgTrailerStatusStore {
    pub async fn connect(database_url: &str) -> Result<Self, PersistError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn table_exists(&self) -> Result<bool, PersistError> {
        let row = sqlx::query("SELECT to_regclass($1) IS NOT NULL AS exists")
            .bind(TRAILER_STATUS_TABLE)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>("exists")?)
    }

    /// Strict mode only verifies; otherwise a missing table is created.
    pub async fn ensure_schema(&self, strict: bool) -> Result<SchemaStatus, PersistError> {
        if self.table_exists().await? {
            return Ok(SchemaStatus::Present);
        }
        if strict {
            return Err(PersistError::MissingTable {
                table: TRAILER_STATUS_TABLE.to_string(),
            });
        }

        warn!(table = TRAILER_STATUS_TABLE, "table missing; creating");
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {TRAILER_STATUS_TABLE} (
              trailer_number   text PRIMARY KEY,
              latitude         double precision,
              longitude        double precision,
              full_address     text,
              address_street   text,
              address_city     text,
              address_state    text,
              address_country  text,
              address_postal   text,
              idle_duration    text,
              serial_data      text,
              time_utc         timestamptz,
              updated_at       timestamptz DEFAULT now()
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        Ok(SchemaStatus::Created)
    }
}

#[async_trait]
impl BatchWriter for PgTrailerStatusStore {
    async fn write_batch(&self, rows: &[TrailerStatusRow]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut qb = build_upsert(rows);
        match qb.build().execute(&mut *tx).await {
            Ok(_) => tx.commit().await,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "rollback of failed trailer_status batch also failed");
                }
                Err(err)
            }
        }
    }
}
