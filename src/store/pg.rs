use alloy::primitives::B256;
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use tracing::{debug, info};

use crate::{
    config::{DbConfig, is_valid_ident},
    error::PersistError,
    event::MaterializedRecord,
    range::BlockRange,
    types::{Checkpoint, GapRecord, IndexedEvent, RecentBlock},
};

use super::StateStore;

const MAX_CONNECTIONS: u32 = 10;

/// Postgres-backed [`StateStore`].
///
/// Everything lives under one schema so multiple graphs can share a database.
/// The schema name is validated as a plain identifier before it is ever
/// spliced into SQL; all values go through bind parameters.
pub struct PgStore {
    pool: PgPool,
    schema: String,
    recent_capacity: u64,
}

impl PgStore {
    /// Connects and creates the schema and tables if they do not exist yet.
    pub async fn connect(config: &DbConfig, recent_capacity: u64) -> Result<Self, PersistError> {
        if !is_valid_ident(&config.schema) {
            return Err(PersistError::InvalidSchema(config.schema.clone()));
        }
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(&config.url())
            .await?;
        let store = Self { pool, schema: config.schema.clone(), recent_capacity };
        store.ensure_schema().await?;
        info!(schema = %store.schema, "state store ready");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), PersistError> {
        let s = &self.schema;
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {s}"),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.checkpoints (
                    name TEXT PRIMARY KEY,
                    block_number BIGINT NOT NULL,
                    block_hash TEXT
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.events (
                    sequence BIGINT NOT NULL UNIQUE,
                    block_number BIGINT NOT NULL,
                    block_hash TEXT NOT NULL,
                    transaction_hash TEXT NOT NULL,
                    log_index BIGINT NOT NULL,
                    ordinal INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    PRIMARY KEY (block_hash, transaction_hash, log_index, ordinal)
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS events_block_number_idx
                    ON {s}.events (block_number)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.gaps (
                    block_number BIGINT NOT NULL,
                    transaction_hash TEXT NOT NULL,
                    log_index BIGINT NOT NULL,
                    reason TEXT NOT NULL,
                    PRIMARY KEY (block_number, transaction_hash, log_index)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s}.recent_blocks (
                    number BIGINT PRIMARY KEY,
                    hash TEXT NOT NULL
                )"
            ),
        ];
        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_checkpoint(
        &self,
        tx: &mut sqlx::PgConnection,
        checkpoint: &Checkpoint,
    ) -> Result<(), PersistError> {
        sqlx::query(&format!(
            "INSERT INTO {}.checkpoints (name, block_number, block_hash)
                VALUES ($1, $2, $3)
                ON CONFLICT (name) DO UPDATE
                SET block_number = EXCLUDED.block_number,
                    block_hash = EXCLUDED.block_hash",
            self.schema
        ))
        .bind(&checkpoint.name)
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.block_hash.map(|h| h.to_string()))
        .execute(tx)
        .await?;
        Ok(())
    }
}

fn parse_hash(text: &str) -> Result<B256, PersistError> {
    text.parse::<B256>()
        .map_err(|err| PersistError::Database(sqlx::Error::Decode(Box::new(err))))
}

#[async_trait]
impl StateStore for PgStore {
    async fn load_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, PersistError> {
        let row = sqlx::query(&format!(
            "SELECT name, block_number, block_hash FROM {}.checkpoints WHERE name = $1",
            self.schema
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let hash: Option<String> = row.try_get("block_hash")?;
        Ok(Some(Checkpoint {
            name: row.try_get("name")?,
            block_number: row.try_get::<i64, _>("block_number")? as u64,
            block_hash: hash.as_deref().map(parse_hash).transpose()?,
        }))
    }

    async fn commit_indexed(
        &self,
        events: &[IndexedEvent],
        gaps: &[GapRecord],
        checkpoint: &Checkpoint,
        recent: &[RecentBlock],
    ) -> Result<(), PersistError> {
        let s = &self.schema;
        let mut tx = self.pool.begin().await?;
        for event in events {
            // identity conflict means this event was committed by an earlier
            // run; skipping it keeps replay idempotent
            sqlx::query(&format!(
                "INSERT INTO {s}.events
                    (sequence, block_number, block_hash, transaction_hash,
                     log_index, ordinal, name, payload)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (block_hash, transaction_hash, log_index, ordinal)
                    DO NOTHING"
            ))
            .bind(event.sequence as i64)
            .bind(event.block_number as i64)
            .bind(event.block_hash.to_string())
            .bind(event.transaction_hash.to_string())
            .bind(event.log_index as i64)
            .bind(event.ordinal as i32)
            .bind(&event.name)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await?;
        }
        for gap in gaps {
            sqlx::query(&format!(
                "INSERT INTO {s}.gaps (block_number, transaction_hash, log_index, reason)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (block_number, transaction_hash, log_index) DO NOTHING"
            ))
            .bind(gap.block_number as i64)
            .bind(gap.transaction_hash.to_string())
            .bind(gap.log_index as i64)
            .bind(&gap.reason)
            .execute(&mut *tx)
            .await?;
        }
        for block in recent {
            sqlx::query(&format!(
                "INSERT INTO {s}.recent_blocks (number, hash)
                    VALUES ($1, $2)
                    ON CONFLICT (number) DO UPDATE SET hash = EXCLUDED.hash"
            ))
            .bind(block.number as i64)
            .bind(block.hash.to_string())
            .execute(&mut *tx)
            .await?;
        }
        let cutoff = checkpoint.block_number.saturating_sub(self.recent_capacity);
        sqlx::query(&format!("DELETE FROM {s}.recent_blocks WHERE number < $1"))
            .bind(cutoff as i64)
            .execute(&mut *tx)
            .await?;
        self.upsert_checkpoint(&mut *tx, checkpoint).await?;
        tx.commit().await?;
        debug!(
            events = events.len(),
            gaps = gaps.len(),
            checkpoint = checkpoint.block_number,
            "indexed range committed"
        );
        Ok(())
    }

    async fn commit_stage(
        &self,
        stage: &str,
        records: &[Box<dyn MaterializedRecord>],
        checkpoint: &Checkpoint,
    ) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            record.upsert(&mut *tx).await?;
        }
        self.upsert_checkpoint(&mut *tx, checkpoint).await?;
        tx.commit().await?;
        debug!(
            stage,
            records = records.len(),
            checkpoint = checkpoint.block_number,
            "stage range committed"
        );
        Ok(())
    }

    async fn load_events(&self, range: BlockRange) -> Result<Vec<IndexedEvent>, PersistError> {
        let rows = sqlx::query(&format!(
            "SELECT sequence, block_number, block_hash, transaction_hash,
                    log_index, ordinal, name, payload
                FROM {}.events
                WHERE block_number BETWEEN $1 AND $2
                ORDER BY sequence",
            self.schema
        ))
        .bind(range.start() as i64)
        .bind(range.end() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let block_hash: String = row.try_get("block_hash")?;
                let transaction_hash: String = row.try_get("transaction_hash")?;
                Ok(IndexedEvent {
                    sequence: row.try_get::<i64, _>("sequence")? as u64,
                    block_number: row.try_get::<i64, _>("block_number")? as u64,
                    block_hash: parse_hash(&block_hash)?,
                    transaction_hash: parse_hash(&transaction_hash)?,
                    log_index: row.try_get::<i64, _>("log_index")? as u64,
                    ordinal: row.try_get::<i32, _>("ordinal")? as u32,
                    name: row.try_get("name")?,
                    payload: row.try_get("payload")?,
                })
            })
            .collect()
    }

    async fn recent_blocks(&self) -> Result<Vec<RecentBlock>, PersistError> {
        let rows = sqlx::query(&format!(
            "SELECT number, hash FROM {}.recent_blocks ORDER BY number",
            self.schema
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let hash: String = row.try_get("hash")?;
                Ok(RecentBlock {
                    number: row.try_get::<i64, _>("number")? as u64,
                    hash: parse_hash(&hash)?,
                })
            })
            .collect()
    }

    async fn rollback_to(&self, block: u64) -> Result<(), PersistError> {
        let s = &self.schema;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {s}.events WHERE block_number > $1"))
            .bind(block as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM {s}.gaps WHERE block_number > $1"))
            .bind(block as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM {s}.recent_blocks WHERE number > $1"))
            .bind(block as i64)
            .execute(&mut *tx)
            .await?;
        // the checkpoint hash is no longer trustworthy above the ancestor
        sqlx::query(&format!(
            "UPDATE {s}.checkpoints SET block_number = $1, block_hash = NULL
                WHERE block_number > $1"
        ))
        .bind(block as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(to_block = block, "store rolled back");
        Ok(())
    }

    async fn max_sequence(&self) -> Result<u64, PersistError> {
        let row = sqlx::query(&format!(
            "SELECT COALESCE(MAX(sequence), 0) AS max_sequence FROM {}.events",
            self.schema
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("max_sequence")? as u64)
    }
}
