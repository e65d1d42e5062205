//! PostgreSQL sink for vehicle records

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::{
    chunk::Chunk,
    config::DatabaseConfig,
    errors::WriteError,
    models::RecordId,
    sink::RecordSink,
};

/// Bulk writer into a single table
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
    table: String,
}

impl Database {
    /// Connect using the database configuration and make sure the table exists
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        info!(
            "Connecting to database: max_connections={}, table={}",
            config.max_connections, config.table
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await?;

        Self::new(pool, &config.table).await
    }

    /// Wrap an existing pool. `table` must be a plain identifier.
    pub async fn new(pool: PgPool, table: &str) -> Result<Self, sqlx::Error> {
        let db = Self {
            pool,
            table: table.to_string(),
        };
        db.create_table().await?;
        Ok(db)
    }

    /// Create the target table if it is not there yet
    async fn create_table(&self) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                timestamp BIGINT NOT NULL,
                line_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                journey_pattern_id TEXT NOT NULL,
                time_frame DATE NOT NULL,
                vehicle_journey_id TEXT NOT NULL,
                operator TEXT NOT NULL,
                congestion BOOLEAN NOT NULL,
                longitude TEXT NOT NULL,
                latitude TEXT NOT NULL,
                delay DOUBLE PRECISION,
                block_id TEXT NOT NULL,
                vehicle_id TEXT NOT NULL,
                stop_id TEXT NOT NULL,
                at_stop BOOLEAN NOT NULL
            )",
            self.table
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RecordSink for Database {
    /// Insert the whole chunk in one statement inside a transaction
    async fn write_batch(&self, chunk: Chunk) -> Result<Vec<RecordId>, WriteError> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (
                timestamp, line_id, direction, journey_pattern_id, time_frame,
                vehicle_journey_id, operator, congestion, longitude, latitude,
                delay, block_id, vehicle_id, stop_id, at_stop
            ) ",
            self.table
        ));
        query_builder.push_values(chunk.records.iter(), |mut b, record| {
            b.push_bind(record.timestamp)
                .push_bind(&record.line_id)
                .push_bind(&record.direction)
                .push_bind(&record.journey_pattern_id)
                .push_bind(record.time_frame)
                .push_bind(&record.vehicle_journey_id)
                .push_bind(&record.operator)
                .push_bind(record.congestion)
                .push_bind(&record.longitude)
                .push_bind(&record.latitude)
                .push_bind(record.delay)
                .push_bind(&record.block_id)
                .push_bind(&record.vehicle_id)
                .push_bind(&record.stop_id)
                .push_bind(record.at_stop);
        });
        query_builder.push(" RETURNING id");

        let ids: Vec<i64> = query_builder
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await?;

        if ids.len() != chunk.len() {
            // Dropping `tx` rolls the insert back
            return Err(WriteError::IdCountMismatch {
                expected: chunk.len(),
                returned: ids.len(),
            });
        }
        tx.commit().await?;

        debug!("Inserted chunk {} with {} records", chunk.seq, ids.len());
        Ok(ids.into_iter().map(RecordId::from).collect())
    }
}
