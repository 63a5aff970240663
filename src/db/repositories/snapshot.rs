use sqlx::PgPool;
use tracing::instrument;

use crate::constants::{PG_BIND_LIMIT, SNAPSHOT_COLUMN_COUNT};
use crate::db::prelude::{PgResult, SnapshotStore, StatusSnapshotRecord, Tx};
use crate::db::schema;

#[derive(Debug, Clone)]
pub struct SnapshotRepository {
    pool: PgPool,
    batch_size: usize,
    timescale: bool,
}

impl SnapshotRepository {
    pub fn new(pool: PgPool, batch_size: usize, timescale: bool) -> Self {
        Self {
            pool,
            batch_size: effective_batch_size(batch_size),
            timescale,
        }
    }

    /// Releases the repository's connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait::async_trait]
impl SnapshotStore for SnapshotRepository {
    async fn ensure_schema(&self) -> PgResult<()> {
        schema::ensure_schema(&self.pool, self.timescale).await
    }

    #[instrument(skip(self, records), fields(record_count = records.len(), batch_size = self.batch_size))]
    async fn append(&self, records: &[StatusSnapshotRecord]) -> PgResult<u64> {
        if records.is_empty() {
            tracing::info!("no records to insert");
            return Ok(0);
        }

        let mut tx = Tx::begin(&self.pool).await?;
        let mut written = 0u64;

        for chunk in records.chunks(self.batch_size) {
            match tx.insert_snapshot_rows(chunk).await {
                Ok(rows) => {
                    written += rows;
                    tracing::debug!(rows, total_written = written, "inserted batch");
                }
                Err(e) => {
                    tracing::error!(error = ?e, written_before_failure = written, "batch insert failed, rolling back");
                    if let Err(rollback_err) = tx.rollback().await {
                        tracing::error!(error = ?rollback_err, "rollback failed");
                    }
                    return Err(e.into());
                }
            }
        }

        tx.commit().await?;
        tracing::info!(monotonic_counter.snapshot_rows_written = written, "snapshot committed");

        Ok(written)
    }
}

/// Clamps the configured rows-per-statement so that no statement exceeds Postgres's bind limit.
fn effective_batch_size(configured: usize) -> usize {
    configured.clamp(1, PG_BIND_LIMIT / SNAPSHOT_COLUMN_COUNT)
}

#[cfg(test)]
mod test {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::constants::SNAPSHOT_TABLE;
    use crate::db::lazy_pool;
    use crate::mattermost::types::Status;
    use crate::util::env::Env;

    #[derive(Debug, sqlx::FromRow)]
    struct SnapshotRow {
        timestamp: DateTime<Utc>,
        channel_id: String,
        user_id: String,
        username: String,
        status: String,
    }

    #[test]
    fn test_batch_size_respects_bind_limit() {
        assert_eq!(effective_batch_size(100), 100);
        assert_eq!(effective_batch_size(0), 1);
        assert_eq!(effective_batch_size(1_000_000), 8191);
    }

    #[tokio::test]
    #[ignore = "requires a reachable postgres configured through PG_* variables"]
    async fn test_append_round_trip() {
        let env = Env::from_env().unwrap();
        let repo = SnapshotRepository::new(lazy_pool(env.pg_connect_options()), 2, false);
        repo.ensure_schema().await.unwrap();
        // idempotent
        repo.ensure_schema().await.unwrap();

        let timestamp = Utc::now();
        let records: Vec<StatusSnapshotRecord> = ["u1", "u2", "u3"]
            .into_iter()
            .map(|user| StatusSnapshotRecord {
                timestamp,
                team_id: "round-trip-team".into(),
                team_name: "round trip".into(),
                channel_id: "round-trip-channel".into(),
                channel_name: "Round Trip".into(),
                user_id: user.into(),
                username: format!("{user}-name"),
                status: Status::Away,
            })
            .collect();

        assert_eq!(repo.append(&records).await.unwrap(), 3);

        let rows: Vec<SnapshotRow> = sqlx::query_as(&format!(
            "SELECT \"timestamp\", channel_id, user_id, username, status FROM {SNAPSHOT_TABLE} \
             WHERE team_id = $1 AND \"timestamp\" = $2 ORDER BY user_id"
        ))
        .bind("round-trip-team")
        .bind(timestamp)
        .fetch_all(&repo.pool)
        .await
        .unwrap();

        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.status == "away" && r.channel_id == "round-trip-channel"));
        assert_eq!(rows[1].user_id, "u2");
        assert_eq!(rows[1].username, "u2-name");
        // postgres stores microseconds
        assert_eq!(
            rows[0].timestamp.timestamp_micros(),
            timestamp.timestamp_micros()
        );

        repo.close().await;
    }
}
