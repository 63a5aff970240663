use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Result as SqlxResult, Transaction};
use tracing::instrument;

use crate::constants::SNAPSHOT_TABLE;
use crate::db::PgResult;
use crate::db::prelude::StatusSnapshotRecord;

pub mod snapshot;

pub struct Tx<'a> {
    inner: Option<Transaction<'a, Postgres>>,
}

impl<'a> Tx<'a> {
    #[instrument(skip(pool))]
    pub async fn begin(pool: &PgPool) -> SqlxResult<Self> {
        let inner = pool.begin().await?;
        Ok(Self { inner: Some(inner) })
    }

    #[instrument(skip(self))]
    pub async fn commit(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.commit().await
        } else {
            Err(sqlx::Error::Protocol(
                "Transaction already completed".into(),
            ))
        }
    }

    #[instrument(skip(self))]
    pub async fn rollback(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.rollback().await
        } else {
            Err(sqlx::Error::Protocol(
                "Transaction already completed".into(),
            ))
        }
    }

    fn inner_mut(&mut self) -> SqlxResult<&mut Transaction<'a, Postgres>> {
        self.inner
            .as_mut()
            .ok_or_else(|| sqlx::Error::Protocol("Transaction already completed".into()))
    }

    /// Appends `records` with a single multi-row `INSERT`, returning the number of rows written.
    #[instrument(skip(self, records), fields(row_count = records.len()))]
    pub async fn insert_snapshot_rows(
        &mut self,
        records: &[StatusSnapshotRecord],
    ) -> SqlxResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut query = insert_snapshot_query(records);
        let result = query.build().execute(&mut **self.inner_mut()?).await?;

        Ok(result.rows_affected())
    }
}

pub fn insert_snapshot_query(records: &[StatusSnapshotRecord]) -> QueryBuilder<'_, Postgres> {
    let mut query = QueryBuilder::new(format!(
        "INSERT INTO {SNAPSHOT_TABLE} ({}) ",
        sql_fragment::SNAPSHOT_INSERT_FIELDS
    ));

    query.push_values(records, |mut row, record| {
        row.push_bind(record.timestamp)
            .push_bind(record.team_id.as_str())
            .push_bind(record.team_name.as_str())
            .push_bind(record.channel_id.as_str())
            .push_bind(record.channel_name.as_str())
            .push_bind(record.user_id.as_str())
            .push_bind(record.username.as_str())
            .push_bind(record.status.as_str());
    });

    query
}

pub mod sql_fragment {
    pub const SNAPSHOT_INSERT_FIELDS: &str = r#"
        "timestamp",
        team_id,
        team_name,
        channel_id,
        channel_name,
        user_id,
        username,
        status
    "#;
}

/// Append-only destination for a run's snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Creates the destination if it does not exist yet. Safe to call on every run.
    async fn ensure_schema(&self) -> PgResult<()>;

    /// Writes every record or none of them, returning the number of rows written.
    async fn append(&self, records: &[StatusSnapshotRecord]) -> PgResult<u64>;
}
