//! Idempotent creation of the snapshot table, plus optional TimescaleDB setup.

use sqlx::PgPool;
use tracing::instrument;

use crate::constants::SNAPSHOT_TABLE;
use crate::db::{PgError, PgResult};

fn create_table_sql(timescale: bool) -> String {
    // hypertables need the partitioning column in every unique constraint
    let primary_key = match timescale {
        true => "PRIMARY KEY (id, \"timestamp\")",
        false => "PRIMARY KEY (id)",
    };

    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {SNAPSHOT_TABLE} (
            id BIGSERIAL,
            "timestamp" TIMESTAMPTZ NOT NULL,
            team_id TEXT NOT NULL,
            team_name TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            channel_name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            username TEXT NOT NULL,
            status TEXT NOT NULL,
            {primary_key}
        )
        "#
    )
}

#[instrument(skip(pool))]
pub async fn ensure_schema(pool: &PgPool, timescale: bool) -> PgResult<()> {
    if timescale {
        // may require superuser; an already-enabled extension is fine either way
        if let Err(e) = sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb CASCADE")
            .execute(pool)
            .await
        {
            tracing::warn!(error = %e, "could not ensure timescaledb extension");
        }
    }

    sqlx::query(&create_table_sql(timescale))
        .execute(pool)
        .await
        .map_err(|source| PgError::SchemaError {
            step: "create table",
            source,
        })?;

    tracing::info!(table = SNAPSHOT_TABLE, "table schema ensured");

    if timescale {
        ensure_hypertable(pool).await?;
    } else {
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {SNAPSHOT_TABLE}_timestamp_idx ON {SNAPSHOT_TABLE} (\"timestamp\" DESC)"
        ))
        .execute(pool)
        .await
        .map_err(|source| PgError::SchemaError {
            step: "create timestamp index",
            source,
        })?;
    }

    Ok(())
}

#[instrument(skip(pool))]
async fn ensure_hypertable(pool: &PgPool) -> PgResult<()> {
    if let Err(source) = sqlx::query(&format!(
        "SELECT create_hypertable('{SNAPSHOT_TABLE}', 'timestamp', if_not_exists => TRUE)"
    ))
    .execute(pool)
    .await
    {
        if !is_already_hypertable(&source) {
            tracing::error!(error = %source, "hypertable conversion failed");
            return Err(PgError::SchemaError {
                step: "create hypertable",
                source,
            });
        }
    }

    tracing::info!(table = SNAPSHOT_TABLE, "hypertable ensured");

    if let Err(e) = sqlx::query(&format!(
        r#"
        ALTER TABLE {SNAPSHOT_TABLE}
        SET (
            timescaledb.compress = 'on',
            timescaledb.compress_segmentby = 'team_id, channel_id, user_id',
            timescaledb.compress_orderby = '"timestamp" DESC'
        )
        "#
    ))
    .execute(pool)
    .await
    {
        tracing::warn!(error = %e, "could not apply compression settings");
    }

    if let Err(e) = sqlx::query(&format!(
        "SELECT add_compression_policy('{SNAPSHOT_TABLE}', INTERVAL '1 days', if_not_exists => TRUE)"
    ))
    .execute(pool)
    .await
    {
        match e
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == "42710")
        {
            true => tracing::info!("compression policy already exists"),
            false => tracing::warn!(error = %e, "could not add compression policy"),
        }
    }

    Ok(())
}

/// `42P07` (duplicate_table) or an "already a hypertable" message
fn is_already_hypertable(err: &sqlx::Error) -> bool {
    match err.as_database_error() {
        Some(db) => {
            db.code().is_some_and(|code| code == "42P07")
                || db.message().to_lowercase().contains("already a hypertable")
        }
        None => false,
    }
}
