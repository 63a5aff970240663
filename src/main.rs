use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::collector::{CollectError, StatusCollector};
use crate::db::prelude::*;
use crate::mattermost::{ApiError, ClientConfig, MattermostClient};
use crate::util::env::{Env, EnvErr, TelemetryEnv};
use crate::util::telemetry::Telemetry;

mod collector;
mod constants;
mod db;
mod mattermost;
mod util;

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Env(#[from] EnvErr),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Pg(#[from] PgError),

    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error>),
}

type Result<T> = core::result::Result<T, RunnerErr>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let telemetry = Telemetry::new(&TelemetryEnv::from_env()?)?.register();

    let run_id = Uuid::new_v4();
    let result = run()
        .instrument(tracing::info_span!("run", %run_id))
        .await;

    match &result {
        Ok(written) => tracing::info!(%run_id, written, "run complete"),
        Err(e) => tracing::error!(%run_id, error = %e, "run failed"),
    }

    telemetry.shutdown();
    result.map(|_| ())
}

/// Configures a client and a store, takes one snapshot, then releases both regardless of outcome.
async fn run() -> Result<u64> {
    let env = Env::from_env()?;
    tracing::debug!(
        base_url = %env.api_base_url(),
        batch_size = env.batch_size,
        timescale = env.timescale_enabled,
        "configuration loaded"
    );

    let mut client = MattermostClient::new(ClientConfig::from(&env))?;
    let store = SnapshotRepository::new(
        lazy_pool(env.pg_connect_options()),
        env.batch_size,
        env.timescale_enabled,
    );

    let result = run_snapshot(&mut client, &store).await;

    if client.session().is_some()
        && let Err(e) = client.logout().await
    {
        tracing::warn!(error = %e, "logout failed");
    }
    store.close().await;

    result
}

/// Collects a full snapshot and only then touches the store, so that a failed walk leaves the
/// table untouched.
async fn run_snapshot<S>(client: &mut MattermostClient, store: &S) -> Result<u64>
where
    S: SnapshotStore,
{
    let snapshot = StatusCollector::new(client).collect().await?;

    store.ensure_schema().await?;
    let written = store.append(&snapshot.records).await?;

    tracing::info!(
        timestamp = %snapshot.timestamp,
        written,
        skipped = snapshot.skipped.len(),
        "snapshot persisted"
    );

    Ok(written)
}
