use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use thiserror::Error;

pub mod models;
pub mod repositories;
pub mod schema;

pub mod prelude {
    pub use crate::db::{PgError, PgResult, lazy_pool};

    pub use crate::db::models::snapshot::StatusSnapshotRecord;

    pub use crate::db::repositories::Tx;
    pub use crate::db::repositories::snapshot::SnapshotRepository;
    pub use crate::db::repositories::SnapshotStore; // + trait to provide store methods
}

/// Builds a single-connection pool which connects on first use.
///
/// A run holds at most one connection, and holds none at all while it is still talking to the
/// API. Callers are expected to `close()` the pool once the run is over.
pub fn lazy_pool(options: PgConnectOptions) -> PgPool {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect_lazy_with(options)
}

pub type PgResult<T> = core::result::Result<T, PgError>;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum PgError {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error("schema setup failed at '{step}': {source}")]
    SchemaError {
        step: &'static str,
        #[source]
        source: sqlx::Error,
    },
}
