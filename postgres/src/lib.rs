//! `PostgreSQL` store for the fulfillment engine.
//!
//! [`PostgresDatabase`] implements [`Database`] on top of a sqlx pool. Every
//! [`PgTransaction`] runs with a `lock_timeout`, so a row lock that cannot be
//! acquired in time fails with SQLSTATE `55P03` instead of waiting forever.
//! That, serialization failures, deadlocks and unique-key clashes all surface
//! as [`StoreError::Conflict`](fulfillment_core::StoreError::Conflict).
//!
//! | Lock | SQL |
//! |---|---|
//! | storefront, shared | `FOR SHARE` |
//! | product / variant row | `FOR UPDATE` (parent product `FOR SHARE` for variants) |
//! | cart, order, reservations | `FOR UPDATE` |
//! | expiry sweep | `FOR UPDATE SKIP LOCKED` |
//!
//! # Example
//!
//! ```ignore
//! use fulfillment_postgres::PostgresDatabase;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = PostgresDatabase::connect("postgres://localhost/marketplace", 20).await?;
//!     db.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cart;
mod catalog;
mod error;
mod order;
mod reservation;

pub use error::map_error;

use fulfillment_core::store::{Database, StoreResult, StoreTransaction};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use std::time::Duration;

/// Lock wait applied to every transaction unless configured otherwise.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool sizing for [`PostgresDatabase::connect_with`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    /// Upper bound on open connections
    pub max_connections: u32,
    /// Connections kept open while idle
    pub min_connections: u32,
    /// How long `begin` waits for a free connection
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// `PostgreSQL`-backed [`Database`].
#[derive(Clone, Debug)]
pub struct PostgresDatabase {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresDatabase {
    /// Connect a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns the sqlx error if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        Self::connect_with(
            database_url,
            &PoolSettings {
                max_connections,
                ..PoolSettings::default()
            },
        )
        .await
    }

    /// Connect a pool sized and timed by `settings`.
    ///
    /// # Errors
    ///
    /// Returns the sqlx error if the database cannot be reached.
    pub async fn connect_with(
        database_url: &str,
        settings: &PoolSettings,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(database_url)
            .await?;
        tracing::info!(
            max_connections = settings.max_connections,
            min_connections = settings.min_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Change the per-transaction lock wait.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns the migration error if any migration fails.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }
}

impl Database for PostgresDatabase {
    type Tx = PgTransaction;

    async fn begin(&self) -> StoreResult<PgTransaction> {
        let mut tx = self.pool.begin().await.map_err(map_error)?;
        // SET does not take bind parameters; the value is an integer we format.
        let statement = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(map_error)?;
        Ok(PgTransaction { tx })
    }
}

/// One open `PostgreSQL` transaction. Dropping it rolls back.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    fn conn(&mut self) -> &mut sqlx::PgConnection {
        &mut self.tx
    }
}

impl StoreTransaction for PgTransaction {
    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_error)
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await.map_err(map_error)
    }
}

/// Read one column, mapping decode failures to a store error.
fn column<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(map_error)
}
