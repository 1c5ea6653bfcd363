//! The backing-store seam.
//!
//! A [`Store`] executes the handful of statements the allocator needs. Each
//! method is one logical round-trip; the ones that read a counter run inside
//! a transaction that locks the row, and roll it back on any failure before
//! returning.
//!
//! ## Implementations
//!
//! - [`SqlStore`] - MySQL, PostgreSQL or SQLite through `sea-orm`.
//! - [`MemoryStore`] - in-process tables with round-trip accounting and
//!   failure injection.

mod memory;
#[cfg(feature = "sql")]
mod sql;

pub use memory::*;
#[cfg(feature = "sql")]
pub use sql::*;

use crate::Result;
use async_trait::async_trait;

/// Statements the allocator issues against a relational store.
///
/// `registry` and `table` arguments are identifiers that have already been
/// validated with [`is_identifier`](crate::is_identifier); implementations
/// may interpolate them directly.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Creates the registry table (`k`, primary key) if it is missing.
    async fn ensure_registry(&self, registry: &str) -> Result<()>;

    /// Lists every service name recorded in the registry.
    async fn registry_names(&self, registry: &str) -> Result<Vec<String>>;

    /// Records `name` in the registry. Recording it twice is a no-op.
    async fn register(&self, registry: &str, name: &str) -> Result<()>;

    /// Removes `name` from the registry. A missing row is not an error.
    async fn unregister(&self, registry: &str, name: &str) -> Result<()>;

    /// Returns `true` if `name` has a registry row.
    async fn is_registered(&self, registry: &str, name: &str) -> Result<bool>;

    /// Returns `true` if a table called exactly `table` exists.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Creates a counter table with a single `id` primary-key column.
    ///
    /// With `if_not_exists = false` an existing table is an error.
    async fn create_table(&self, table: &str, if_not_exists: bool) -> Result<()>;

    /// Drops `table` if it exists.
    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Number of rows in `table`.
    async fn row_count(&self, table: &str) -> Result<i64>;

    /// Inserts the seed row `value` into `table`.
    async fn insert_seed(&self, table: &str, value: i64) -> Result<()>;

    /// Reads the counter row under a row lock and commits without changing
    /// it. Returns `None` if the table has no row.
    async fn read_counter(&self, table: &str) -> Result<Option<i64>>;

    /// Leases the next segment: reads the counter row under a row lock, adds
    /// `batch` to it and commits.
    ///
    /// Returns the value read *before* the update, or `None` (after rolling
    /// back) if the table has no row.
    async fn lease(&self, table: &str, batch: i64) -> Result<Option<i64>>;
}
