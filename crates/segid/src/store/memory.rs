use crate::{Error, Result, Store};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};

/// The statement kinds a [`Store`] executes, used to account round-trips and
/// to target injected failures on a [`MemoryStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreOp {
    EnsureRegistry,
    RegistryNames,
    Register,
    Unregister,
    IsRegistered,
    TableExists,
    CreateTable,
    DropTable,
    RowCount,
    InsertSeed,
    ReadCounter,
    Lease,
}

/// Failures produced by [`MemoryStore`], worded after what a SQL server
/// would report for the same statement.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryStoreError {
    #[error("Table '{0}' doesn't exist")]
    NoSuchTable(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Duplicate entry '{value}' for key '{table}.PRIMARY'")]
    DuplicateEntry { table: String, value: i64 },

    #[error("BIGINT value is out of range in '{table}.id + {batch}'")]
    OutOfRange { table: String, batch: i64 },

    #[error("injected {0:?} failure")]
    Injected(StoreOp),
}

#[derive(Default)]
struct Tables {
    registries: HashMap<String, BTreeSet<String>>,
    counters: HashMap<String, Vec<i64>>,
    calls: HashMap<StoreOp, u64>,
    faults: HashSet<StoreOp>,
}

impl Tables {
    fn registry(&mut self, registry: &str) -> Result<&mut BTreeSet<String>, MemoryStoreError> {
        self.registries
            .get_mut(registry)
            .ok_or_else(|| MemoryStoreError::NoSuchTable(registry.to_owned()))
    }

    fn counter(&mut self, table: &str) -> Result<&mut Vec<i64>, MemoryStoreError> {
        self.counters
            .get_mut(table)
            .ok_or_else(|| MemoryStoreError::NoSuchTable(table.to_owned()))
    }
}

/// An in-process [`Store`].
///
/// Tables live in a map behind a single mutex, so every call is atomic, which
/// is the same guarantee a row lock plus a transaction gives the SQL store.
/// Every call counts as one round-trip, including calls that fail.
///
/// Cloning is not supported; share it behind an `Arc` and hand the same
/// instance to successive managers to simulate a process restart against
/// surviving durable state.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `op` calls made so far.
    pub fn round_trips(&self, op: StoreOp) -> u64 {
        self.tables.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of calls made so far, all kinds together.
    pub fn total_round_trips(&self) -> u64 {
        self.tables.lock().calls.values().sum()
    }

    /// Makes the next `op` call fail with [`MemoryStoreError::Injected`].
    pub fn fail_next(&self, op: StoreOp) {
        self.tables.lock().faults.insert(op);
    }

    /// Current value of the first counter row, without counting a
    /// round-trip.
    pub fn peek_counter(&self, table: &str) -> Option<i64> {
        self.tables
            .lock()
            .counters
            .get(table)
            .and_then(|rows| rows.first().copied())
    }

    /// Whether `table` exists, without counting a round-trip.
    pub fn peek_table(&self, table: &str) -> bool {
        self.tables.lock().counters.contains_key(table)
    }

    /// Whether `name` is in `registry`, without counting a round-trip.
    pub fn peek_registered(&self, registry: &str, name: &str) -> bool {
        self.tables
            .lock()
            .registries
            .get(registry)
            .is_some_and(|names| names.contains(name))
    }

    fn call<T>(
        &self,
        op: StoreOp,
        f: impl FnOnce(&mut Tables) -> Result<T, MemoryStoreError>,
    ) -> Result<T> {
        let mut tables = self.tables.lock();
        *tables.calls.entry(op).or_default() += 1;
        if tables.faults.remove(&op) {
            return Err(Error::store(MemoryStoreError::Injected(op)));
        }
        f(&mut *tables).map_err(Error::store)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_registry(&self, registry: &str) -> Result<()> {
        self.call(StoreOp::EnsureRegistry, |t| {
            t.registries.entry(registry.to_owned()).or_default();
            Ok(())
        })
    }

    async fn registry_names(&self, registry: &str) -> Result<Vec<String>> {
        self.call(StoreOp::RegistryNames, |t| {
            Ok(t.registry(registry)?.iter().cloned().collect())
        })
    }

    async fn register(&self, registry: &str, name: &str) -> Result<()> {
        self.call(StoreOp::Register, |t| {
            t.registry(registry)?.insert(name.to_owned());
            Ok(())
        })
    }

    async fn unregister(&self, registry: &str, name: &str) -> Result<()> {
        self.call(StoreOp::Unregister, |t| {
            t.registry(registry)?.remove(name);
            Ok(())
        })
    }

    async fn is_registered(&self, registry: &str, name: &str) -> Result<bool> {
        self.call(StoreOp::IsRegistered, |t| {
            Ok(t.registry(registry)?.contains(name))
        })
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.call(StoreOp::TableExists, |t| Ok(t.counters.contains_key(table)))
    }

    async fn create_table(&self, table: &str, if_not_exists: bool) -> Result<()> {
        self.call(StoreOp::CreateTable, |t| {
            if t.counters.contains_key(table) {
                if if_not_exists {
                    return Ok(());
                }
                return Err(MemoryStoreError::TableExists(table.to_owned()));
            }
            t.counters.insert(table.to_owned(), Vec::new());
            Ok(())
        })
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.call(StoreOp::DropTable, |t| {
            t.counters.remove(table);
            Ok(())
        })
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        self.call(StoreOp::RowCount, |t| Ok(t.counter(table)?.len() as i64))
    }

    async fn insert_seed(&self, table: &str, value: i64) -> Result<()> {
        self.call(StoreOp::InsertSeed, |t| {
            let rows = t.counter(table)?;
            if rows.contains(&value) {
                return Err(MemoryStoreError::DuplicateEntry {
                    table: table.to_owned(),
                    value,
                });
            }
            rows.push(value);
            Ok(())
        })
    }

    async fn read_counter(&self, table: &str) -> Result<Option<i64>> {
        self.call(StoreOp::ReadCounter, |t| {
            Ok(t.counter(table)?.first().copied())
        })
    }

    async fn lease(&self, table: &str, batch: i64) -> Result<Option<i64>> {
        self.call(StoreOp::Lease, |t| {
            let rows = t.counter(table)?;
            let Some(&stored) = rows.first() else {
                return Ok(None);
            };
            // Same as `UPDATE t SET id = id + batch` without a WHERE clause.
            let updated = rows
                .iter()
                .map(|row| row.checked_add(batch))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| MemoryStoreError::OutOfRange {
                    table: table.to_owned(),
                    batch,
                })?;
            *rows = updated;
            Ok(Some(stored))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_returns_value_before_update() {
        let store = MemoryStore::new();
        store.create_table("t", false).await.unwrap();
        store.insert_seed("t", 7).await.unwrap();

        assert_eq!(store.lease("t", 10).await.unwrap(), Some(7));
        assert_eq!(store.lease("t", 10).await.unwrap(), Some(17));
        assert_eq!(store.peek_counter("t"), Some(27));
        assert_eq!(store.round_trips(StoreOp::Lease), 2);
    }

    #[tokio::test]
    async fn lease_past_i64_max_fails_without_update() {
        let store = MemoryStore::new();
        store.create_table("t", false).await.unwrap();
        store.insert_seed("t", i64::MAX - 1).await.unwrap();

        assert!(store.lease("t", 2).await.is_err());
        assert_eq!(store.peek_counter("t"), Some(i64::MAX - 1));
    }

    #[tokio::test]
    async fn lease_on_empty_table_is_none() {
        let store = MemoryStore::new();
        store.create_table("t", true).await.unwrap();
        assert_eq!(store.lease("t", 10).await.unwrap(), None);
        assert_eq!(store.read_counter("t").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_tables_are_store_errors() {
        let store = MemoryStore::new();
        let err = store.lease("gone", 1).await.unwrap_err();
        assert_eq!(err.to_string(), "Table 'gone' doesn't exist");
        assert!(store.registry_names("reg").await.is_err());
    }

    #[tokio::test]
    async fn create_without_if_not_exists_refuses_existing_table() {
        let store = MemoryStore::new();
        store.create_table("t", false).await.unwrap();
        assert!(store.create_table("t", true).await.is_ok());
        assert!(store.create_table("t", false).await.is_err());
    }

    #[tokio::test]
    async fn registry_insert_is_idempotent() {
        let store = MemoryStore::new();
        store.ensure_registry("reg").await.unwrap();
        store.register("reg", "a").await.unwrap();
        store.register("reg", "a").await.unwrap();
        store.register("reg", "b").await.unwrap();
        assert_eq!(store.registry_names("reg").await.unwrap(), ["a", "b"]);

        store.unregister("reg", "a").await.unwrap();
        store.unregister("reg", "a").await.unwrap();
        assert!(!store.is_registered("reg", "a").await.unwrap());
        assert!(store.peek_registered("reg", "b"));
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let store = MemoryStore::new();
        store.create_table("t", false).await.unwrap();
        store.fail_next(StoreOp::InsertSeed);

        let err = store.insert_seed("t", 1).await.unwrap_err();
        assert_eq!(err.to_string(), "injected InsertSeed failure");
        store.insert_seed("t", 1).await.unwrap();
        assert_eq!(store.round_trips(StoreOp::InsertSeed), 2);
        assert_eq!(store.total_round_trips(), 3);
    }
}
