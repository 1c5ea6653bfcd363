use crate::{Error, Result, Store};
use async_trait::async_trait;
use core::time::Duration;
use sea_orm::{
    ConnectionTrait, Database, DatabaseConnection, DatabaseTransaction, DbBackend, QueryResult,
    Statement, TransactionTrait, Value,
};

pub use sea_orm::ConnectOptions;

/// SQL flavour of the connected database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
    Sqlite,
}

impl From<DbBackend> for Dialect {
    fn from(backend: DbBackend) -> Self {
        match backend {
            DbBackend::MySql => Self::MySql,
            DbBackend::Postgres => Self::Postgres,
            _ => Self::Sqlite,
        }
    }
}

impl Dialect {
    fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::MySql | Self::Sqlite => "?".to_owned(),
        }
    }

    fn create_registry(self, registry: &str) -> String {
        match self {
            Self::MySql => format!(
                "CREATE TABLE IF NOT EXISTS {registry} (\
                 k VARCHAR(255) NOT NULL COMMENT 'service name', PRIMARY KEY (k)\
                 ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
            ),
            Self::Postgres | Self::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {registry} (k VARCHAR(255) NOT NULL, PRIMARY KEY (k))"
            ),
        }
    }

    fn insert_registry(self, registry: &str) -> String {
        let p = self.placeholder(1);
        match self {
            Self::MySql => format!("INSERT IGNORE INTO {registry} (k) VALUES ({p})"),
            Self::Postgres => {
                format!("INSERT INTO {registry} (k) VALUES ({p}) ON CONFLICT (k) DO NOTHING")
            }
            Self::Sqlite => format!("INSERT OR IGNORE INTO {registry} (k) VALUES ({p})"),
        }
    }

    fn create_counter(self, table: &str, if_not_exists: bool) -> String {
        let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
        match self {
            Self::MySql => format!(
                "CREATE TABLE {guard}{table} (\
                 id BIGINT UNSIGNED NOT NULL, PRIMARY KEY (id)\
                 ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
            ),
            Self::Postgres => {
                format!("CREATE TABLE {guard}{table} (id BIGINT NOT NULL, PRIMARY KEY (id))")
            }
            Self::Sqlite => {
                format!("CREATE TABLE {guard}{table} (id INTEGER NOT NULL, PRIMARY KEY (id))")
            }
        }
    }

    fn table_exists(self) -> String {
        let p = self.placeholder(1);
        match self {
            Self::MySql => format!(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = {p}"
            ),
            Self::Postgres => format!(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = {p}"
            ),
            Self::Sqlite => {
                format!("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = {p}")
            }
        }
    }

    // SQLite has no row locks; a write transaction already excludes other
    // writers on the whole database.
    fn select_for_update(self, table: &str) -> String {
        match self {
            Self::Sqlite => format!("SELECT id FROM {table}"),
            Self::MySql | Self::Postgres => format!("SELECT id FROM {table} FOR UPDATE"),
        }
    }

    // Postgres folds unquoted identifiers to lower case in its catalog.
    fn catalog_name(self, table: &str) -> String {
        match self {
            Self::Postgres => table.to_ascii_lowercase(),
            Self::MySql | Self::Sqlite => table.to_owned(),
        }
    }
}

/// A [`Store`] backed by MySQL, PostgreSQL or SQLite through a `sea-orm`
/// connection pool.
///
/// The dialect is picked from the connection URL scheme. Only the drivers
/// enabled through the `mysql`, `postgres` and `sqlite` features can be
/// connected to.
#[derive(Clone, Debug)]
pub struct SqlStore {
    db: DatabaseConnection,
    dialect: Dialect,
}

impl SqlStore {
    /// Opens a connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the URL is invalid or the database cannot
    /// be reached.
    pub async fn connect<C>(options: C) -> Result<Self>
    where
        C: Into<ConnectOptions>,
    {
        let db = Database::connect(options).await?;
        Ok(Self::from_connection(db))
    }

    /// Builds connection options with the pool settings the server exposes.
    ///
    /// An in-memory SQLite database lives and dies with its connection, so
    /// its pool is pinned to exactly one.
    pub fn options(url: &str, max_connections: u32, connect_timeout: Duration) -> ConnectOptions {
        let mut options = ConnectOptions::new(url.to_owned());
        options
            .max_connections(max_connections)
            .connect_timeout(connect_timeout)
            .sqlx_logging(false);
        if is_sqlite_memory(url) {
            options.max_connections(1).min_connections(1);
        }
        options
    }

    /// Wraps an already open connection.
    pub fn from_connection(db: DatabaseConnection) -> Self {
        let dialect = Dialect::from(db.get_database_backend());
        Self { db, dialect }
    }

    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Closes the pool. Clones of this store share the pool and stop working
    /// as well.
    pub async fn close(&self) -> Result<()> {
        self.db.clone().close().await?;
        Ok(())
    }

    fn statement(&self, sql: String) -> Statement {
        #[cfg(feature = "tracing")]
        tracing::trace!(sql = %sql, "executing");
        Statement::from_string(self.db.get_database_backend(), sql)
    }

    fn statement_with(&self, sql: String, values: impl IntoIterator<Item = Value>) -> Statement {
        #[cfg(feature = "tracing")]
        tracing::trace!(sql = %sql, "executing");
        Statement::from_sql_and_values(self.db.get_database_backend(), sql, values)
    }

    async fn count<C>(&self, conn: &C, stmt: Statement) -> Result<i64>
    where
        C: ConnectionTrait,
    {
        match conn.query_one(stmt).await? {
            Some(row) => Ok(row.try_get_by_index::<i64>(0)?),
            None => Ok(0),
        }
    }

    async fn select_for_update<C>(&self, conn: &C, table: &str) -> Result<Option<i64>>
    where
        C: ConnectionTrait,
    {
        let stmt = self.statement(self.dialect.select_for_update(table));
        match conn.query_one(stmt).await? {
            Some(row) => self.decode_id(&row).map(Some),
            None => Ok(None),
        }
    }

    // The MySQL column is unsigned and sqlx refuses to decode it as `i64`.
    fn decode_id(&self, row: &QueryResult) -> Result<i64> {
        match self.dialect {
            Dialect::MySql => {
                let raw = row.try_get_by_index::<u64>(0)?;
                i64::try_from(raw).map_err(Error::store)
            }
            Dialect::Postgres | Dialect::Sqlite => Ok(row.try_get_by_index::<i64>(0)?),
        }
    }

    async fn lease_in(
        &self,
        txn: &DatabaseTransaction,
        table: &str,
        batch: i64,
    ) -> Result<Option<i64>> {
        let p = self.dialect.placeholder(1);
        let update = self.statement_with(
            format!("UPDATE {table} SET id = id + {p}"),
            [Value::from(batch)],
        );

        // SQLite only waits for the write lock when the transaction has not
        // read yet; upgrading a read lock fails with SQLITE_BUSY at once.
        if self.dialect == Dialect::Sqlite {
            if txn.execute(update).await?.rows_affected() == 0 {
                return Ok(None);
            }
            let select = self.statement_with(
                format!("SELECT id - {p} FROM {table}"),
                [Value::from(batch)],
            );
            return match txn.query_one(select).await? {
                Some(row) => self.decode_id(&row).map(Some),
                None => Ok(None),
            };
        }

        let Some(stored) = self.select_for_update(txn, table).await? else {
            return Ok(None);
        };
        txn.execute(update).await?;
        Ok(Some(stored))
    }
}

fn is_sqlite_memory(url: &str) -> bool {
    url.starts_with("sqlite:") && (url.contains(":memory:") || url.contains("mode=memory"))
}

async fn rollback(txn: DatabaseTransaction) {
    if let Err(_e) = txn.rollback().await {
        #[cfg(feature = "tracing")]
        tracing::warn!("rollback failed: {_e}");
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn ensure_registry(&self, registry: &str) -> Result<()> {
        self.db
            .execute(self.statement(self.dialect.create_registry(registry)))
            .await?;
        Ok(())
    }

    async fn registry_names(&self, registry: &str) -> Result<Vec<String>> {
        let rows = self
            .db
            .query_all(self.statement(format!("SELECT k FROM {registry}")))
            .await?;
        rows.iter()
            .map(|row| row.try_get_by_index::<String>(0).map_err(Error::from))
            .collect()
    }

    async fn register(&self, registry: &str, name: &str) -> Result<()> {
        let stmt = self.statement_with(self.dialect.insert_registry(registry), [Value::from(name)]);
        self.db.execute(stmt).await?;
        Ok(())
    }

    async fn unregister(&self, registry: &str, name: &str) -> Result<()> {
        let p = self.dialect.placeholder(1);
        let stmt = self.statement_with(
            format!("DELETE FROM {registry} WHERE k = {p}"),
            [Value::from(name)],
        );
        self.db.execute(stmt).await?;
        Ok(())
    }

    async fn is_registered(&self, registry: &str, name: &str) -> Result<bool> {
        let p = self.dialect.placeholder(1);
        let stmt = self.statement_with(
            format!("SELECT COUNT(*) FROM {registry} WHERE k = {p}"),
            [Value::from(name)],
        );
        Ok(self.count(&self.db, stmt).await? > 0)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let stmt = self.statement_with(
            self.dialect.table_exists(),
            [Value::from(self.dialect.catalog_name(table))],
        );
        Ok(self.count(&self.db, stmt).await? > 0)
    }

    async fn create_table(&self, table: &str, if_not_exists: bool) -> Result<()> {
        self.db
            .execute(self.statement(self.dialect.create_counter(table, if_not_exists)))
            .await?;
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.db
            .execute(self.statement(format!("DROP TABLE IF EXISTS {table}")))
            .await?;
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let stmt = self.statement(format!("SELECT COUNT(*) FROM {table}"));
        self.count(&self.db, stmt).await
    }

    async fn insert_seed(&self, table: &str, value: i64) -> Result<()> {
        let p = self.dialect.placeholder(1);
        let stmt = self.statement_with(
            format!("INSERT INTO {table} (id) VALUES ({p})"),
            [Value::from(value)],
        );
        self.db.execute(stmt).await?;
        Ok(())
    }

    async fn read_counter(&self, table: &str) -> Result<Option<i64>> {
        let txn = self.db.begin().await?;
        match self.select_for_update(&txn, table).await {
            Ok(value) => {
                txn.commit().await?;
                Ok(value)
            }
            Err(err) => {
                rollback(txn).await;
                Err(err)
            }
        }
    }

    async fn lease(&self, table: &str, batch: i64) -> Result<Option<i64>> {
        let txn = self.db.begin().await?;
        match self.lease_in(&txn, table, batch).await {
            Ok(Some(stored)) => {
                txn.commit().await?;
                Ok(Some(stored))
            }
            Ok(None) => {
                rollback(txn).await;
                Ok(None)
            }
            Err(err) => {
                rollback(txn).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Manager, ManagerConfig};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn sqlite() -> SqlStore {
        let options = SqlStore::options("sqlite::memory:", 16, Duration::from_secs(5));
        SqlStore::connect(options).await.unwrap()
    }

    #[test]
    fn in_memory_sqlite_uses_one_connection() {
        let options = SqlStore::options("sqlite::memory:", 16, Duration::from_secs(5));
        assert_eq!(options.get_max_connections(), Some(1));
        assert_eq!(options.get_min_connections(), Some(1));

        let options = SqlStore::options("sqlite://ids.db?mode=rwc", 16, Duration::from_secs(5));
        assert_eq!(options.get_max_connections(), Some(16));
        assert!(is_sqlite_memory("sqlite://ids.db?mode=memory"));
        assert!(!is_sqlite_memory("mysql://u:p@localhost/memory"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_leases_on_a_file_database() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("segid-{}-{nanos}.db", std::process::id()));
        let url = format!("sqlite://{}?mode=rwc", path.display());

        let store = Arc::new(
            SqlStore::connect(SqlStore::options(&url, 16, Duration::from_secs(5)))
                .await
                .unwrap(),
        );
        let manager = Arc::new(Manager::new(
            Arc::clone(&store),
            ManagerConfig::default().with_batch_size(1),
        ));
        for service in 0..8 {
            manager
                .set_service_id(&format!("svc{service}"), 0, false)
                .await
                .unwrap();
        }

        let tasks: Vec<_> = (0..8)
            .flat_map(|service| (0..50).map(move |_| service))
            .map(|service| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    let id = manager.next_id(&format!("svc{service}")).await;
                    (service, id)
                })
            })
            .collect();

        let mut ids: BTreeMap<i32, Vec<i64>> = BTreeMap::new();
        for task in tasks {
            let (service, id) = task.await.unwrap();
            ids.entry(service).or_default().push(id.unwrap());
        }
        for (_, mut issued) in ids {
            issued.sort_unstable();
            assert_eq!(issued, (1..=50).collect::<Vec<i64>>());
        }
        for service in 0..8 {
            let table = format!("gid_key_svc{service}");
            assert_eq!(store.read_counter(&table).await.unwrap(), Some(50));
        }

        store.close().await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn counter_table_lifecycle() {
        let store = sqlite().await;
        assert_eq!(store.dialect(), Dialect::Sqlite);

        assert!(!store.table_exists("gid_key_orders").await.unwrap());
        store.create_table("gid_key_orders", false).await.unwrap();
        assert!(store.table_exists("gid_key_orders").await.unwrap());
        assert!(store.create_table("gid_key_orders", false).await.is_err());
        store.create_table("gid_key_orders", true).await.unwrap();

        assert_eq!(store.row_count("gid_key_orders").await.unwrap(), 0);
        assert_eq!(store.read_counter("gid_key_orders").await.unwrap(), None);
        assert_eq!(store.lease("gid_key_orders", 10).await.unwrap(), None);

        store.insert_seed("gid_key_orders", 5).await.unwrap();
        assert_eq!(store.row_count("gid_key_orders").await.unwrap(), 1);
        assert_eq!(store.read_counter("gid_key_orders").await.unwrap(), Some(5));
        assert_eq!(store.lease("gid_key_orders", 10).await.unwrap(), Some(5));
        assert_eq!(store.lease("gid_key_orders", 10).await.unwrap(), Some(15));
        assert_eq!(store.read_counter("gid_key_orders").await.unwrap(), Some(25));

        store.drop_table("gid_key_orders").await.unwrap();
        store.drop_table("gid_key_orders").await.unwrap();
        assert!(!store.table_exists("gid_key_orders").await.unwrap());
        assert!(store.lease("gid_key_orders", 10).await.is_err());
    }

    #[tokio::test]
    async fn table_lookup_is_not_a_pattern() {
        let store = sqlite().await;
        store.create_table("gid_keyXorders", false).await.unwrap();
        assert!(!store.table_exists("gid_key_orders").await.unwrap());
    }

    #[tokio::test]
    async fn registry_rows() {
        let store = sqlite().await;
        store.ensure_registry("gid_keys").await.unwrap();
        store.ensure_registry("gid_keys").await.unwrap();

        store.register("gid_keys", "orders").await.unwrap();
        store.register("gid_keys", "orders").await.unwrap();
        store.register("gid_keys", "users").await.unwrap();
        let mut names = store.registry_names("gid_keys").await.unwrap();
        names.sort();
        assert_eq!(names, ["orders", "users"]);

        assert!(store.is_registered("gid_keys", "orders").await.unwrap());
        store.unregister("gid_keys", "orders").await.unwrap();
        store.unregister("gid_keys", "orders").await.unwrap();
        assert!(!store.is_registered("gid_keys", "orders").await.unwrap());
    }

    #[test]
    fn dialect_statements() {
        assert_eq!(
            Dialect::MySql.select_for_update("t"),
            "SELECT id FROM t FOR UPDATE"
        );
        assert_eq!(Dialect::Sqlite.select_for_update("t"), "SELECT id FROM t");
        assert_eq!(
            Dialect::Postgres.insert_registry("r"),
            "INSERT INTO r (k) VALUES ($1) ON CONFLICT (k) DO NOTHING"
        );
        assert_eq!(
            Dialect::MySql.insert_registry("r"),
            "INSERT IGNORE INTO r (k) VALUES (?)"
        );
        assert_eq!(
            Dialect::Sqlite.create_counter("t", true),
            "CREATE TABLE IF NOT EXISTS t (id INTEGER NOT NULL, PRIMARY KEY (id))"
        );
        assert_eq!(Dialect::Postgres.catalog_name("gid_key_Orders"), "gid_key_orders");
    }
}
