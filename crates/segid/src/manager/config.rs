/// Default number of ids leased from the store per round-trip.
pub const DEFAULT_BATCH_SIZE: i64 = 2000;

/// Default prefix prepended to a service name to form its counter table.
pub const DEFAULT_TABLE_PREFIX: &str = "gid_key_";

/// Default name of the table recording every provisioned service.
pub const DEFAULT_REGISTRY_TABLE: &str = "gid_keys";

/// Settings shared by every generator a [`Manager`](crate::Manager) owns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    pub batch_size: i64,
    pub table_prefix: String,
    pub registry_table: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            table_prefix: DEFAULT_TABLE_PREFIX.to_owned(),
            registry_table: DEFAULT_REGISTRY_TABLE.to_owned(),
        }
    }
}

impl ManagerConfig {
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_table_prefix(mut self, table_prefix: impl Into<String>) -> Self {
        self.table_prefix = table_prefix.into();
        self
    }

    pub fn with_registry_table(mut self, registry_table: impl Into<String>) -> Self {
        self.registry_table = registry_table.into();
        self
    }
}
