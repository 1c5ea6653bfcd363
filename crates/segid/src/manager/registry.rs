use crate::{Error, Generator, ManagerConfig, Result, Store, table_name, validate_service_name};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::OnceCell;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Returned by [`Manager::set_multi_services`] when one entry fails.
///
/// Entries before the failing one stay applied; entries after it were not
/// attempted.
#[derive(thiserror::Error, Debug)]
#[error("{source}")]
pub struct MultiSetError {
    /// Services provisioned before the failure, with their current id.
    pub applied: BTreeMap<String, i64>,
    /// Name of the entry that failed.
    pub failed: String,
    #[source]
    pub source: Error,
}

/// The registry of per-service [`Generator`]s.
///
/// Service names are recorded durably in the registry table; the generators
/// themselves live in an in-memory map. Every generator in the map was
/// checked to have a counter table at some point, except the ones created
/// through [`Manager::get_or_new_generator`], which callers provision
/// themselves.
///
/// Creating a table and recording its name are separate statements, as are
/// the steps of [`Manager::del_service`]. [`Manager::init`] reconciles the
/// two on startup: registry rows without a table are skipped. A
/// `del_service` that failed half way can be retried once the store is back,
/// by provisioning and deleting the service again.
///
/// Share a manager between servers with an `Arc`.
pub struct Manager<S> {
    store: Arc<S>,
    config: ManagerConfig,
    generators: RwLock<HashMap<String, Arc<Generator<S>>>>,
    initialized: OnceCell<()>,
}

impl<S> Manager<S>
where
    S: Store,
{
    pub fn new(store: Arc<S>, config: ManagerConfig) -> Self {
        Self {
            store,
            config,
            generators: RwLock::new(HashMap::new()),
            initialized: OnceCell::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn table_prefix(&self) -> &str {
        &self.config.table_prefix
    }

    /// Loads every registered service whose counter table exists.
    ///
    /// Creates the registry table if needed. Runs once: later calls, and
    /// calls racing the first one, return after the first successful run. A
    /// failed run is retried by the next call.
    ///
    /// # Errors
    ///
    /// Returns the first store failure.
    pub async fn init(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| self.load_registry())
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    #[cfg_attr(feature = "tracing", instrument(level = "info", skip(self), fields(registry = %self.config.registry_table)))]
    async fn load_registry(&self) -> Result<()> {
        let registry = &self.config.registry_table;
        self.store.ensure_registry(registry).await?;

        let mut loaded = 0_usize;
        for name in self.store.registry_names(registry).await? {
            if name.is_empty() || self.service_exists(&name) {
                continue;
            }
            if validate_service_name(&name, self.table_prefix()).is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(service = %name, "skipping registry row with unusable name");
                continue;
            }

            let generator = self.build(&name);
            if !self.store.table_exists(generator.table()).await? {
                #[cfg(feature = "tracing")]
                tracing::warn!(service = %name, table = %generator.table(), "skipping registry row without counter table");
                continue;
            }
            generator.init().await?;
            self.insert_if_absent(&name, Arc::new(generator));
            loaded += 1;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(loaded, "services loaded");
        #[cfg(not(feature = "tracing"))]
        let _ = loaded;

        Ok(())
    }

    fn build(&self, name: &str) -> Generator<S> {
        Generator::new(
            Arc::clone(&self.store),
            name,
            self.table_prefix(),
            self.config.batch_size,
        )
    }

    fn insert_if_absent(&self, name: &str, generator: Arc<Generator<S>>) -> Arc<Generator<S>> {
        let mut generators = self.generators.write();
        Arc::clone(generators.entry(name.to_owned()).or_insert(generator))
    }

    fn lookup(&self, name: &str) -> Option<Arc<Generator<S>>> {
        self.generators.read().get(name.trim()).cloned()
    }

    /// Looks a service up without touching the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] if the service is not loaded.
    pub fn get_generator(&self, name: &str) -> Result<Arc<Generator<S>>> {
        self.lookup(name).ok_or_else(|| Error::not_found(name))
    }

    /// Looks a service up, adding an unprovisioned generator if it is not
    /// loaded. Never touches the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidName`] for names that cannot form a table.
    pub fn get_or_new_generator(&self, name: &str) -> Result<Arc<Generator<S>>> {
        let name = validate_service_name(name, self.table_prefix())?;
        Ok(self.get_or_insert(name).0)
    }

    fn get_or_insert(&self, name: &str) -> (Arc<Generator<S>>, bool) {
        if let Some(generator) = self.lookup(name) {
            return (generator, false);
        }
        let mut generators = self.generators.write();
        if let Some(generator) = generators.get(name) {
            return (Arc::clone(generator), false);
        }
        let generator = Arc::new(self.build(name));
        generators.insert(name.to_owned(), Arc::clone(&generator));
        (generator, true)
    }

    // Unloads a generator whose first provisioning failed. Checked under the
    // generator's lock so a concurrent successful reset keeps it loaded.
    pub(crate) async fn unload_unprovisioned(
        &self,
        name: &str,
        generator: &Arc<Generator<S>>,
    ) -> bool {
        generator
            .unless_provisioned(|| {
                let mut generators = self.generators.write();
                if generators
                    .get(name)
                    .is_some_and(|current| Arc::ptr_eq(current, generator))
                {
                    generators.remove(name);
                }
            })
            .await
    }

    /// Provisions a service and returns its current id.
    ///
    /// Records the name in the registry, then resets the counter table
    /// (see [`Generator::reset`]). Without `force` an existing counter is
    /// kept and `last_id` is ignored. With `force` the counter is set to
    /// `last_id` unconditionally.
    ///
    /// The next id handed out is one past the returned value. A generator
    /// created by this call is removed again if provisioning fails.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidName`] for unusable names, otherwise the first store
    /// failure.
    #[cfg_attr(feature = "tracing", instrument(level = "info", skip(self)))]
    pub async fn set_service_id(&self, name: &str, last_id: i64, force: bool) -> Result<i64> {
        let name = validate_service_name(name, self.table_prefix())?;
        self.init().await?;

        let (generator, created) = self.get_or_insert(name);
        match self.provision(&generator, last_id, force).await {
            Ok(current) => {
                // A concurrent failed call may have removed the entry.
                self.insert_if_absent(name, Arc::clone(&generator));
                Ok(current)
            }
            Err(err) => {
                if created {
                    self.unload_unprovisioned(name, &generator).await;
                }
                Err(err)
            }
        }
    }

    async fn provision(&self, generator: &Generator<S>, last_id: i64, force: bool) -> Result<i64> {
        self.store
            .register(&self.config.registry_table, generator.name())
            .await?;
        generator.reset(last_id, force).await?;
        Ok(generator.current().await)
    }

    /// Applies [`Self::set_service_id`] to each entry in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failing entry. The returned [`MultiSetError`]
    /// carries the entries applied so far.
    pub async fn set_multi_services<I, K>(
        &self,
        entries: I,
        force: bool,
    ) -> Result<BTreeMap<String, i64>, MultiSetError>
    where
        I: IntoIterator<Item = (K, i64)>,
        K: AsRef<str>,
    {
        let mut applied = BTreeMap::new();
        for (name, last_id) in entries {
            let name = name.as_ref();
            match self.set_service_id(name, last_id, force).await {
                Ok(current) => {
                    applied.insert(name.trim().to_owned(), current);
                }
                Err(source) => {
                    return Err(MultiSetError {
                        applied,
                        failed: name.to_owned(),
                        source,
                    });
                }
            }
        }
        Ok(applied)
    }

    /// Next id for a loaded service.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceNotFound`] if the service is not loaded, otherwise
    /// see [`Generator::next_id`].
    pub async fn next_id(&self, name: &str) -> Result<i64> {
        self.get_generator(name)?.next_id().await
    }

    /// Last id handed out for a loaded service.
    pub async fn current_id(&self, name: &str) -> Result<i64> {
        Ok(self.get_generator(name)?.current().await)
    }

    /// Whether the service is loaded in this process. Does not consult the
    /// store.
    pub fn service_exists(&self, name: &str) -> bool {
        self.generators.read().contains_key(name.trim())
    }

    /// Unloads a service, drops its counter table and removes its registry
    /// row, in that order.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceNotFound`] if the service is not loaded. A store
    /// failure after unloading leaves durable state behind; see the
    /// type-level docs.
    #[cfg_attr(feature = "tracing", instrument(level = "info", skip(self)))]
    pub async fn del_service(&self, name: &str) -> Result<()> {
        let generator = self
            .generators
            .write()
            .remove(name.trim())
            .ok_or_else(|| Error::not_found(name))?;

        generator.del_key_table().await?;
        self.store
            .unregister(&self.config.registry_table, generator.name())
            .await
    }

    /// Every loaded service with its current id.
    pub async fn list_services(&self) -> BTreeMap<String, i64> {
        let generators: Vec<_> = self.generators.read().values().cloned().collect();
        let mut services = BTreeMap::new();
        for generator in generators {
            services.insert(generator.name().to_owned(), generator.current().await);
        }
        services
    }

    /// Whether the durable registry holds a row for `name`.
    pub async fn is_registered(&self, name: &str) -> Result<bool> {
        self.init().await?;
        self.store
            .is_registered(&self.config.registry_table, name.trim())
            .await
    }

    /// Whether the counter table for `name` exists in the store.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidName`] for unusable names, otherwise store failures.
    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let name = validate_service_name(name, self.table_prefix())?;
        self.store
            .table_exists(&table_name(self.table_prefix(), name))
            .await
    }
}
