use crate::{Error, Result, Store, table_name};
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// The in-memory lease of a [`Generator`].
///
/// `current` is the last id handed out and `batch_max` the last id the lease
/// covers. `current <= batch_max` holds after every completed operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub current: i64,
    pub batch_max: i64,
}

impl Segment {
    const fn at(value: i64) -> Self {
        Self {
            current: value,
            batch_max: value,
        }
    }

    const fn is_exhausted(&self) -> bool {
        self.current >= self.batch_max
    }
}

/// A per-service id allocator that leases ids from its counter table in
/// segments of `batch_size`.
///
/// Ids inside the current segment are handed out from memory. Crossing the
/// end of the segment costs one store round-trip, which advances the stored
/// counter by a whole batch under a row lock. Ids leased by a process that
/// stops before handing them out are skipped, never reissued.
///
/// Every operation holds the generator's lock for its whole duration, store
/// round-trips included. Different generators never contend with each other.
///
/// ## Example
///
/// ```
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// use segid::{Generator, MemoryStore};
/// use std::sync::Arc;
///
/// let generator = Generator::new(Arc::new(MemoryStore::new()), "orders", "gid_key_", 100);
/// generator.reset(1000, false).await?;
///
/// assert_eq!(generator.next_id().await?, 1001);
/// assert_eq!(generator.next_id().await?, 1002);
/// assert_eq!(generator.current().await, 1002);
/// # Ok::<(), segid::Error>(())
/// # }).unwrap();
/// ```
pub struct Generator<S> {
    store: Arc<S>,
    name: String,
    table: String,
    batch_size: i64,
    state: Mutex<Segment>,
    // Written under `state`.
    provisioned: AtomicBool,
}

impl<S> Generator<S>
where
    S: Store,
{
    /// Builds a generator without touching the store.
    ///
    /// The segment starts empty (`current = batch_max = 0`); call
    /// [`Self::init`] or [`Self::reset`] before handing out ids. A
    /// `batch_size` below 1 is raised to 1.
    pub fn new(
        store: Arc<S>,
        name: impl Into<String>,
        table_prefix: &str,
        batch_size: i64,
    ) -> Self {
        let name = name.into();
        Self {
            table: table_name(table_prefix, &name),
            store,
            name,
            batch_size: batch_size.max(1),
            state: Mutex::new(Segment::default()),
            provisioned: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the counter table backing this service.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub const fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// Whether an [`Self::init`] or [`Self::reset`] has completed.
    pub fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::Acquire)
    }

    /// Runs `f` with the generator locked, unless it has been provisioned.
    /// Returns whether `f` ran.
    pub(crate) async fn unless_provisioned(&self, f: impl FnOnce()) -> bool {
        let _state = self.state.lock().await;
        if self.is_provisioned() {
            return false;
        }
        f();
        true
    }

    /// Loads the stored counter and starts an empty segment at it.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`] if the table is missing or the read
    /// transaction fails.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), fields(service = %self.name)))]
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = Segment::at(self.load().await?);
        self.provisioned.store(true, Ordering::Release);
        Ok(())
    }

    /// The last id handed out.
    pub async fn current(&self) -> i64 {
        self.state.lock().await.current
    }

    /// A copy of the current segment.
    pub async fn segment(&self) -> Segment {
        *self.state.lock().await
    }

    /// Returns the next id for this service.
    ///
    /// Ids are strictly increasing for the lifetime of the generator.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingCounterRow`] if the table holds no counter row.
    /// - [`Error::CounterOverflow`] if the stored counter cannot advance by
    ///   another batch.
    /// - [`Error::Store`] if the lease transaction fails.
    ///
    /// On error the segment is left as it was.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self), fields(service = %self.name)))]
    pub async fn next_id(&self) -> Result<i64> {
        let mut state = self.state.lock().await;
        if state.is_exhausted() {
            *state = self.lease().await?;
        }
        state.current += 1;
        Ok(state.current)
    }

    async fn lease(&self) -> Result<Segment> {
        let stored = self
            .store
            .lease(&self.table, self.batch_size)
            .await?
            .ok_or_else(|| Error::MissingCounterRow {
                name: self.name.clone(),
            })?;
        let batch_max = stored
            .checked_add(self.batch_size)
            .ok_or_else(|| Error::CounterOverflow {
                name: self.name.clone(),
                stored,
            })?;

        #[cfg(feature = "tracing")]
        tracing::debug!(service = %self.name, stored, batch_max, "leased segment");

        Ok(Segment {
            current: stored,
            batch_max,
        })
    }

    /// (Re)provisions the counter table.
    ///
    /// With `force`, the table is dropped, recreated and seeded with
    /// `id_offset`. Without it, the table is created only if missing; an
    /// existing counter row wins over `id_offset` and is reloaded instead, so
    /// a repeated call never moves the counter backwards.
    ///
    /// If seeding fails, the table is dropped again so no unseeded table is
    /// left behind.
    ///
    /// # Errors
    ///
    /// Returns the first store failure. If dropping the table after a failed
    /// seed also fails, both are reported as [`Error::Compensation`].
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self), fields(service = %self.name)))]
    pub async fn reset(&self, id_offset: i64, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;

        if force {
            self.store.drop_table(&self.table).await?;
            self.store.create_table(&self.table, false).await?;
        } else {
            self.store.create_table(&self.table, true).await?;
            if self.store.row_count(&self.table).await? > 0 {
                let stored = self.load().await?;
                #[cfg(feature = "tracing")]
                tracing::info!(
                    service = %self.name,
                    stored,
                    requested = id_offset,
                    "keeping existing counter"
                );
                *state = Segment::at(stored);
                self.provisioned.store(true, Ordering::Release);
                return Ok(());
            }
        }

        if let Err(err) = self.store.insert_seed(&self.table, id_offset).await {
            return Err(match self.store.drop_table(&self.table).await {
                Ok(()) => err,
                Err(cleanup) => Error::Compensation {
                    source: Box::new(err),
                    cleanup: Box::new(cleanup),
                },
            });
        }

        #[cfg(feature = "tracing")]
        tracing::info!(service = %self.name, id_offset, force, "counter seeded");

        *state = Segment::at(id_offset);
        self.provisioned.store(true, Ordering::Release);
        Ok(())
    }

    /// Drops the counter table, if present.
    pub async fn del_key_table(&self) -> Result<()> {
        let _state = self.state.lock().await;
        self.store.drop_table(&self.table).await
    }

    // A table without a row loads as 0; the next lease then reports the
    // missing row.
    async fn load(&self) -> Result<i64> {
        match self.store.read_counter(&self.table).await? {
            Some(stored) => Ok(stored),
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(service = %self.name, table = %self.table, "counter table has no row");
                Ok(0)
            }
        }
    }
}

impl<S> fmt::Debug for Generator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}
