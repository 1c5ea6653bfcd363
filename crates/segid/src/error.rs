//! Error types for the allocation engine.
//!
//! Every fallible [`Generator`](crate::Generator) and
//! [`Manager`](crate::Manager) operation returns [`Error`]. The variants keep
//! the kinds that callers need to tell apart:
//!
//! - `ServiceNotFound`: the name is not in the in-memory registry. Protocol
//!   servers map this to a nil reply instead of an error.
//! - `InvalidName`: the name cannot be used as (part of) a table identifier.
//! - `MissingCounterRow`: a provisioned table has no seed row. This is never
//!   repaired automatically.
//! - `CounterOverflow`: the next lease would not fit in an `i64`.
//! - `Store`: any backend failure, carried verbatim.
//! - `Compensation`: a store failure whose cleanup step failed as well.

/// Boxed error used to carry backend failures without naming their type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for id allocation and service provisioning.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The service is not registered in this process.
    #[error("service name not exists")]
    ServiceNotFound { name: String },

    /// The service name was rejected before touching the store.
    #[error("{reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The counter table exists but holds no row to lease from.
    #[error("{name}: have no id row")]
    MissingCounterRow { name: String },

    /// Advancing the stored counter by one segment would overflow.
    #[error("{name}: counter overflow at {stored}")]
    CounterOverflow { name: String, stored: i64 },

    /// The backing store failed. Any open transaction was rolled back.
    #[error("{source}")]
    Store {
        #[source]
        source: BoxError,
    },

    /// A store operation failed and the compensating cleanup failed too.
    #[error("{source} (cleanup failed: {cleanup})")]
    Compensation {
        #[source]
        source: Box<Error>,
        cleanup: Box<Error>,
    },
}

impl Error {
    /// Wraps any backend error as [`Error::Store`].
    pub fn store<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Store { source: err.into() }
    }

    pub(crate) fn not_found(name: &str) -> Self {
        Self::ServiceNotFound {
            name: name.to_owned(),
        }
    }

    /// Returns `true` for [`Error::ServiceNotFound`].
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ServiceNotFound { .. })
    }

    /// Returns `true` when the caller supplied something unusable, as opposed
    /// to the store or the persisted state being at fault.
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidName { .. })
    }
}

#[cfg(feature = "sql")]
impl From<sea_orm::DbErr> for Error {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_wire_replies() {
        assert_eq!(
            Error::not_found("orders").to_string(),
            "service name not exists"
        );
        assert_eq!(
            Error::MissingCounterRow {
                name: "orders".into()
            }
            .to_string(),
            "orders: have no id row"
        );
        assert_eq!(
            Error::store("Table 'ids.gid_key_orders' doesn't exist").to_string(),
            "Table 'ids.gid_key_orders' doesn't exist"
        );
    }

    #[test]
    fn compensation_keeps_both_failures() {
        let err = Error::Compensation {
            source: Box::new(Error::store("duplicate entry")),
            cleanup: Box::new(Error::store("lost connection")),
        };
        assert_eq!(
            err.to_string(),
            "duplicate entry (cleanup failed: lost connection)"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn kind_predicates() {
        assert!(Error::not_found("x").is_not_found());
        assert!(!Error::store("boom").is_not_found());
        assert!(
            Error::InvalidName {
                name: String::new(),
                reason: "service key is required"
            }
            .is_invalid_argument()
        );
    }
}
