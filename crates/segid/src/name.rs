use crate::{Error, Result};

/// Longest table identifier accepted, prefix included (MySQL's limit).
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Returns `true` if `ident` is non-empty and made only of ASCII letters,
/// digits and `_`.
///
/// Service and registry names end up interpolated into DDL, so anything
/// outside this charset is refused rather than quoted.
pub fn is_identifier(ident: &str) -> bool {
    !ident.is_empty()
        && ident
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Validates a service name and returns it trimmed.
///
/// # Errors
///
/// Returns [`Error::InvalidName`] if the trimmed name is empty, contains
/// characters outside `[A-Za-z0-9_]`, or would produce a table name longer
/// than [`MAX_IDENTIFIER_LEN`] once `table_prefix` is prepended.
pub fn validate_service_name<'a>(name: &'a str, table_prefix: &str) -> Result<&'a str> {
    let name = name.trim();
    let reason = if name.is_empty() {
        "service key is required"
    } else if !is_identifier(name) {
        "service key may only contain ASCII letters, digits and '_'"
    } else if table_prefix.len() + name.len() > MAX_IDENTIFIER_LEN {
        "service key is too long"
    } else {
        return Ok(name);
    };

    Err(Error::InvalidName {
        name: name.to_owned(),
        reason,
    })
}

/// Name of the counter table that backs `service`.
pub fn table_name(table_prefix: &str, service: &str) -> String {
    format!("{table_prefix}{service}")
}
