//! sqlx error mapping.

use fulfillment_core::StoreError;

/// SQLSTATEs a caller can retry: lock wait timeout, serialization failure,
/// deadlock and unique violation (a concurrent insert won).
const CONFLICT_CODES: [&str; 4] = ["55P03", "40001", "40P01", "23505"];

/// Convert a sqlx error into a [`StoreError`].
///
/// Missing rows are never reported through here; callers use
/// `fetch_optional` and build [`StoreError::NotFound`] themselves.
#[must_use]
pub fn map_error(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if is_conflict(db.code().as_deref()) => {
            StoreError::Conflict(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut => StoreError::Conflict("connection pool timed out".to_string()),
        _ => StoreError::Database(error.to_string()),
    }
}

fn is_conflict(code: Option<&str>) -> bool {
    code.is_some_and(|code| CONFLICT_CODES.contains(&code))
}

pub(crate) fn decode_error(column: &str, error: impl std::fmt::Display) -> StoreError {
    StoreError::Database(format!("invalid value in column {column}: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_serialization_failures_are_conflicts() {
        for code in ["55P03", "40001", "40P01", "23505"] {
            assert!(is_conflict(Some(code)), "{code}");
        }
        assert!(!is_conflict(Some("23503")));
        assert!(!is_conflict(None));
    }

    #[test]
    fn pool_timeout_is_retriable() {
        assert!(matches!(map_error(sqlx::Error::PoolTimedOut), StoreError::Conflict(_)));
        assert!(matches!(map_error(sqlx::Error::RowNotFound), StoreError::Database(_)));
    }
}
