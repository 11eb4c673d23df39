#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound { entity: &'static str, id: i64 },
    UniqueViolation(String),
    ForeignKeyViolation(String),
    /// A row lock was not granted before the transaction deadline.
    LockTimeout,
    /// The transaction outlived its deadline and was rolled back.
    TransactionExpired,
    /// A repeatable-read/serializable transaction touched a row committed
    /// after its snapshot.
    SerializationFailure,
    LimitExceeded(&'static str),
    Unavailable(String),
    Wal(String),
    Backend(String),
}

impl StoreError {
    /// Lock wait or transaction lifetime ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::LockTimeout | StoreError::TransactionExpired)
    }

    /// Lost a race against another writer (as opposed to an infrastructure fault).
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::SerializationFailure)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            StoreError::UniqueViolation(what) => write!(f, "unique constraint violated: {what}"),
            StoreError::ForeignKeyViolation(what) => {
                write!(f, "foreign key constraint violated: {what}")
            }
            StoreError::LockTimeout => write!(f, "row lock not granted before transaction timeout"),
            StoreError::TransactionExpired => write!(f, "transaction expired and was rolled back"),
            StoreError::SerializationFailure => {
                write!(f, "could not serialize access due to concurrent update")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
            StoreError::Backend(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_conflicts_are_distinct_from_faults() {
        assert!(StoreError::LockTimeout.is_timeout());
        assert!(StoreError::TransactionExpired.is_timeout());
        assert!(StoreError::SerializationFailure.is_conflict());

        let fault = StoreError::Unavailable("connection refused".into());
        assert!(!fault.is_timeout());
        assert!(!fault.is_conflict());
    }

    #[test]
    fn not_found_names_entity() {
        let e = StoreError::NotFound { entity: "seat", id: 12 };
        assert_eq!(e.to_string(), "seat not found: 12");
    }
}
