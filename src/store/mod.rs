mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use ulid::Ulid;

use crate::limits::{DEFAULT_TX_TIMEOUT, MAX_TX_TIMEOUT};
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Statements see a snapshot fixed at the first statement of the transaction.
    pub fn uses_transaction_snapshot(self) -> bool {
        !matches!(self, IsolationLevel::ReadCommitted)
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Parse `read_committed` / `repeatable_read` / `serializable`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_committed" => Some(IsolationLevel::ReadCommitted),
            "repeatable_read" => Some(IsolationLevel::RepeatableRead),
            "serializable" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

/// Parameters of a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    /// Bounds the whole transaction: lock waits, hold time and commit.
    pub timeout: Duration,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            timeout: DEFAULT_TX_TIMEOUT,
        }
    }
}

impl TxOptions {
    pub fn new(isolation: IsolationLevel, timeout: Duration) -> Self {
        Self { isolation, timeout }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.timeout.is_zero() {
            return Err(StoreError::LimitExceeded("transaction timeout must be positive"));
        }
        if self.timeout > MAX_TX_TIMEOUT {
            return Err(StoreError::LimitExceeded("transaction timeout too long"));
        }
        Ok(())
    }
}

/// The persistent store holding movies, users and seats.
///
/// Reads never block on row locks. Writes (`claim_if_version`, user deletion)
/// wait for any transaction holding the row lock to finish.
#[async_trait]
pub trait SeatStore: Send + Sync {
    async fn create_movie(&self, name: &str) -> Result<Movie, StoreError>;

    /// Fails with `ForeignKeyViolation` while the movie still owns seats.
    async fn delete_movie(&self, id: MovieId) -> Result<(), StoreError>;

    async fn create_user(&self, email: &str, name: Option<&str>) -> Result<User, StoreError>;

    /// Nullifies every claim the user holds; seat versions are left alone.
    async fn delete_user(&self, id: UserId) -> Result<(), StoreError>;

    async fn create_seat(&self, movie_id: MovieId) -> Result<Seat, StoreError>;

    async fn get_seat(&self, id: SeatId) -> Result<Option<Seat>, StoreError>;

    /// All seats of a movie, ascending by id.
    async fn seats_for_movie(&self, movie_id: MovieId) -> Result<Vec<Seat>, StoreError>;

    /// Lowest-id unclaimed seat of the movie, from committed state.
    async fn find_unclaimed_seat(&self, movie_id: MovieId) -> Result<Option<Seat>, StoreError>;

    /// Autocommit `UPDATE seat SET claimed_by = owner, version = version + 1
    /// WHERE id = seat_id AND version = expected`. Returns rows affected.
    async fn claim_if_version(
        &self,
        seat_id: SeatId,
        expected: Version,
        owner: UserId,
    ) -> Result<u64, StoreError>;

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn SeatTransaction>, StoreError>;
}

/// An open transaction. Row locks taken inside it are held until
/// `commit`/`rollback` or its deadline, whichever comes first; dropping it
/// rolls back.
#[async_trait]
pub trait SeatTransaction: Send {
    fn id(&self) -> Ulid;

    /// `begin` time plus `TxOptions::timeout`.
    fn deadline(&self) -> Instant;

    /// `SELECT ... FOR UPDATE`: take the exclusive row lock and return the row.
    async fn select_for_update(&mut self, seat_id: SeatId) -> Result<Option<Seat>, StoreError>;

    /// The conditional update of `SeatStore::claim_if_version`, taking the row
    /// lock first and evaluating the condition once it is granted.
    async fn claim_if_version(
        &mut self,
        seat_id: SeatId,
        expected: Version,
        owner: UserId,
    ) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_isolation_levels() {
        assert_eq!(IsolationLevel::parse("read_committed"), Some(IsolationLevel::ReadCommitted));
        assert_eq!(IsolationLevel::parse("Repeatable Read"), Some(IsolationLevel::RepeatableRead));
        assert_eq!(IsolationLevel::parse("SERIALIZABLE"), Some(IsolationLevel::Serializable));
        assert_eq!(IsolationLevel::parse("snapshot"), None);
    }

    #[test]
    fn tx_options_reject_zero_and_oversized_timeouts() {
        let zero = TxOptions::new(IsolationLevel::ReadCommitted, Duration::ZERO);
        assert!(matches!(zero.validate(), Err(StoreError::LimitExceeded(_))));

        let huge = TxOptions::new(IsolationLevel::ReadCommitted, MAX_TX_TIMEOUT + Duration::from_millis(1));
        assert!(matches!(huge.validate(), Err(StoreError::LimitExceeded(_))));

        assert!(TxOptions::default().validate().is_ok());
    }
}
