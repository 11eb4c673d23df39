//! `SeatStore` over PostgreSQL.
//!
//! Expects this schema (not created here):
//!
//! ```sql
//! CREATE TABLE movies (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL UNIQUE);
//! CREATE TABLE users  (id BIGSERIAL PRIMARY KEY, email TEXT NOT NULL UNIQUE, name TEXT);
//! CREATE TABLE seats  (
//!     id         BIGSERIAL PRIMARY KEY,
//!     movie_id   BIGINT NOT NULL REFERENCES movies (id) ON DELETE RESTRICT,
//!     claimed_by BIGINT REFERENCES users (id) ON DELETE SET NULL,
//!     version    BIGINT NOT NULL DEFAULT 0
//! );
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{SeatStore, SeatTransaction, StoreError, TxOptions};

const SEAT_COLUMNS: &str = "id, movie_id, claimed_by, version";

pub struct PgStore {
    config: tokio_postgres::Config,
    /// Autocommit statements share this connection.
    client: Client,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let config: tokio_postgres::Config = url
            .parse()
            .map_err(|e: tokio_postgres::Error| StoreError::Unavailable(e.to_string()))?;
        let client = open(&config).await?;
        Ok(Self { config, client })
    }
}

/// Open a connection and drive it on its own task.
async fn open(config: &tokio_postgres::Config) -> Result<Client, StoreError> {
    let (client, connection) = config
        .connect(NoTls)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("postgres connection error: {e}");
        }
    });
    Ok(client)
}

fn map_err(e: tokio_postgres::Error) -> StoreError {
    if e.is_closed() {
        return StoreError::Unavailable(e.to_string());
    }
    let message = || {
        e.as_db_error()
            .map_or_else(|| e.to_string(), |db| db.message().to_string())
    };
    match e.code() {
        Some(code) if *code == SqlState::LOCK_NOT_AVAILABLE || *code == SqlState::QUERY_CANCELED => {
            StoreError::LockTimeout
        }
        Some(code)
            if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED =>
        {
            StoreError::SerializationFailure
        }
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => StoreError::UniqueViolation(message()),
        Some(code) if *code == SqlState::FOREIGN_KEY_VIOLATION => {
            StoreError::ForeignKeyViolation(message())
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

/// Milliseconds for a `SET` statement, saturating instead of wrapping.
fn whole_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn seat_from_row(row: &Row) -> Result<Seat, StoreError> {
    Ok(Seat {
        id: row.try_get("id").map_err(map_err)?,
        movie_id: row.try_get("movie_id").map_err(map_err)?,
        claimed_by: row.try_get("claimed_by").map_err(map_err)?,
        version: row.try_get("version").map_err(map_err)?,
    })
}

#[async_trait]
impl SeatStore for PgStore {
    async fn create_movie(&self, name: &str) -> Result<Movie, StoreError> {
        if name.len() > MAX_MOVIE_NAME_LEN {
            return Err(StoreError::LimitExceeded("movie name too long"));
        }
        let row = self
            .client
            .query_one("INSERT INTO movies (name) VALUES ($1) RETURNING id", &[&name])
            .await
            .map_err(map_err)?;
        Ok(Movie {
            id: row.try_get("id").map_err(map_err)?,
            name: name.to_string(),
        })
    }

    async fn delete_movie(&self, id: MovieId) -> Result<(), StoreError> {
        let rows = self
            .client
            .execute("DELETE FROM movies WHERE id = $1", &[&id])
            .await
            .map_err(map_err)?;
        if rows == 0 {
            return Err(StoreError::NotFound { entity: "movie", id });
        }
        Ok(())
    }

    async fn create_user(&self, email: &str, name: Option<&str>) -> Result<User, StoreError> {
        if email.len() > MAX_EMAIL_LEN {
            return Err(StoreError::LimitExceeded("email too long"));
        }
        if name.is_some_and(|n| n.len() > MAX_USER_NAME_LEN) {
            return Err(StoreError::LimitExceeded("user name too long"));
        }
        let row = self
            .client
            .query_one(
                "INSERT INTO users (email, name) VALUES ($1, $2) RETURNING id",
                &[&email, &name],
            )
            .await
            .map_err(map_err)?;
        Ok(User {
            id: row.try_get("id").map_err(map_err)?,
            email: email.to_string(),
            name: name.map(str::to_string),
        })
    }

    async fn delete_user(&self, id: UserId) -> Result<(), StoreError> {
        let rows = self
            .client
            .execute("DELETE FROM users WHERE id = $1", &[&id])
            .await
            .map_err(map_err)?;
        if rows == 0 {
            return Err(StoreError::NotFound { entity: "user", id });
        }
        Ok(())
    }

    async fn create_seat(&self, movie_id: MovieId) -> Result<Seat, StoreError> {
        let sql = format!("INSERT INTO seats (movie_id) VALUES ($1) RETURNING {SEAT_COLUMNS}");
        let row = self
            .client
            .query_one(sql.as_str(), &[&movie_id])
            .await
            .map_err(map_err)?;
        seat_from_row(&row)
    }

    async fn get_seat(&self, id: SeatId) -> Result<Option<Seat>, StoreError> {
        let sql = format!("SELECT {SEAT_COLUMNS} FROM seats WHERE id = $1");
        let row = self
            .client
            .query_opt(sql.as_str(), &[&id])
            .await
            .map_err(map_err)?;
        row.as_ref().map(seat_from_row).transpose()
    }

    async fn seats_for_movie(&self, movie_id: MovieId) -> Result<Vec<Seat>, StoreError> {
        let sql = format!("SELECT {SEAT_COLUMNS} FROM seats WHERE movie_id = $1 ORDER BY id");
        let rows = self
            .client
            .query(sql.as_str(), &[&movie_id])
            .await
            .map_err(map_err)?;
        rows.iter().map(seat_from_row).collect()
    }

    async fn find_unclaimed_seat(&self, movie_id: MovieId) -> Result<Option<Seat>, StoreError> {
        let sql = format!(
            "SELECT {SEAT_COLUMNS} FROM seats \
             WHERE movie_id = $1 AND claimed_by IS NULL ORDER BY id LIMIT 1"
        );
        let row = self
            .client
            .query_opt(sql.as_str(), &[&movie_id])
            .await
            .map_err(map_err)?;
        row.as_ref().map(seat_from_row).transpose()
    }

    async fn claim_if_version(
        &self,
        seat_id: SeatId,
        expected: Version,
        owner: UserId,
    ) -> Result<u64, StoreError> {
        self.client
            .execute(
                "UPDATE seats SET claimed_by = $3, version = version + 1 \
                 WHERE id = $1 AND version = $2",
                &[&seat_id, &expected, &owner],
            )
            .await
            .map_err(map_err)
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn SeatTransaction>, StoreError> {
        opts.validate()?;
        // A transaction owns its connection so it can outlive any borrow of `self`.
        let client = open(&self.config).await?;
        // The server ends a session left idle in the transaction past the
        // timeout, which releases its row locks.
        let idle_ms = whole_millis(opts.timeout);
        client
            .batch_execute(&format!(
                "BEGIN ISOLATION LEVEL {}; SET LOCAL idle_in_transaction_session_timeout = {idle_ms}",
                opts.isolation.as_sql()
            ))
            .await
            .map_err(map_err)?;
        metrics::gauge!(observability::TRANSACTIONS_ACTIVE).increment(1.0);
        let id = Ulid::new();
        debug!(tx = %id, isolation = ?opts.isolation, "begin");
        Ok(Box::new(PgTransaction {
            id,
            client,
            deadline: Instant::now() + opts.timeout,
        }))
    }
}

/// Dropping it closes the connection, which rolls the transaction back
/// server-side.
pub struct PgTransaction {
    id: Ulid,
    client: Client,
    deadline: Instant,
}

impl PgTransaction {
    /// Bound the next lock wait by what is left of the deadline.
    async fn arm_lock_timeout(&self) -> Result<(), StoreError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let ms = whole_millis(remaining);
        if ms == 0 {
            return Err(StoreError::LockTimeout);
        }
        self.client
            .batch_execute(&format!("SET LOCAL lock_timeout = {ms}"))
            .await
            .map_err(map_err)
    }

    async fn finish(&self, statement: &str) -> Result<(), StoreError> {
        self.client.batch_execute(statement).await.map_err(map_err)
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        metrics::gauge!(observability::TRANSACTIONS_ACTIVE).decrement(1.0);
    }
}

#[async_trait]
impl SeatTransaction for PgTransaction {
    fn id(&self) -> Ulid {
        self.id
    }

    fn deadline(&self) -> Instant {
        self.deadline
    }

    async fn select_for_update(&mut self, seat_id: SeatId) -> Result<Option<Seat>, StoreError> {
        self.arm_lock_timeout().await?;
        let sql = format!("SELECT {SEAT_COLUMNS} FROM seats WHERE id = $1 FOR UPDATE");
        let wait_start = Instant::now();
        let row = self
            .client
            .query_opt(sql.as_str(), &[&seat_id])
            .await
            .map_err(map_err)?;
        metrics::histogram!(observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());
        row.as_ref().map(seat_from_row).transpose()
    }

    async fn claim_if_version(
        &mut self,
        seat_id: SeatId,
        expected: Version,
        owner: UserId,
    ) -> Result<u64, StoreError> {
        self.arm_lock_timeout().await?;
        let wait_start = Instant::now();
        let rows = self
            .client
            .execute(
                "UPDATE seats SET claimed_by = $3, version = version + 1 \
                 WHERE id = $1 AND version = $2",
                &[&seat_id, &expected, &owner],
            )
            .await
            .map_err(map_err)?;
        metrics::histogram!(observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());
        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if Instant::now() > self.deadline {
            warn!(tx = %self.id, "commit after deadline, rolling back");
            if let Err(e) = self.finish("ROLLBACK").await {
                warn!(tx = %self.id, "rollback failed: {e}");
            }
            return Err(StoreError::TransactionExpired);
        }
        self.finish("COMMIT").await?;
        debug!(tx = %self.id, "commit");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK").await?;
        debug!(tx = %self.id, "rollback");
        Ok(())
    }
}
