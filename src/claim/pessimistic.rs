use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::model::*;
use crate::store::{SeatStore, SeatTransaction, StoreError, TxOptions};

use super::LockedOutcome;

/// How the row lock is taken inside the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStrategy {
    /// The conditional update itself takes the lock.
    #[default]
    ConditionalUpdate,
    /// `SELECT ... FOR UPDATE` first, then compare versions and update.
    SelectForUpdate,
}

/// Parameters of one lock-hold claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockHold {
    pub tx: TxOptions,
    /// Time the transaction stays open after the write, before commit.
    pub hold: Duration,
    pub strategy: LockStrategy,
}

impl LockHold {
    pub fn new(tx: TxOptions) -> Self {
        Self {
            tx,
            ..Self::default()
        }
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    pub fn with_strategy(mut self, strategy: LockStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Claim `seat_id` inside a transaction that keeps the row locked until it
/// commits.
///
/// A second caller racing on the same row blocks on the lock; once the first
/// commits it re-evaluates its version condition against the committed row
/// and reports `ConflictAfterWait`. Lock waits past the transaction timeout,
/// or a hold that outlives it, report `TimedOut` and leave the row untouched.
/// A hold that outlives the timeout ends at the deadline, so waiters behind
/// it can still claim the row.
pub async fn attempt_claim_locked<S>(
    store: &S,
    seat_id: SeatId,
    owner_id: UserId,
    params: &LockHold,
) -> Result<LockedOutcome, StoreError>
where
    S: SeatStore + ?Sized,
{
    let snapshot = store
        .get_seat(seat_id)
        .await?
        .ok_or(StoreError::NotFound { entity: "seat", id: seat_id })?;
    if let Some(owner) = snapshot.claimed_by {
        return Ok(LockedOutcome::AlreadyClaimed { owner_id: owner });
    }

    let mut tx = store.begin(params.tx).await?;
    let tx_id = tx.id();

    let written = write_and_hold(tx.as_mut(), &snapshot, owner_id, params).await;
    match written {
        Ok(true) => match tx.commit().await {
            Ok(()) => Ok(LockedOutcome::Claimed {
                version: snapshot.version + 1,
            }),
            Err(e) => settle_error(store, &snapshot, e).await,
        },
        Ok(false) => {
            rollback(tx).await;
            conflict_after_wait(store, &snapshot).await
        }
        Err(e) => {
            debug!(tx = %tx_id, seat_id, "claim failed inside transaction: {e}");
            rollback(tx).await;
            settle_error(store, &snapshot, e).await
        }
    }
}

/// Take the lock via the chosen strategy, write, then hold. `Ok(false)` means
/// the row no longer matched our snapshot once the lock was ours.
async fn write_and_hold(
    tx: &mut dyn SeatTransaction,
    snapshot: &Seat,
    owner_id: UserId,
    params: &LockHold,
) -> Result<bool, StoreError> {
    let rows = match params.strategy {
        LockStrategy::ConditionalUpdate => {
            tx.claim_if_version(snapshot.id, snapshot.version, owner_id)
                .await?
        }
        LockStrategy::SelectForUpdate => {
            let Some(locked) = tx.select_for_update(snapshot.id).await? else {
                return Ok(false);
            };
            if locked.version != snapshot.version {
                return Ok(false);
            }
            tx.claim_if_version(snapshot.id, snapshot.version, owner_id)
                .await?
        }
    };
    if rows == 0 {
        return Ok(false);
    }

    if !params.hold.is_zero() {
        debug!(tx = %tx.id(), seat_id = snapshot.id, hold = ?params.hold, "holding row lock");
        let release = Instant::now() + params.hold;
        let deadline = tx.deadline();
        if release > deadline {
            // Stop at the deadline; the rollback frees the row for waiters.
            tokio::time::sleep_until(deadline).await;
            return Err(StoreError::TransactionExpired);
        }
        tokio::time::sleep_until(release).await;
    }
    Ok(true)
}

async fn rollback(tx: Box<dyn SeatTransaction>) {
    let tx_id = tx.id();
    if let Err(e) = tx.rollback().await {
        warn!(tx = %tx_id, "rollback failed: {e}");
    }
}

/// Timeouts and serialization failures are protocol outcomes; anything else
/// is a store fault.
async fn settle_error<S>(store: &S, snapshot: &Seat, e: StoreError) -> Result<LockedOutcome, StoreError>
where
    S: SeatStore + ?Sized,
{
    if e.is_timeout() {
        return Ok(LockedOutcome::TimedOut);
    }
    if e.is_conflict() {
        return conflict_after_wait(store, snapshot).await;
    }
    Err(e)
}

async fn conflict_after_wait<S>(store: &S, snapshot: &Seat) -> Result<LockedOutcome, StoreError>
where
    S: SeatStore + ?Sized,
{
    let seen_version = store
        .get_seat(snapshot.id)
        .await?
        .map_or(snapshot.version, |seat| seat.version);
    Ok(LockedOutcome::ConflictAfterWait { seen_version })
}
