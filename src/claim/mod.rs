mod optimistic;
mod outcome;
mod pessimistic;

pub use optimistic::attempt_claim;
pub use outcome::{AttemptOutcome, Claim, ClaimOutcome, LockedOutcome};
pub use pessimistic::{LockHold, LockStrategy, attempt_claim_locked};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::limits::MAX_CLAIM_RETRIES;
use crate::model::*;
use crate::observability;
use crate::store::{IsolationLevel, SeatStore, StoreError, TxOptions};

const OPTIMISTIC: &str = "optimistic";
const PESSIMISTIC: &str = "pessimistic";

/// Defaults the orchestrator applies when a caller does not override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub max_retries: u32,
    pub tx: TxOptions,
    pub hold: Duration,
    pub strategy: LockStrategy,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            tx: TxOptions::default(),
            hold: Duration::ZERO,
            strategy: LockStrategy::default(),
        }
    }
}

impl ClaimPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            tx: config.tx,
            hold: config.hold,
            strategy: LockStrategy::default(),
        }
    }

    fn lock_hold(&self, tx: TxOptions) -> LockHold {
        LockHold::new(tx)
            .with_hold(self.hold)
            .with_strategy(self.strategy)
    }
}

/// Entry point for claiming seats under either concurrency-control strategy.
///
/// Conflicts, exhaustion and timeouts come back as `Ok(ClaimOutcome)`. Only
/// store faults are `Err`, and those are never retried here.
#[derive(Clone)]
pub struct Claimer {
    store: Arc<dyn SeatStore>,
    policy: ClaimPolicy,
}

impl Claimer {
    pub fn new(store: Arc<dyn SeatStore>, policy: ClaimPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn SeatStore> {
        &self.store
    }

    /// Claim any free seat of `movie_id` with the version stamp protocol,
    /// re-running the full read-then-write cycle on conflict up to
    /// `max_retries` times.
    pub async fn claim_optimistic(
        &self,
        movie_id: MovieId,
        owner_id: UserId,
        max_retries: u32,
    ) -> Result<ClaimOutcome, StoreError> {
        let start = Instant::now();
        let result = self.run_optimistic(movie_id, owner_id, max_retries).await;
        record(OPTIMISTIC, &result, start);
        result
    }

    /// `claim_optimistic` with the policy's retry budget.
    pub async fn claim_optimistic_default(
        &self,
        movie_id: MovieId,
        owner_id: UserId,
    ) -> Result<ClaimOutcome, StoreError> {
        self.claim_optimistic(movie_id, owner_id, self.policy.max_retries)
            .await
    }

    /// Claim `seat_id` with the lock-hold protocol, using the policy's hold
    /// duration and lock strategy.
    pub async fn claim_pessimistic(
        &self,
        seat_id: SeatId,
        owner_id: UserId,
        isolation: IsolationLevel,
        timeout: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let params = self.policy.lock_hold(TxOptions::new(isolation, timeout));
        self.claim_pessimistic_with(seat_id, owner_id, params).await
    }

    /// `claim_pessimistic` with the policy's transaction options.
    pub async fn claim_pessimistic_default(
        &self,
        seat_id: SeatId,
        owner_id: UserId,
    ) -> Result<ClaimOutcome, StoreError> {
        let params = self.policy.lock_hold(self.policy.tx);
        self.claim_pessimistic_with(seat_id, owner_id, params).await
    }

    pub async fn claim_pessimistic_with(
        &self,
        seat_id: SeatId,
        owner_id: UserId,
        params: LockHold,
    ) -> Result<ClaimOutcome, StoreError> {
        let start = Instant::now();
        let result = self.run_pessimistic(seat_id, owner_id, &params).await;
        record(PESSIMISTIC, &result, start);
        result
    }

    /// Pick the lowest free seat of `movie_id`, then claim it with the
    /// lock-hold protocol. Losing that seat to a racer is a `Conflict`; no
    /// other seat is tried.
    pub async fn claim_pessimistic_any(
        &self,
        movie_id: MovieId,
        owner_id: UserId,
        params: LockHold,
    ) -> Result<ClaimOutcome, StoreError> {
        let start = Instant::now();
        let result = match self.store.find_unclaimed_seat(movie_id).await {
            Ok(Some(seat)) => self.run_pessimistic(seat.id, owner_id, &params).await,
            Ok(None) => Ok(ClaimOutcome::Exhausted),
            Err(e) => Err(e),
        };
        record(PESSIMISTIC, &result, start);
        result
    }

    async fn run_optimistic(
        &self,
        movie_id: MovieId,
        owner_id: UserId,
        max_retries: u32,
    ) -> Result<ClaimOutcome, StoreError> {
        let retries = if max_retries > MAX_CLAIM_RETRIES {
            warn!(max_retries, cap = MAX_CLAIM_RETRIES, "retry budget clamped");
            MAX_CLAIM_RETRIES
        } else {
            max_retries
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > 1 {
                metrics::counter!(observability::CLAIM_RETRIES_TOTAL).increment(1);
            }
            match attempt_claim(self.store.as_ref(), movie_id, owner_id).await? {
                AttemptOutcome::Claimed { seat_id, version } => {
                    info!(movie_id, seat_id, owner_id, version, attempts, "seat claimed");
                    return Ok(ClaimOutcome::Success(Claim {
                        seat_id,
                        owner_id,
                        version,
                        attempts,
                    }));
                }
                AttemptOutcome::NoSeatAvailable => {
                    debug!(movie_id, owner_id, attempts, "movie sold out");
                    return Ok(ClaimOutcome::Exhausted);
                }
                AttemptOutcome::Conflict { seat_id, .. } => {
                    if attempts > retries {
                        info!(movie_id, seat_id, owner_id, attempts, "claim lost to a concurrent writer");
                        return Ok(ClaimOutcome::Conflict { seat_id });
                    }
                    debug!(movie_id, seat_id, owner_id, attempts, "conflict, retrying from read");
                }
            }
        }
    }

    async fn run_pessimistic(
        &self,
        seat_id: SeatId,
        owner_id: UserId,
        params: &LockHold,
    ) -> Result<ClaimOutcome, StoreError> {
        let outcome = attempt_claim_locked(self.store.as_ref(), seat_id, owner_id, params).await?;
        Ok(match outcome {
            LockedOutcome::Claimed { version } => {
                info!(seat_id, owner_id, version, "seat claimed under lock");
                ClaimOutcome::Success(Claim {
                    seat_id,
                    owner_id,
                    version,
                    attempts: 1,
                })
            }
            LockedOutcome::ConflictAfterWait { seen_version } => {
                info!(seat_id, owner_id, seen_version, "seat taken while waiting for lock");
                ClaimOutcome::Conflict { seat_id }
            }
            LockedOutcome::AlreadyClaimed { owner_id: holder } => {
                debug!(seat_id, owner_id, holder, "seat already claimed");
                ClaimOutcome::Conflict { seat_id }
            }
            LockedOutcome::TimedOut => {
                warn!(
                    seat_id,
                    owner_id,
                    timeout = ?params.tx.timeout,
                    "lock-hold claim timed out"
                );
                ClaimOutcome::Timeout { seat_id }
            }
        })
    }
}

fn record(strategy: &'static str, result: &Result<ClaimOutcome, StoreError>, start: Instant) {
    let outcome = match result {
        Ok(outcome) => outcome.label(),
        Err(_) => "store_error",
    };
    metrics::counter!(observability::CLAIMS_TOTAL, "strategy" => strategy, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(observability::CLAIM_DURATION_SECONDS, "strategy" => strategy)
        .record(start.elapsed().as_secs_f64());
}
