use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::store::{IsolationLevel, SeatTransaction, StoreError, TxOptions};

use super::{Inner, SeatRow};

/// A row this transaction holds the exclusive lock on.
struct LockedRow {
    row: Arc<SeatRow>,
    /// Uncommitted write, visible only inside this transaction.
    pending: Option<Seat>,
}

/// Row locks held by an open transaction. Once `expired` is set the guards
/// are gone and the transaction can only roll back.
#[derive(Default)]
struct Lease {
    guards: Vec<OwnedMutexGuard<()>>,
    expired: bool,
}

/// Release every row lock of `tx` at its deadline if it is still open.
async fn expire_at(tx: Ulid, deadline: Instant, lease: Arc<Mutex<Lease>>) {
    tokio::time::sleep_until(deadline).await;
    let mut lease = lease.lock().await;
    lease.expired = true;
    if !lease.guards.is_empty() {
        warn!(tx = %tx, rows = lease.guards.len(), "deadline passed, releasing row locks");
        lease.guards.clear();
    }
}

impl LockedRow {
    async fn current(&self) -> Seat {
        match &self.pending {
            Some(seat) => seat.clone(),
            None => self.row.seat().await,
        }
    }
}

/// Transaction over a `MemoryStore`.
///
/// Row locks are acquired on first touch and released when the transaction
/// commits, rolls back, is dropped or reaches its deadline. A transaction past
/// its deadline keeps no locks and fails every later statement.
pub struct MemoryTransaction {
    id: Ulid,
    inner: Arc<Inner>,
    isolation: IsolationLevel,
    deadline: Instant,
    /// Commit sequence number visible to the first statement.
    snapshot: Option<u64>,
    rows: BTreeMap<SeatId, LockedRow>,
    lease: Arc<Mutex<Lease>>,
    expiry: JoinHandle<()>,
}

impl MemoryTransaction {
    pub(super) fn new(inner: Arc<Inner>, opts: TxOptions) -> Self {
        metrics::gauge!(observability::TRANSACTIONS_ACTIVE).increment(1.0);
        let id = Ulid::new();
        debug!(tx = %id, isolation = ?opts.isolation, timeout = ?opts.timeout, "begin");
        let deadline = Instant::now() + opts.timeout;
        let lease = Arc::new(Mutex::new(Lease::default()));
        let expiry = tokio::spawn(expire_at(id, deadline, lease.clone()));
        Self {
            id,
            inner,
            isolation: opts.isolation,
            deadline,
            snapshot: None,
            rows: BTreeMap::new(),
            lease,
            expiry,
        }
    }

    /// Take the row lock (waiting up to the deadline) unless already held.
    /// `Ok(None)` means the row does not exist.
    async fn lock_row(&mut self, seat_id: SeatId) -> Result<Option<&mut LockedRow>, StoreError> {
        if self.lease.lock().await.expired {
            return Err(StoreError::TransactionExpired);
        }
        let snapshot = *self
            .snapshot
            .get_or_insert_with(|| self.inner.commit_seq.load(Ordering::SeqCst));

        if !self.rows.contains_key(&seat_id) {
            let Some(row) = self.inner.seat_row(seat_id) else {
                return Ok(None);
            };
            let wait_start = Instant::now();
            let guard = match tokio::time::timeout_at(self.deadline, row.lock.clone().lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(tx = %self.id, seat_id, "row lock not granted before deadline");
                    return Err(StoreError::LockTimeout);
                }
            };
            let waited = wait_start.elapsed();
            metrics::histogram!(observability::LOCK_WAIT_SECONDS).record(waited.as_secs_f64());
            debug!(tx = %self.id, seat_id, ?waited, "row lock granted");

            if self.isolation.uses_transaction_snapshot()
                && row.committed.read().await.commit_seq > snapshot
            {
                debug!(tx = %self.id, seat_id, "row changed after snapshot");
                return Err(StoreError::SerializationFailure);
            }
            {
                let mut lease = self.lease.lock().await;
                if lease.expired {
                    return Err(StoreError::TransactionExpired);
                }
                lease.guards.push(guard);
            }
            self.rows.insert(seat_id, LockedRow { row, pending: None });
        }
        Ok(self.rows.get_mut(&seat_id))
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.expiry.abort();
        // The aborted task may still own the lease for a while; release the
        // rows now. A failed `try_lock` means expiry is clearing them already.
        if let Ok(mut lease) = self.lease.try_lock() {
            lease.guards.clear();
        }
        metrics::gauge!(observability::TRANSACTIONS_ACTIVE).decrement(1.0);
    }
}

#[async_trait]
impl SeatTransaction for MemoryTransaction {
    fn id(&self) -> Ulid {
        self.id
    }

    async fn select_for_update(&mut self, seat_id: SeatId) -> Result<Option<Seat>, StoreError> {
        match self.lock_row(seat_id).await? {
            Some(locked) => Ok(Some(locked.current().await)),
            None => Ok(None),
        }
    }

    async fn claim_if_version(
        &mut self,
        seat_id: SeatId,
        expected: Version,
        owner: UserId,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.clone();
        let Some(locked) = self.lock_row(seat_id).await? else {
            return Ok(0);
        };
        let current = locked.current().await;
        if current.version != expected {
            return Ok(0);
        }
        inner.check_owner(owner)?;
        locked.pending = Some(current.claimed(owner));
        Ok(1)
    }

    fn deadline(&self) -> Instant {
        self.deadline
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        // Holding the lease keeps the expiry task from releasing rows mid-publish.
        let lease = self.lease.lock().await;
        if lease.expired || Instant::now() > self.deadline {
            warn!(tx = %self.id, "commit after deadline, rolling back");
            return Err(StoreError::TransactionExpired);
        }
        let writes: Vec<(Arc<SeatRow>, Seat)> = self
            .rows
            .values()
            .filter_map(|locked| locked.pending.clone().map(|seat| (locked.row.clone(), seat)))
            .collect();
        let written = writes.len();
        self.inner.commit_claims(writes).await?;
        drop(lease);
        debug!(tx = %self.id, rows = written, "commit");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        debug!(tx = %self.id, rows = self.rows.len(), "rollback");
        Ok(())
    }
}
