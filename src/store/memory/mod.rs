mod txn;

pub use txn::MemoryTransaction;

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::{SeatStore, SeatTransaction, StoreError, TxOptions};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One committed store mutation; its events are flushed together.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred
                    && !handle_non_append(&mut wal, other)
                {
                    break;
                }
            }
            other => {
                if !handle_non_append(&mut wal, other) {
                    break;
                }
            }
        }
    }
    debug!("WAL writer stopped: {}", wal.path().display());
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns false once the writer should stop.
fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
            true
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            true
        }
        WalCommand::Shutdown { response } => {
            let _ = response.send(wal.flush_sync());
            false
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Rows ─────────────────────────────────────────────────

pub(super) struct Committed {
    pub(super) seat: Seat,
    /// Commit sequence number of the last write to this row.
    pub(super) commit_seq: u64,
}

/// A seat row: the last committed version plus the exclusive row lock.
/// Readers only touch `committed`; writers hold `lock` for as long as their
/// transaction runs.
pub(super) struct SeatRow {
    pub(super) committed: RwLock<Committed>,
    pub(super) lock: Arc<Mutex<()>>,
}

impl SeatRow {
    fn new(seat: Seat) -> Self {
        Self {
            committed: RwLock::new(Committed { seat, commit_seq: 0 }),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub(super) async fn seat(&self) -> Seat {
        self.committed.read().await.seat.clone()
    }
}

pub(super) struct Inner {
    movies: DashMap<MovieId, Movie>,
    movie_names: DashMap<String, MovieId>,
    pub(super) users: DashMap<UserId, User>,
    emails: DashMap<String, UserId>,
    seats: DashMap<SeatId, Arc<SeatRow>>,
    /// Movie → seat ids, ascending.
    movie_seats: DashMap<MovieId, Vec<SeatId>>,
    next_movie: AtomicI64,
    next_user: AtomicI64,
    next_seat: AtomicI64,
    pub(super) commit_seq: AtomicU64,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Claim commits hold it shared while they check and publish owners;
    /// `delete_user` passes through it exclusively once the user is gone.
    owners: RwLock<()>,
    /// Writers hold it shared across WAL-append + apply; compaction holds it
    /// exclusively while it snapshots the state.
    compaction: RwLock<()>,
}

impl Inner {
    fn empty(wal_tx: Option<mpsc::Sender<WalCommand>>) -> Self {
        Self {
            movies: DashMap::new(),
            movie_names: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            seats: DashMap::new(),
            movie_seats: DashMap::new(),
            next_movie: AtomicI64::new(1),
            next_user: AtomicI64::new(1),
            next_seat: AtomicI64::new(1),
            commit_seq: AtomicU64::new(0),
            wal_tx,
            owners: RwLock::new(()),
            compaction: RwLock::new(()),
        }
    }

    pub(super) fn seat_row(&self, id: SeatId) -> Option<Arc<SeatRow>> {
        self.seats.get(&id).map(|e| e.value().clone())
    }

    fn movie_seat_ids(&self, movie_id: MovieId) -> Vec<SeatId> {
        self.movie_seats
            .get(&movie_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Write events to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub(super) fn check_owner(&self, owner: UserId) -> Result<(), StoreError> {
        if self.users.contains_key(&owner) {
            Ok(())
        } else {
            Err(StoreError::ForeignKeyViolation(format!(
                "seats.claimed_by references missing user {owner}"
            )))
        }
    }

    /// Persist claim events for `writes`, then publish the new rows under one
    /// commit sequence number. Caller holds every row lock involved.
    ///
    /// Owners are checked again here: a user deleted after the write was
    /// staged fails the commit with `ForeignKeyViolation`.
    pub(super) async fn commit_claims(&self, writes: Vec<(Arc<SeatRow>, Seat)>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let _owners = self.owners.read().await;
        for owner in writes.iter().filter_map(|(_, seat)| seat.claimed_by) {
            self.check_owner(owner)?;
        }
        let events = writes
            .iter()
            .filter_map(|(_, seat)| {
                seat.claimed_by.map(|owner_id| Event::SeatClaimed {
                    id: seat.id,
                    owner_id,
                    version: seat.version,
                })
            })
            .collect();

        let _compaction = self.compaction.read().await;
        self.wal_append(events).await?;
        let seq = self.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        for (row, seat) in writes {
            *row.committed.write().await = Committed { seat, commit_seq: seq };
        }
        Ok(())
    }
}

/// In-process seat store with row-level exclusive locks, transaction
/// deadlines and isolation levels, persisted through a group-commit WAL.
///
/// `open` spawns the WAL writer task and must run inside a tokio runtime.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// A store without a WAL. State is lost when the last handle drops.
    pub fn ephemeral() -> Self {
        Self {
            inner: Arc::new(Inner::empty(None)),
        }
    }

    /// Open (or create) a durable store backed by the WAL at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = Inner::empty(Some(wal_tx));
        let replayed = Replay::from_events(&events);
        info!(
            "replayed {} WAL events: {} movies, {} users, {} seats",
            events.len(),
            replayed.movies.len(),
            replayed.users.len(),
            replayed.seats.len()
        );
        replayed.install(&inner);
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Flush and stop the WAL writer. Later writes fail with `StoreError::Wal`.
    pub async fn close(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.inner.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx.send(WalCommand::Shutdown { response: tx }).await.is_err() {
            return Ok(()); // already closed
        }
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.inner.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as the minimal events that recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.inner.wal_tx else {
            return Ok(());
        };
        let inner = &self.inner;
        let _exclusive = inner.compaction.write().await;

        let mut events = vec![Event::IdsReserved {
            movie: inner.next_movie.load(Ordering::SeqCst),
            user: inner.next_user.load(Ordering::SeqCst),
            seat: inner.next_seat.load(Ordering::SeqCst),
        }];

        let mut movies: Vec<Movie> = inner.movies.iter().map(|e| e.value().clone()).collect();
        movies.sort_by_key(|m| m.id);
        events.extend(movies.into_iter().map(|m| Event::MovieCreated { id: m.id, name: m.name }));

        let mut users: Vec<User> = inner.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|u| Event::UserCreated {
            id: u.id,
            email: u.email,
            name: u.name,
        }));

        let rows: Vec<Arc<SeatRow>> = inner.seats.iter().map(|e| e.value().clone()).collect();
        let mut seats = Vec::with_capacity(rows.len());
        for row in rows {
            seats.push(row.seat().await);
        }
        seats.sort_by_key(|s| s.id);
        events.extend(seats.into_iter().map(|s| Event::SeatCreated {
            id: s.id,
            movie_id: s.movie_id,
            claimed_by: s.claimed_by,
            version: s.version,
        }));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }
}

#[async_trait]
impl SeatStore for MemoryStore {
    async fn create_movie(&self, name: &str) -> Result<Movie, StoreError> {
        if name.len() > MAX_MOVIE_NAME_LEN {
            return Err(StoreError::LimitExceeded("movie name too long"));
        }
        let inner = &self.inner;
        let _compaction = inner.compaction.read().await;
        let id = match inner.movie_names.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(StoreError::UniqueViolation(format!("movie name {name:?}")));
            }
            Entry::Vacant(slot) => {
                let id = inner.next_movie.fetch_add(1, Ordering::SeqCst);
                slot.insert(id);
                id
            }
        };

        let movie = Movie { id, name: name.to_string() };
        let event = Event::MovieCreated { id, name: movie.name.clone() };
        if let Err(e) = inner.wal_append(vec![event]).await {
            inner.movie_names.remove(name);
            return Err(e);
        }
        inner.movies.insert(id, movie.clone());
        inner.movie_seats.insert(id, Vec::new());
        Ok(movie)
    }

    async fn delete_movie(&self, id: MovieId) -> Result<(), StoreError> {
        let inner = &self.inner;
        let _compaction = inner.compaction.read().await;
        // A live movie always has a `movie_seats` entry. Checking and removing
        // it under the entry lock keeps `create_seat` from slipping in between.
        match inner.movie_seats.entry(id) {
            Entry::Vacant(_) => return Err(StoreError::NotFound { entity: "movie", id }),
            Entry::Occupied(seats) if !seats.get().is_empty() => {
                return Err(StoreError::ForeignKeyViolation(format!(
                    "movie {id} is still referenced by seats"
                )));
            }
            Entry::Occupied(seats) => {
                seats.remove();
            }
        }

        if let Err(e) = inner.wal_append(vec![Event::MovieDeleted { id }]).await {
            inner.movie_seats.insert(id, Vec::new());
            return Err(e);
        }
        if let Some((_, movie)) = inner.movies.remove(&id) {
            inner.movie_names.remove(&movie.name);
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
        let inner = &self.inner;
        let _compaction = inner.compaction.read().await;
        let id = match inner.emails.entry(email.to_string()) {
            Entry::Occupied(_) => {
                return Err(StoreError::UniqueViolation(format!("user email {email:?}")));
            }
            Entry::Vacant(slot) => {
                let id = inner.next_user.fetch_add(1, Ordering::SeqCst);
                slot.insert(id);
                id
            }
        };

        let user = User {
            id,
            email: email.to_string(),
            name: name.map(str::to_string),
        };
        let event = Event::UserCreated {
            id,
            email: user.email.clone(),
            name: user.name.clone(),
        };
        if let Err(e) = inner.wal_append(vec![event]).await {
            inner.emails.remove(email);
            return Err(e);
        }
        inner.users.insert(id, user.clone());
        Ok(user)
    }

    async fn delete_user(&self, id: UserId) -> Result<(), StoreError> {
        let inner = &self.inner;
        let (_, user) = inner
            .users
            .remove(&id)
            .ok_or(StoreError::NotFound { entity: "user", id })?;
        // Commits that checked this owner before the removal publish before
        // we pass; later ones fail their owner check.
        drop(inner.owners.write().await);

        // Lock the rows it holds in ascending id order to prevent deadlocks.
        let mut ids: Vec<SeatId> = inner.seats.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut held = Vec::new();
        for seat_id in ids {
            let Some(row) = inner.seat_row(seat_id) else { continue };
            if row.seat().await.claimed_by != Some(id) {
                continue;
            }
            let guard = row.lock.clone().lock_owned().await;
            held.push((row, guard));
        }

        let _compaction = inner.compaction.read().await;
        if let Err(e) = inner.wal_append(vec![Event::UserDeleted { id }]).await {
            inner.users.insert(id, user);
            return Err(e);
        }
        let seq = inner.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut released = 0usize;
        for (row, _guard) in &held {
            let mut committed = row.committed.write().await;
            if committed.seat.claimed_by == Some(id) {
                committed.seat.claimed_by = None;
                committed.commit_seq = seq;
                released += 1;
            }
        }
        inner.emails.remove(&user.email);
        debug!("deleted user {id}, released {released} seats");
        Ok(())
    }

    async fn create_seat(&self, movie_id: MovieId) -> Result<Seat, StoreError> {
        let inner = &self.inner;
        let _compaction = inner.compaction.read().await;
        // Reserve the id in the movie's seat list first, so a concurrent
        // `delete_movie` sees the movie as referenced. Readers skip ids whose
        // row does not exist yet.
        let id = {
            let Some(mut ids) = inner.movie_seats.get_mut(&movie_id) else {
                return Err(StoreError::ForeignKeyViolation(format!(
                    "seats.movie_id references missing movie {movie_id}"
                )));
            };
            let id = inner.next_seat.fetch_add(1, Ordering::SeqCst);
            let pos = ids.partition_point(|&s| s < id);
            ids.insert(pos, id);
            id
        };

        let seat = Seat::new(id, movie_id);
        let event = Event::SeatCreated {
            id,
            movie_id,
            claimed_by: None,
            version: 0,
        };
        if let Err(e) = inner.wal_append(vec![event]).await {
            if let Some(mut ids) = inner.movie_seats.get_mut(&movie_id) {
                ids.retain(|&s| s != id);
            }
            return Err(e);
        }
        inner.seats.insert(id, Arc::new(SeatRow::new(seat.clone())));
        Ok(seat)
    }

    async fn get_seat(&self, id: SeatId) -> Result<Option<Seat>, StoreError> {
        match self.inner.seat_row(id) {
            Some(row) => Ok(Some(row.seat().await)),
            None => Ok(None),
        }
    }

    async fn seats_for_movie(&self, movie_id: MovieId) -> Result<Vec<Seat>, StoreError> {
        let mut seats = Vec::new();
        for seat_id in self.inner.movie_seat_ids(movie_id) {
            if let Some(row) = self.inner.seat_row(seat_id) {
                seats.push(row.seat().await);
            }
        }
        Ok(seats)
    }

    async fn find_unclaimed_seat(&self, movie_id: MovieId) -> Result<Option<Seat>, StoreError> {
        for seat_id in self.inner.movie_seat_ids(movie_id) {
            let Some(row) = self.inner.seat_row(seat_id) else { continue };
            let seat = row.seat().await;
            if !seat.is_claimed() {
                return Ok(Some(seat));
            }
        }
        Ok(None)
    }

    async fn claim_if_version(
        &self,
        seat_id: SeatId,
        expected: Version,
        owner: UserId,
    ) -> Result<u64, StoreError> {
        let inner = &self.inner;
        let Some(row) = inner.seat_row(seat_id) else {
            return Ok(0);
        };
        let _row_lock = row.lock.lock().await;
        let current = row.seat().await;
        if current.version != expected {
            return Ok(0);
        }
        inner.check_owner(owner)?;
        inner
            .commit_claims(vec![(row.clone(), current.claimed(owner))])
            .await?;
        Ok(1)
    }

    async fn begin(&self, opts: TxOptions) -> Result<Box<dyn SeatTransaction>, StoreError> {
        opts.validate()?;
        Ok(Box::new(MemoryTransaction::new(self.inner.clone(), opts)))
    }
}

// ── Replay ───────────────────────────────────────────────

/// State rebuilt from WAL events before any row exists.
#[derive(Default)]
struct Replay {
    movies: BTreeMap<MovieId, Movie>,
    users: BTreeMap<UserId, User>,
    seats: BTreeMap<SeatId, Seat>,
    next_movie: MovieId,
    next_user: UserId,
    next_seat: SeatId,
}

impl Replay {
    fn from_events(events: &[Event]) -> Self {
        let mut r = Replay {
            next_movie: 1,
            next_user: 1,
            next_seat: 1,
            ..Default::default()
        };
        for event in events {
            r.apply(event);
        }
        r
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::MovieCreated { id, name } => {
                self.movies.insert(*id, Movie { id: *id, name: name.clone() });
                self.next_movie = self.next_movie.max(id + 1);
            }
            Event::MovieDeleted { id } => {
                self.movies.remove(id);
            }
            Event::UserCreated { id, email, name } => {
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        email: email.clone(),
                        name: name.clone(),
                    },
                );
                self.next_user = self.next_user.max(id + 1);
            }
            Event::UserDeleted { id } => {
                self.users.remove(id);
                for seat in self.seats.values_mut() {
                    if seat.claimed_by == Some(*id) {
                        seat.claimed_by = None;
                    }
                }
            }
            Event::SeatCreated {
                id,
                movie_id,
                claimed_by,
                version,
            } => {
                self.seats.insert(
                    *id,
                    Seat {
                        id: *id,
                        movie_id: *movie_id,
                        claimed_by: *claimed_by,
                        version: *version,
                    },
                );
                self.next_seat = self.next_seat.max(id + 1);
            }
            Event::SeatClaimed { id, owner_id, version } => {
                if let Some(seat) = self.seats.get_mut(id) {
                    seat.claimed_by = Some(*owner_id);
                    seat.version = *version;
                }
            }
            Event::IdsReserved { movie, user, seat } => {
                self.next_movie = self.next_movie.max(*movie);
                self.next_user = self.next_user.max(*user);
                self.next_seat = self.next_seat.max(*seat);
            }
        }
    }

    fn install(self, inner: &Inner) {
        for (id, movie) in self.movies {
            inner.movie_names.insert(movie.name.clone(), id);
            inner.movie_seats.entry(id).or_default();
            inner.movies.insert(id, movie);
        }
        for (id, user) in self.users {
            inner.emails.insert(user.email.clone(), id);
            inner.users.insert(id, user);
        }
        // BTreeMap order keeps each movie's seat list ascending.
        for (id, seat) in self.seats {
            inner.movie_seats.entry(seat.movie_id).or_default().push(id);
            inner.seats.insert(id, Arc::new(SeatRow::new(seat)));
        }
        inner.next_movie.store(self.next_movie, Ordering::SeqCst);
        inner.next_user.store(self.next_user, Ordering::SeqCst);
        inner.next_seat.store(self.next_seat, Ordering::SeqCst);
    }
}
