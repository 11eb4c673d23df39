use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use seatclaim::claim::{ClaimOutcome, ClaimPolicy, Claimer, LockHold};
use seatclaim::limits::MAX_CLAIM_RETRIES;
use seatclaim::model::{MovieId, UserId};
use seatclaim::store::{MemoryStore, SeatStore};

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

#[derive(Default)]
struct Tally {
    success: usize,
    conflict: usize,
    exhausted: usize,
    timeout: usize,
    attempts: u64,
}

impl Tally {
    fn add(&mut self, outcome: &ClaimOutcome) {
        match outcome {
            ClaimOutcome::Success(claim) => {
                self.success += 1;
                self.attempts += u64::from(claim.attempts);
            }
            ClaimOutcome::Conflict { .. } => self.conflict += 1,
            ClaimOutcome::Exhausted => self.exhausted += 1,
            ClaimOutcome::Timeout { .. } => self.timeout += 1,
        }
    }

    fn print(&self) {
        let avg_attempts = if self.success == 0 {
            0.0
        } else {
            self.attempts as f64 / self.success as f64
        };
        println!(
            "    success={}, conflict={}, exhausted={}, timeout={}, attempts/success={avg_attempts:.2}",
            self.success, self.conflict, self.exhausted, self.timeout
        );
    }
}

async fn setup(store: &MemoryStore, seats: usize, users: usize) -> (MovieId, Vec<UserId>) {
    let run = Ulid::new();
    let movie = store.create_movie(&format!("bench-{run}")).await.unwrap();
    for _ in 0..seats {
        store.create_seat(movie.id).await.unwrap();
    }
    let mut owners = Vec::with_capacity(users);
    for i in 0..users {
        let user = store
            .create_user(&format!("u{i}-{run}@example.com"), None)
            .await
            .unwrap();
        owners.push(user.id);
    }
    (movie.id, owners)
}

async fn phase1_sequential(store: &MemoryStore) {
    let n = 2000;
    let (movie_id, owners) = setup(store, n, 1).await;
    let claimer = Claimer::new(Arc::new(store.clone()), ClaimPolicy::default());

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for _ in 0..n {
        let t = Instant::now();
        claimer.claim_optimistic(movie_id, owners[0], 0).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} claims in {:.2}s ({:.0} claims/s)",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("uncontended claim", &mut latencies);
}

async fn phase2_optimistic_contention(store: &MemoryStore) {
    let seats = 200;
    let claimers = 64;
    let (movie_id, owners) = setup(store, seats, claimers).await;
    let claimer = Claimer::new(Arc::new(store.clone()), ClaimPolicy::default());

    let start = Instant::now();
    let mut handles = Vec::new();
    for owner in owners {
        let claimer = claimer.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::new();
            let mut tally = Tally::default();
            loop {
                let t = Instant::now();
                let outcome = claimer
                    .claim_optimistic(movie_id, owner, MAX_CLAIM_RETRIES)
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
                tally.add(&outcome);
                if outcome == ClaimOutcome::Exhausted {
                    break;
                }
            }
            (latencies, tally)
        }));
    }

    let mut all_latencies = Vec::new();
    let mut total = Tally::default();
    for h in handles {
        let (latencies, tally) = h.await.unwrap();
        all_latencies.extend(latencies);
        total.success += tally.success;
        total.conflict += tally.conflict;
        total.exhausted += tally.exhausted;
        total.timeout += tally.timeout;
        total.attempts += tally.attempts;
    }
    println!(
        "  {claimers} claimers drained {seats} seats in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    total.print();
    assert_eq!(total.success, seats, "every seat claimed exactly once");
    print_latency("optimistic claim", &mut all_latencies);
}

async fn phase3_pessimistic_hot_seat(store: &MemoryStore) {
    let rounds = 100;
    let claimers = 16;
    let (movie_id, owners) = setup(store, rounds, claimers).await;
    let claimer = Claimer::new(Arc::new(store.clone()), ClaimPolicy::default());

    let start = Instant::now();
    let mut all_latencies = Vec::new();
    let mut total = Tally::default();
    for _ in 0..rounds {
        let Some(seat) = store.find_unclaimed_seat(movie_id).await.unwrap() else {
            break;
        };
        let seat_id = seat.id;
        let mut handles = Vec::new();
        for &owner in &owners {
            let claimer = claimer.clone();
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                let outcome = claimer
                    .claim_pessimistic_with(seat_id, owner, LockHold::default())
                    .await
                    .unwrap();
                (t.elapsed(), outcome)
            }));
        }
        for h in handles {
            let (latency, outcome) = h.await.unwrap();
            all_latencies.push(latency);
            total.add(&outcome);
        }
    }
    println!(
        "  {rounds} rounds x {claimers} claimers on one seat in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    total.print();
    print_latency("lock-hold claim", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    println!("=== seatclaim contention benchmark ===\n");

    let dir = std::env::temp_dir().join(format!("seatclaim_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    for (label, store) in [
        ("ephemeral", MemoryStore::ephemeral()),
        ("durable", MemoryStore::open(&dir.join("bench.wal")).unwrap()),
    ] {
        println!("--- {label} store ---");

        println!("\n[phase 1] sequential optimistic claims");
        phase1_sequential(&store).await;

        println!("\n[phase 2] optimistic contention");
        phase2_optimistic_contention(&store).await;

        println!("\n[phase 3] lock-hold contention on a hot seat");
        phase3_pessimistic_hot_seat(&store).await;

        store.close().await.unwrap();
        println!();
    }

    let _ = std::fs::remove_dir_all(&dir);
    println!("=== benchmark complete ===");
}
