use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use ulid::Ulid;

use seatclaim::claim::{ClaimPolicy, Claimer, LockHold};
use seatclaim::config::Config;
use seatclaim::store::{MemoryStore, SeatStore};

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    seatclaim::observability::init(config.metrics_port)?;

    let (store, durable) = open_store(&config).await?;
    info!("  isolation: {:?}, tx timeout: {:?}", config.tx.isolation, config.tx.timeout);
    info!("  max retries: {}", config.max_retries);

    let claimer = Claimer::new(store.clone(), ClaimPolicy::from_config(&config));

    // Names are unique per run so the demo can be replayed against the same data.
    let run = Ulid::new();
    let movie = store.create_movie(&format!("Hidden Figures ({run})")).await?;
    let x = store.create_user(&format!("x-{run}@example.com"), Some("X")).await?;
    let y = store.create_user(&format!("y-{run}@example.com"), Some("Y")).await?;

    // Version stamp race: two requesters, one seat.
    let seat = store.create_seat(movie.id).await?;
    info!("optimistic race on seat {} (version {})", seat.id, seat.version);
    let (rx, ry) = tokio::join!(
        claimer.claim_optimistic_default(movie.id, x.id),
        claimer.claim_optimistic_default(movie.id, y.id),
    );
    info!("  X: {}", rx?);
    info!("  Y: {}", ry?);

    // Lock-hold race: X holds the row lock, Y arrives 500ms later and waits.
    let seat = store.create_seat(movie.id).await?;
    let hold = if config.hold.is_zero() {
        Duration::from_secs(2)
    } else {
        config.hold
    };
    info!("pessimistic race on seat {} (X holds for {hold:?})", seat.id);
    let holder = claimer.clone();
    let params = LockHold::new(config.tx).with_hold(hold);
    let (seat_id, x_id) = (seat.id, x.id);
    let x_task = tokio::spawn(async move { holder.claim_pessimistic_with(seat_id, x_id, params).await });
    tokio::time::sleep(Duration::from_millis(500)).await;
    let y_outcome = claimer
        .claim_pessimistic(seat.id, y.id, config.tx.isolation, config.tx.timeout)
        .await?;
    info!("  X: {}", x_task.await??);
    info!("  Y: {y_outcome}");

    let final_row = store.get_seat(seat.id).await?;
    if let Some(row) = final_row {
        info!("  final: owner {:?}, version {}", row.claimed_by, row.version);
    }

    if let Some(durable) = durable {
        durable.close().await?;
    }
    Ok(())
}

/// PostgreSQL when `SEATCLAIM_PG_URL` is set and the feature is built in,
/// otherwise the WAL-backed store under the data dir with its compactor.
async fn open_store(config: &Config) -> Result<(Arc<dyn SeatStore>, Option<MemoryStore>), BoxError> {
    #[cfg(feature = "postgres")]
    {
        if let Some(url) = &config.pg_url {
            let store = seatclaim::store::PgStore::connect(url).await?;
            info!("seatclaim demo");
            info!("  store: postgres");
            return Ok((Arc::new(store), None));
        }
    }
    #[cfg(not(feature = "postgres"))]
    {
        if config.pg_url.is_some() {
            tracing::warn!("SEATCLAIM_PG_URL ignored: built without the postgres feature");
        }
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("seatclaim.wal");
    let store = MemoryStore::open(&wal_path)?;
    info!("seatclaim demo");
    info!("  wal: {}", wal_path.display());

    let compactor_store = store.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        seatclaim::compactor::run_compactor(compactor_store, threshold).await;
    });

    Ok((Arc::new(store.clone()), Some(store)))
}
