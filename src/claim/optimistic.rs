use tracing::debug;

use crate::model::*;
use crate::store::{SeatStore, StoreError};

use super::AttemptOutcome;

/// One read-then-write cycle of the version stamp protocol.
///
/// Reads the lowest free seat of `movie_id`, then issues the conditional
/// update guarded by the version it read. No lock is held between the two
/// steps; a lost race shows up as zero rows affected and is reported as
/// `Conflict`. This function never retries.
pub async fn attempt_claim<S>(store: &S, movie_id: MovieId, owner_id: UserId) -> Result<AttemptOutcome, StoreError>
where
    S: SeatStore + ?Sized,
{
    let Some(snapshot) = store.find_unclaimed_seat(movie_id).await? else {
        debug!(movie_id, owner_id, "no unclaimed seat");
        return Ok(AttemptOutcome::NoSeatAvailable);
    };

    let rows = store
        .claim_if_version(snapshot.id, snapshot.version, owner_id)
        .await?;
    if rows == 0 {
        debug!(
            seat_id = snapshot.id,
            expected_version = snapshot.version,
            owner_id,
            "version moved between read and write"
        );
        return Ok(AttemptOutcome::Conflict {
            seat_id: snapshot.id,
            expected_version: snapshot.version,
        });
    }

    Ok(AttemptOutcome::Claimed {
        seat_id: snapshot.id,
        version: snapshot.version + 1,
    })
}
