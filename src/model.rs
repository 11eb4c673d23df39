use serde::{Deserialize, Serialize};

pub type MovieId = i64;
pub type UserId = i64;
pub type SeatId = i64;

/// Monotonic per-seat counter, bumped by exactly one on every claim.
pub type Version = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    pub id: MovieId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: Option<String>,
}

/// A claimable seat. `claimed_by == None` means the seat is free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub id: SeatId,
    pub movie_id: MovieId,
    pub claimed_by: Option<UserId>,
    pub version: Version,
}

impl Seat {
    pub fn new(id: SeatId, movie_id: MovieId) -> Self {
        Self {
            id,
            movie_id,
            claimed_by: None,
            version: 0,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    /// The row as it looks after `owner` claims it.
    pub fn claimed(&self, owner: UserId) -> Self {
        Self {
            claimed_by: Some(owner),
            version: self.version + 1,
            ..self.clone()
        }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MovieCreated {
        id: MovieId,
        name: String,
    },
    MovieDeleted {
        id: MovieId,
    },
    UserCreated {
        id: UserId,
        email: String,
        name: Option<String>,
    },
    /// Also nullifies every claim held by the user.
    UserDeleted {
        id: UserId,
    },
    /// Fresh seats carry `claimed_by: None, version: 0`; compaction writes
    /// the current row instead.
    SeatCreated {
        id: SeatId,
        movie_id: MovieId,
        claimed_by: Option<UserId>,
        version: Version,
    },
    SeatClaimed {
        id: SeatId,
        owner_id: UserId,
        version: Version,
    },
    /// Id high-water marks, so compaction never lets an id be reused.
    IdsReserved {
        movie: MovieId,
        user: UserId,
        seat: SeatId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_seat_is_free_at_version_zero() {
        let seat = Seat::new(7, 1);
        assert!(!seat.is_claimed());
        assert_eq!(seat.version, 0);
    }

    #[test]
    fn claimed_bumps_version_by_one() {
        let seat = Seat::new(7, 1);
        let claimed = seat.claimed(42);
        assert_eq!(claimed.claimed_by, Some(42));
        assert_eq!(claimed.version, 1);
        assert_eq!(claimed.id, 7);
        assert_eq!(claimed.movie_id, 1);
        // The snapshot itself is untouched.
        assert!(!seat.is_claimed());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SeatClaimed {
            id: 3,
            owner_id: 9,
            version: 4,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
