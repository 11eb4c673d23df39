use crate::model::*;

/// Result of one read-then-write cycle of the version stamp protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Claimed { seat_id: SeatId, version: Version },
    NoSeatAvailable,
    /// The conditional write matched zero rows: someone moved the version
    /// between our read and our write.
    Conflict { seat_id: SeatId, expected_version: Version },
}

/// Result of one lock-hold transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockedOutcome {
    Claimed { version: Version },
    /// We waited for the row lock and the committed row no longer matched.
    ConflictAfterWait { seen_version: Version },
    /// The seat was already claimed when we read it; no lock was taken.
    AlreadyClaimed { owner_id: UserId },
    TimedOut,
}

/// A successful claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub seat_id: SeatId,
    pub owner_id: UserId,
    pub version: Version,
    /// Read-then-write cycles used, 1 when the first attempt won.
    pub attempts: u32,
}

/// What a caller sees. Store faults are the `Err` side of the surrounding
/// `Result`, never one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Success(Claim),
    Conflict { seat_id: SeatId },
    Exhausted,
    Timeout { seat_id: SeatId },
}

impl ClaimOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ClaimOutcome::Success(_))
    }

    pub fn claim(&self) -> Option<&Claim> {
        match self {
            ClaimOutcome::Success(claim) => Some(claim),
            _ => None,
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::Success(_) => "success",
            ClaimOutcome::Conflict { .. } => "conflict",
            ClaimOutcome::Exhausted => "exhausted",
            ClaimOutcome::Timeout { .. } => "timeout",
        }
    }
}

impl std::fmt::Display for ClaimOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimOutcome::Success(c) => {
                write!(f, "seat {} claimed by user {} (version {})", c.seat_id, c.owner_id, c.version)
            }
            ClaimOutcome::Conflict { .. } => write!(f, "someone else got it first"),
            ClaimOutcome::Exhausted => write!(f, "no seats available"),
            ClaimOutcome::Timeout { .. } => write!(f, "timed out waiting for the seat lock"),
        }
    }
}
