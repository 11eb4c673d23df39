use std::time::Duration;

pub const MAX_MOVIE_NAME_LEN: usize = 256;
pub const MAX_USER_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;

/// Upper bound on optimistic retries. Retry is never unbounded.
pub const MAX_CLAIM_RETRIES: u32 = 100;

/// Upper bound on a single transaction's lifetime (lock wait + hold + commit).
pub const MAX_TX_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_millis(5000);
