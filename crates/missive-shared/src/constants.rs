/// Application name
pub const APP_NAME: &str = "Missive";

/// Maximum number of entries held by the offline queue
pub const MAX_QUEUE: usize = 3;

/// Automatic retry budget per queued message
pub const MAX_RETRIES: u32 = 3;

/// First retry delay in milliseconds (doubles per attempt)
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for the retry delay in milliseconds
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// Bounded wait for a single send attempt in milliseconds
pub const ATTEMPT_TIMEOUT_MS: u64 = 10_000;

/// Capacity of the UI event broadcast channel
pub const EVENT_BUFFER: usize = 256;

/// Failure reason attached to a message pushed out of a full queue
pub const REASON_QUEUE_EVICTED: &str = "queue capacity exceeded";

/// Failure reason attached to a queued message whose retry budget ran out
pub const REASON_RETRIES_EXHAUSTED: &str = "retry limit reached";

/// Failure reason attached to a send that was in flight when the process died
pub const REASON_INTERRUPTED: &str = "interrupted before acknowledgement";

/// Prefix for identifiers assigned by the in-memory backend
pub const SERVER_ID_PREFIX: &str = "srv-";
