//! Hard bounds on request shapes. Violations surface as
//! `EngineError::LimitExceeded` before any state is touched.

/// Longest date range a single bulk-generation call may cover, inclusive.
pub const MAX_RANGE_DAYS: i64 = 366;

/// Upper bound on per-slot capacity (mirrors the config bound below).
pub const MAX_CAPACITY: u32 = 100;

/// Active + inactive configs a single provider may hold.
pub const MAX_CONFIGS_PER_PROVIDER: usize = 256;

/// Serialized size of a config's metadata object, in bytes.
pub const MAX_METADATA_BYTES: usize = 4096;

/// IANA-style timezone identifiers are short; anything longer is garbage.
pub const MAX_TIMEZONE_LEN: usize = 64;

/// Page size cap for the query engine.
pub const MAX_PAGE_SIZE: usize = 500;

/// Recurrence exception lists beyond this are almost certainly a bug upstream.
pub const MAX_RECURRENCE_EXCEPTIONS: usize = 366;
