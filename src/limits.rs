//! Hard caps on untrusted input. Every value arriving over the wire is checked
//! against one of these before it reaches the ledger.

/// Longest service duration or slot step, in minutes (one day).
pub const MAX_SLOT_MINUTES: i64 = 24 * 60;

/// Max bookings (any status) kept in a single provider/date ledger.
pub const MAX_BOOKINGS_PER_DAY: usize = 10_000;

pub const MAX_PROVIDERS: usize = 100_000;
pub const MAX_SERVICES: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2048;

/// Max rows returned by a single `SELECT ... FROM bookings`.
pub const MAX_QUERY_ROWS: usize = 10_000;
