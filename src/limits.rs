//! Hard caps on engine inputs. Requests beyond these are rejected, not truncated.

pub const MAX_TABLES: usize = 1_000;
pub const MAX_TABLES_PER_RESERVATION: usize = 16;
pub const MAX_INTERVALS_PER_TABLE: usize = 100_000;

pub const MAX_LABEL_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;

/// Longest single reservation window (a full service day).
pub const MAX_SPAN_DURATION_MS: i64 = 24 * 3_600_000;
