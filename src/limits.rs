use crate::model::{DAY_MS, HOUR_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MIN_RENTAL_DURATION_MS: Ms = DAY_MS;
pub const MIN_RESERVATION_DURATION_MS: Ms = HOUR_MS;
/// Longest single booking window (two years).
pub const MAX_BOOKING_SPAN_MS: Ms = 730 * DAY_MS;
/// Widest window accepted by search queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 3 * 365 * DAY_MS;

pub const MAX_CARS: usize = 100_000;
pub const MAX_BOOKINGS_PER_CAR: usize = 50_000;
pub const MAX_NAME_LEN: usize = 256;
