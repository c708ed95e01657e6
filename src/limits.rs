// Hard caps protecting the in-memory store and the WAL.

pub const MAX_LISTINGS: usize = 100_000;
pub const MAX_ROOM_TYPES_PER_LISTING: usize = 256;
pub const MAX_ROOMS_PER_ROOM_TYPE: usize = 4_096;
pub const MAX_RESERVATIONS_PER_UNIT: usize = 50_000;

pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_PLACE_LEN: usize = 128;
pub const MAX_ROOM_NUMBER_LEN: usize = 32;

/// Longest single stay, in days (both ends counted).
pub const MAX_STAY_DAYS: i64 = 366;

/// Widest availability query, in days (both ends counted).
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3 * 366;
