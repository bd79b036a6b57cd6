//! Hard caps that keep a single store bounded.

pub const MAX_ROOMS: usize = 1_000;
pub const MAX_ROOM_NAME_LEN: usize = 128;
/// Longest stay a guest may request, in nights.
pub const MAX_STAY_NIGHTS: i64 = 90;
pub const MAX_RESTRICTIONS_PER_ROOM: usize = 100_000;
/// Longest accepted value for any single guest form field.
pub const MAX_FIELD_LEN: usize = 255;
/// Additions plus removals accepted in one calendar submission.
pub const MAX_CALENDAR_EDITS: usize = 2_000;
