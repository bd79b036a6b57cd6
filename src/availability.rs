use std::collections::HashSet;

use ulid::Ulid;

use crate::model::{DateSpan, Room, RoomRestriction};
use crate::repository::Repository;
use crate::store::StorageError;

/// Half-open overlap: a restriction ending on the query's first day, or
/// starting on its checkout day, does not count.
pub fn overlaps(restriction: &DateSpan, query: &DateSpan) -> bool {
    restriction.start < query.end && query.start < restriction.end
}

pub fn room_is_free(restrictions: &[RoomRestriction], room_id: Ulid, query: &DateSpan) -> bool {
    !restrictions
        .iter()
        .any(|r| r.room_id == room_id && overlaps(&r.span, query))
}

/// All rooms minus every room referenced by an overlapping restriction.
/// One pass over `restrictions`, one over `rooms`; input order is preserved.
pub fn free_rooms_from(rooms: &[Room], restrictions: &[RoomRestriction], query: &DateSpan) -> Vec<Room> {
    let taken: HashSet<Ulid> = restrictions
        .iter()
        .filter(|r| overlaps(&r.span, query))
        .map(|r| r.room_id)
        .collect();
    rooms.iter().filter(|room| !taken.contains(&room.id)).cloned().collect()
}

pub async fn is_room_free<R: Repository + ?Sized>(
    repo: &R,
    room_id: Ulid,
    query: DateSpan,
) -> Result<bool, StorageError> {
    let restrictions = repo.restrictions_for_room_in_range(room_id, query).await?;
    Ok(room_is_free(&restrictions, room_id, &query))
}

pub async fn free_rooms<R: Repository + ?Sized>(repo: &R, query: DateSpan) -> Result<Vec<Room>, StorageError> {
    let rooms = repo.all_rooms().await?;
    let restrictions = repo.restrictions_overlapping(query).await?;
    let free = free_rooms_from(&rooms, &restrictions, &query);
    metrics::counter!(crate::observability::AVAILABILITY_QUERIES_TOTAL).increment(1);
    tracing::debug!(%query, rooms = rooms.len(), free = free.len(), "availability computed");
    Ok(free)
}
