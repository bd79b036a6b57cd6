use ulid::Ulid;

use crate::model::*;

use super::{Store, StorageError};

impl Store {
    /// Every room, in id order.
    pub fn all_rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.room_directory.iter().map(|e| e.value().clone()).collect();
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    pub fn get_room(&self, id: &Ulid) -> Option<Room> {
        self.room_directory.get(id).map(|e| e.value().clone())
    }

    /// Restrictions on any room overlapping `span`, grouped by room.
    pub async fn restrictions_overlapping(&self, span: &DateSpan) -> Result<Vec<RoomRestriction>, StorageError> {
        let at = self.start_clock();
        let room_states: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut hits = Vec::new();
        for rs in room_states {
            let guard = self.within(at, rs.read()).await?;
            hits.extend(guard.overlapping(span).cloned());
        }
        Ok(hits)
    }

    pub async fn restrictions_for_room_in_range(
        &self,
        room_id: Ulid,
        span: &DateSpan,
    ) -> Result<Vec<RoomRestriction>, StorageError> {
        let at = self.start_clock();
        let rs = self.get_room_state(&room_id).ok_or(StorageError::NotFound(room_id))?;
        let guard = self.within(at, rs.read()).await?;
        Ok(guard.overlapping(span).cloned().collect())
    }

    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    /// All reservations, earliest arrival first.
    pub fn all_reservations(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> = self.reservations.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| (r.span.start, r.id));
        all
    }

    /// Reservations staff have not yet processed.
    pub fn new_reservations(&self) -> Vec<Reservation> {
        let mut fresh: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| !r.processed)
            .map(|r| r.value().clone())
            .collect();
        fresh.sort_by_key(|r| (r.span.start, r.id));
        fresh
    }
}
